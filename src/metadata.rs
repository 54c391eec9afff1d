use crate::status::Status;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Protocol-owned header names that user metadata may never use.
const RESERVED_NAMES: &[&str] = &["te", "content-type", "user-agent"];

const MAX_TIMEOUT_DIGITS: u64 = 99_999_999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Ascii(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Ascii(value)
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value.into())
    }
}

/// User-extensible ordered key/value headers, distinct from protocol-owned
/// headers. Keys are lowercase ASCII; `-bin` keys carry raw bytes and travel
/// base64-coded on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'))
}

fn reserved_key(key: &str) -> bool {
    key.starts_with(':') || key.starts_with("grpc-") || RESERVED_NAMES.contains(&key)
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a key/value pair. Keys owned by the protocol layer and
    /// malformed keys are rejected.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Result<(), Status> {
        let key = key.into();
        let value = value.into();
        if !valid_key(&key) {
            return Err(Status::internal(format!("invalid metadata key {key:?}")));
        }
        if reserved_key(&key) {
            return Err(Status::internal(format!(
                "metadata key {key:?} is owned by the protocol"
            )));
        }
        match &value {
            MetadataValue::Ascii(text) => {
                if key.ends_with("-bin") {
                    return Err(Status::internal(format!(
                        "metadata key {key:?} requires a binary value"
                    )));
                }
                if !text.bytes().all(|b| (0x20..0x7f).contains(&b)) {
                    return Err(Status::internal(format!(
                        "metadata value for {key:?} is not printable ASCII"
                    )));
                }
            }
            MetadataValue::Binary(_) => {
                if !key.ends_with("-bin") {
                    return Err(Status::internal(format!(
                        "binary metadata key {key:?} must end with -bin"
                    )));
                }
            }
        }
        self.entries.push((key, value));
        Ok(())
    }

    /// First ASCII value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|(k, v)| match v {
            MetadataValue::Ascii(text) if k == key => Some(text.as_str()),
            _ => None,
        })
    }

    /// First binary value for `key`, if any.
    pub fn get_bin(&self, key: &str) -> Option<&Bytes> {
        self.entries.iter().find_map(|(k, v)| match v {
            MetadataValue::Binary(bytes) if k == key => Some(bytes),
            _ => None,
        })
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, MetadataValue)> {
        self.entries.iter()
    }

    /// Serialises every entry in insertion order.
    pub fn to_wire(&self) -> Vec<(Bytes, Bytes)> {
        self.entries
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    MetadataValue::Ascii(text) => Bytes::copy_from_slice(text.as_bytes()),
                    MetadataValue::Binary(bytes) => {
                        base64::encode_config(bytes, base64::STANDARD_NO_PAD).into()
                    }
                };
                (Bytes::copy_from_slice(key.as_bytes()), value)
            })
            .collect()
    }

    /// Collects user metadata out of a decoded header list, skipping
    /// pseudo-headers and protocol-owned names. Undecodable `-bin` values are
    /// dropped rather than failing the stream.
    pub fn from_wire<'a>(headers: impl IntoIterator<Item = &'a (Bytes, Bytes)>) -> Self {
        let mut metadata = Self::new();
        for (key, value) in headers {
            let Ok(key) = std::str::from_utf8(key) else {
                continue;
            };
            if reserved_key(key) || !valid_key(key) {
                continue;
            }
            if key.ends_with("-bin") {
                let trimmed = value
                    .iter()
                    .rposition(|&b| b != b'=')
                    .map_or(&value[..0], |end| &value[..=end]);
                if let Ok(decoded) = base64::decode_config(trimmed, base64::STANDARD_NO_PAD) {
                    metadata
                        .entries
                        .push((key.to_owned(), MetadataValue::Binary(decoded.into())));
                }
            } else if let Ok(text) = std::str::from_utf8(value) {
                metadata
                    .entries
                    .push((key.to_owned(), MetadataValue::Ascii(text.to_owned())));
            }
        }
        metadata
    }
}

/// An absolute point in monotonic time by which the RPC must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    pub fn from_timeout(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn time_remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.time_remaining() == Duration::ZERO
    }
}

/// Serialises a timeout as `grpc-timeout`, using the smallest unit that keeps
/// the value within 8 decimal digits. Rounds up so a deadline is never
/// shortened by coding.
pub fn encode_timeout(timeout: Duration) -> String {
    let nanos = timeout.as_nanos();
    for (unit, scale) in [
        ('n', 1u128),
        ('u', 1_000),
        ('m', 1_000_000),
        ('S', 1_000_000_000),
        ('M', 60 * 1_000_000_000),
        ('H', 3_600 * 1_000_000_000),
    ] {
        let value = (nanos + scale - 1) / scale;
        if value <= u128::from(MAX_TIMEOUT_DIGITS) {
            return format!("{value}{unit}");
        }
    }
    format!("{MAX_TIMEOUT_DIGITS}H")
}

/// Parses a `grpc-timeout` value: 1-8 ASCII digits followed by a unit.
pub fn parse_timeout(raw: &str) -> Option<Duration> {
    if raw.len() < 2 || raw.len() > 9 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    Some(match unit {
        "n" => Duration::from_nanos(value),
        "u" => Duration::from_micros(value),
        "m" => Duration::from_millis(value),
        "S" => Duration::from_secs(value),
        "M" => Duration::from_secs(value * 60),
        "H" => Duration::from_secs(value * 3_600),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_rejected() {
        let mut metadata = Metadata::new();
        assert!(metadata.add("grpc-timeout", "1S").is_err());
        assert!(metadata.add("te", "trailers").is_err());
        assert!(metadata.add("content-type", "application/grpc").is_err());
        assert!(metadata.add("user-agent", "x").is_err());
        assert!(metadata.add(":path", "/x").is_err());
        assert!(metadata.add("UPPER", "x").is_err());
        assert!(metadata.add("", "x").is_err());
    }

    #[test]
    fn binary_suffix_enforced() {
        let mut metadata = Metadata::new();
        assert!(metadata.add("trace-bin", "ascii").is_err());
        assert!(metadata.add("trace", Bytes::from_static(b"\x00\x01")).is_err());
        assert!(metadata.add("trace-bin", Bytes::from_static(b"\x00\x01")).is_ok());
        assert!(metadata.add("trace", "value").is_ok());
    }

    #[test]
    fn wire_round_trip() {
        let mut metadata = Metadata::new();
        metadata.add("x-request-id", "abc123").unwrap();
        metadata.add("trace-bin", Bytes::from_static(&[0, 1, 254, 255])).unwrap();
        metadata.add("x-request-id", "def456").unwrap();

        let decoded = Metadata::from_wire(&metadata.to_wire());
        assert_eq!(decoded, metadata);
        assert_eq!(decoded.get("x-request-id"), Some("abc123"));
        assert_eq!(
            decoded.get_all("x-request-id").count(),
            2,
            "ordering and multiplicity preserved"
        );
        assert_eq!(decoded.get_bin("trace-bin").unwrap().as_ref(), &[0, 1, 254, 255]);
    }

    #[test]
    fn padded_base64_accepted() {
        let headers = vec![(
            Bytes::from_static(b"trace-bin"),
            Bytes::from_static(b"AAH+/w=="),
        )];
        let metadata = Metadata::from_wire(&headers);
        assert_eq!(metadata.get_bin("trace-bin").unwrap().as_ref(), &[0, 1, 254, 255]);
    }

    #[test]
    fn from_wire_skips_protocol_headers() {
        let headers = vec![
            (Bytes::from_static(b":status"), Bytes::from_static(b"200")),
            (Bytes::from_static(b"grpc-status"), Bytes::from_static(b"0")),
            (Bytes::from_static(b"content-type"), Bytes::from_static(b"application/grpc")),
            (Bytes::from_static(b"x-custom"), Bytes::from_static(b"kept")),
        ];
        let metadata = Metadata::from_wire(&headers);
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get("x-custom"), Some("kept"));
    }

    #[test]
    fn timeout_smallest_unit() {
        assert_eq!(encode_timeout(Duration::from_nanos(1)), "1n");
        assert_eq!(encode_timeout(Duration::from_millis(100)), "100000u");
        assert_eq!(encode_timeout(Duration::from_secs(5)), "5000000u");
        // too wide for micros, falls to millis
        assert_eq!(encode_timeout(Duration::from_secs(100)), "100000m");
    }

    #[test]
    fn timeout_parse() {
        assert_eq!(parse_timeout("1n"), Some(Duration::from_nanos(1)));
        assert_eq!(parse_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_timeout("5S"), Some(Duration::from_secs(5)));
        assert_eq!(parse_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_timeout("1H"), Some(Duration::from_secs(3_600)));
        assert_eq!(parse_timeout(""), None);
        assert_eq!(parse_timeout("S"), None);
        assert_eq!(parse_timeout("123456789S"), None, "more than 8 digits");
        assert_eq!(parse_timeout("12x"), None);
    }

    #[test]
    fn timeout_monotone() {
        let mut previous = Duration::ZERO;
        for nanos in [1u64, 999, 1_000, 65_537, 1_000_000, 123_456_789, u64::from(u32::MAX)] {
            let duration = Duration::from_nanos(nanos);
            let parsed = parse_timeout(&encode_timeout(duration)).unwrap();
            assert!(parsed >= duration, "coding never shortens a deadline");
            assert!(parsed >= previous);
            previous = parsed;
        }
    }
}
