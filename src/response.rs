use crate::metadata::Metadata;
use crate::status::{Code, Status};
use crate::types::RawHeaders;
use bytes::Bytes;

/// The parsed head of a gRPC response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub metadata: Metadata,
    /// `grpc-encoding` the server applies to its messages.
    pub message_encoding: Option<String>,
}

fn header(headers: &RawHeaders, name: &str) -> Option<Bytes> {
    headers
        .iter()
        .find(|(key, _)| key.as_ref() == name.as_bytes())
        .map(|(_, value)| value.clone())
}

fn header_str(headers: &RawHeaders, name: &str) -> Option<String> {
    header(headers, name).and_then(|value| String::from_utf8(value.to_vec()).ok())
}

fn content_type(subtype: &str) -> Bytes {
    if subtype == "proto" {
        Bytes::from_static(b"application/grpc")
    } else {
        format!("application/grpc+{subtype}").into()
    }
}

/// Response headers: `:status 200`, content-type, optional encodings, user
/// metadata.
pub fn build_response_headers(
    content_subtype: &str,
    message_encoding: Option<&str>,
    accept_encoding: Option<&str>,
    metadata: &Metadata,
) -> RawHeaders {
    let mut headers: RawHeaders = vec![
        (Bytes::from_static(b":status"), Bytes::from_static(b"200")),
        (
            Bytes::from_static(b"content-type"),
            content_type(content_subtype),
        ),
    ];
    if let Some(encoding) = message_encoding {
        headers.push((
            Bytes::from_static(b"grpc-encoding"),
            Bytes::copy_from_slice(encoding.as_bytes()),
        ));
    }
    if let Some(accept) = accept_encoding {
        headers.push((
            Bytes::from_static(b"grpc-accept-encoding"),
            Bytes::copy_from_slice(accept.as_bytes()),
        ));
    }
    headers.extend(metadata.to_wire());
    headers
}

fn status_fields(status: &Status, headers: &mut RawHeaders) {
    headers.push((
        Bytes::from_static(b"grpc-status"),
        (status.code() as u8).to_string().into(),
    ));
    if let Some(message) = status.encoded_message() {
        headers.push((Bytes::from_static(b"grpc-message"), message.into()));
    }
    if let Some(details) = status.details() {
        headers.push((
            Bytes::from_static(b"grpc-status-details-bin"),
            base64::encode_config(details, base64::STANDARD_NO_PAD).into(),
        ));
    }
}

/// Trailers closing a stream that already sent response headers.
pub fn build_trailers(status: &Status, metadata: &Metadata) -> RawHeaders {
    let mut headers = RawHeaders::new();
    status_fields(status, &mut headers);
    headers.extend(metadata.to_wire());
    headers
}

/// The single HEADERS + END_STREAM shape used to reject a call before any
/// message is produced.
pub fn build_trailers_only(
    status: &Status,
    content_subtype: &str,
    metadata: &Metadata,
) -> RawHeaders {
    let mut headers: RawHeaders = vec![
        (Bytes::from_static(b":status"), Bytes::from_static(b"200")),
        (
            Bytes::from_static(b"content-type"),
            content_type(content_subtype),
        ),
    ];
    status_fields(status, &mut headers);
    headers.extend(metadata.to_wire());
    headers
}

/// A headers-only rejection below the gRPC layer (e.g. 415 for a non-gRPC
/// content-type).
pub fn build_http_reject(http_status: u16) -> RawHeaders {
    vec![(
        Bytes::from_static(b":status"),
        http_status.to_string().into(),
    )]
}

pub fn has_grpc_status(headers: &RawHeaders) -> bool {
    header(headers, "grpc-status").is_some()
}

/// https://grpc.io/docs/guides/status-codes/ HTTP-to-gRPC mapping for
/// responses that never reached the gRPC layer.
fn status_from_http(http_status: u16) -> Status {
    let code = match http_status {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    };
    Status::new(code, format!("HTTP status {http_status}"))
}

/// Validates the response head on the client side.
pub fn parse_response_headers(headers: &RawHeaders) -> Result<ResponseHead, Status> {
    match header_str(headers, ":status").as_deref().map(str::parse) {
        Some(Ok(200u16)) => {}
        Some(Ok(other)) => return Err(status_from_http(other)),
        _ => return Err(Status::internal("missing :status in response")),
    }
    let grpc_content_type = header_str(headers, "content-type")
        .is_some_and(|value| value.starts_with("application/grpc"));
    if !grpc_content_type {
        return Err(Status::unknown("response is not application/grpc"));
    }
    Ok(ResponseHead {
        metadata: Metadata::from_wire(headers),
        message_encoding: header_str(headers, "grpc-encoding"),
    })
}

/// Extracts the terminal status and trailing metadata.
pub fn parse_trailers(headers: &RawHeaders) -> (Status, Metadata) {
    let metadata = Metadata::from_wire(headers);
    let code = match header_str(headers, "grpc-status").as_deref().map(str::parse) {
        Some(Ok(code)) => Code::from_wire(code),
        _ => return (Status::unknown("missing grpc-status in trailers"), metadata),
    };
    let message = header(headers, "grpc-message")
        .map(|raw| Status::decode_message(&raw))
        .unwrap_or_default();
    let details = header(headers, "grpc-status-details-bin").and_then(|raw| {
        let trimmed = raw
            .iter()
            .rposition(|&b| b != b'=')
            .map_or(&raw[..0], |end| &raw[..=end]);
        base64::decode_config(trimmed, base64::STANDARD_NO_PAD)
            .ok()
            .map(Bytes::from)
    });
    let status = match details {
        Some(details) => Status::with_details(code, message, details),
        None => Status::new(code, message),
    };
    (status, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_headers_round_trip() {
        let mut metadata = Metadata::new();
        metadata.add("x-served-by", "unit-test").unwrap();
        let wire = build_response_headers("proto", Some("gzip"), Some("gzip,identity"), &metadata);
        let head = parse_response_headers(&wire).unwrap();
        assert_eq!(head.message_encoding.as_deref(), Some("gzip"));
        assert_eq!(head.metadata.get("x-served-by"), Some("unit-test"));
    }

    #[test]
    fn trailers_round_trip() {
        let status = Status::with_details(
            Code::FailedPrecondition,
            "not ready: 50% done",
            Bytes::from_static(b"\x01\x02"),
        );
        let mut metadata = Metadata::new();
        metadata.add("x-debug", "1").unwrap();
        let wire = build_trailers(&status, &metadata);
        assert!(has_grpc_status(&wire));
        let (parsed, trailing) = parse_trailers(&wire);
        assert_eq!(parsed, status);
        assert_eq!(trailing.get("x-debug"), Some("1"));
    }

    #[test]
    fn ok_trailers_have_no_message() {
        let wire = build_trailers(&Status::ok(), &Metadata::new());
        assert_eq!(wire.len(), 1);
        let (parsed, _) = parse_trailers(&wire);
        assert!(parsed.is_ok());
    }

    #[test]
    fn trailers_only_carries_http_status() {
        let wire = build_trailers_only(
            &Status::unimplemented("no such method"),
            "proto",
            &Metadata::new(),
        );
        assert_eq!(wire[0].0.as_ref(), b":status");
        assert!(has_grpc_status(&wire));
        let head = parse_response_headers(&wire).unwrap();
        assert!(head.message_encoding.is_none());
        let (status, _) = parse_trailers(&wire);
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "no such method");
    }

    #[test]
    fn missing_grpc_status_is_unknown() {
        let (status, _) = parse_trailers(&RawHeaders::new());
        assert_eq!(status.code(), Code::Unknown);
    }

    #[test]
    fn http_error_mapping() {
        let wire = build_http_reject(503);
        let err = parse_response_headers(&wire).unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }
}
