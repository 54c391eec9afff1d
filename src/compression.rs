use flate2::{
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
    Compression as Level,
};
use std::io::{Read, Write};
use std::sync::Arc;

/// A per-message compressor keyed by its `grpc-encoding` name.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &'static str;
    fn compress(&self, input: &[u8]) -> std::io::Result<Vec<u8>>;
    fn decompress(&self, input: &[u8]) -> std::io::Result<Vec<u8>>;
}

pub struct Gzip;

impl Compressor for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Level::default());
        encoder.write_all(input)?;
        encoder.finish()
    }

    fn decompress(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut output = Vec::new();
        GzDecoder::new(input).read_to_end(&mut output)?;
        Ok(output)
    }
}

pub struct Deflate;

impl Compressor for Deflate {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn compress(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Level::default());
        encoder.write_all(input)?;
        encoder.finish()
    }

    fn decompress(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut output = Vec::new();
        ZlibDecoder::new(input).read_to_end(&mut output)?;
        Ok(output)
    }
}

/// Maps encoding names to compressors. `identity` is implicit and never
/// registered.
#[derive(Clone)]
pub struct CompressionRegistry {
    entries: Vec<Arc<dyn Compressor>>,
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        Self {
            entries: vec![Arc::new(Gzip), Arc::new(Deflate)],
        }
    }
}

impl CompressionRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        self.entries.retain(|c| c.name() != compressor.name());
        self.entries.push(compressor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Compressor>> {
        if name == "identity" {
            return None;
        }
        self.entries.iter().find(|c| c.name() == name).cloned()
    }

    pub fn supports(&self, name: &str) -> bool {
        name == "identity" || self.entries.iter().any(|c| c.name() == name)
    }

    /// `grpc-accept-encoding` advertisement.
    pub fn accept_encoding(&self) -> String {
        let mut names: Vec<&str> = self.entries.iter().map(|c| c.name()).collect();
        names.push("identity");
        names.join(",")
    }

    /// First locally supported algorithm out of the peer's comma-separated
    /// `grpc-accept-encoding` list.
    pub fn negotiate(&self, peer_accept: &str) -> Option<&'static str> {
        peer_accept
            .split(',')
            .map(str::trim)
            .filter(|name| *name != "identity")
            .find_map(|name| self.entries.iter().find(|c| c.name() == name))
            .map(|c| c.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let input = b"hello hello hello hello hello".repeat(10);
        let compressed = Gzip.compress(&input).unwrap();
        assert!(compressed.len() < input.len());
        assert_eq!(Gzip.decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn deflate_round_trip() {
        let input = b"sufficiently repetitive input ".repeat(8);
        let compressed = Deflate.compress(&input).unwrap();
        assert_eq!(Deflate.decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn corrupt_input_is_an_error() {
        assert!(Gzip.decompress(b"definitely not gzip").is_err());
    }

    #[test]
    fn negotiation() {
        let registry = CompressionRegistry::default();
        assert_eq!(registry.negotiate("gzip,deflate"), Some("gzip"));
        assert_eq!(registry.negotiate("identity, deflate"), Some("deflate"));
        assert_eq!(registry.negotiate("identity"), None);
        assert_eq!(registry.negotiate("snappy"), None);
        assert!(registry.supports("identity"));
        assert!(!registry.supports("snappy"));
    }
}
