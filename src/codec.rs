use crate::status::Status;
use bytes::Bytes;

/// Serialises message values to and from bytes. The codec name participates
/// in the `application/grpc+<name>` content-type suffix.
pub trait Codec<T>: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn encode(&self, value: &T) -> Result<Bytes, Status>;
    fn decode(&self, bytes: Bytes) -> Result<T, Status>;
}

/// Passes raw bytes through untouched, for callers that run their own
/// serialiser (a generated protobuf layer, typically).
#[derive(Debug, Clone, Copy)]
pub struct RawCodec {
    name: &'static str,
}

impl RawCodec {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Default for RawCodec {
    fn default() -> Self {
        Self::new("proto")
    }
}

impl Codec<Bytes> for RawCodec {
    fn name(&self) -> &'static str {
        self.name
    }

    fn encode(&self, value: &Bytes) -> Result<Bytes, Status> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: Bytes) -> Result<Bytes, Status> {
        Ok(bytes)
    }
}

#[cfg(feature = "json")]
pub use self::json::JsonCodec;

#[cfg(feature = "json")]
mod json {
    use super::{Bytes, Codec, Status};
    use serde::{de::DeserializeOwned, Serialize};
    use std::marker::PhantomData;

    pub struct JsonCodec<T> {
        _marker: PhantomData<fn() -> T>,
    }

    impl<T> JsonCodec<T> {
        pub const fn new() -> Self {
            Self {
                _marker: PhantomData,
            }
        }
    }

    impl<T> Default for JsonCodec<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<T> Clone for JsonCodec<T> {
        fn clone(&self) -> Self {
            Self::new()
        }
    }

    impl<T> Codec<T> for JsonCodec<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        fn name(&self) -> &'static str {
            "json"
        }

        fn encode(&self, value: &T) -> Result<Bytes, Status> {
            serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|err| Status::internal(format!("message encoding failed: {err}")))
        }

        fn decode(&self, bytes: Bytes) -> Result<T, Status> {
            serde_json::from_slice(&bytes)
                .map_err(|err| Status::internal(format!("message decoding failed: {err}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codec_is_identity() {
        let codec = RawCodec::default();
        let payload = Bytes::from_static(b"\x00\x01payload");
        assert_eq!(codec.encode(&payload).unwrap(), payload);
        assert_eq!(codec.decode(payload.clone()).unwrap(), payload);
        assert_eq!(codec.name(), "proto");
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_codec_round_trip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Greeting {
            name: String,
        }

        let codec = JsonCodec::<Greeting>::new();
        let value = Greeting {
            name: "World".to_owned(),
        };
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(bytes).unwrap(), value);
        assert_eq!(codec.name(), "json");
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_codec_rejects_garbage() {
        #[derive(Debug, serde::Serialize, serde::Deserialize)]
        struct Greeting {
            name: String,
        }

        let codec = JsonCodec::<Greeting>::new();
        let err = codec.decode(Bytes::from_static(b"{broken")).unwrap_err();
        assert_eq!(err.code(), crate::status::Code::Internal);
    }
}
