use crate::metadata::{encode_timeout, parse_timeout, Deadline, Metadata};
use crate::status::Status;
use crate::types::RawHeaders;
use bytes::Bytes;

pub const CONTENT_TYPE_GRPC: &str = "application/grpc";
pub const USER_AGENT: &str = concat!("grpc2-rust/", env!("CARGO_PKG_VERSION"));

/// Everything the gRPC layer carries in request headers, either side.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Fully qualified `/pkg.Service/Method` path.
    pub path: String,
    pub authority: String,
    pub scheme: String,
    /// Content-type suffix naming the codec (`proto`, `json`, custom).
    pub content_subtype: String,
    pub metadata: Metadata,
    pub deadline: Option<Deadline>,
    /// `grpc-encoding`: compression applied to outbound messages.
    pub message_encoding: Option<String>,
    /// `grpc-accept-encoding` as sent by the peer.
    pub accept_encoding: Option<String>,
}

/// A request rejected before reaching any handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Answered with a plain HTTP status in a headers-only response.
    Http { status: u16 },
    /// Answered with a trailers-only gRPC status.
    Grpc(Status),
}

fn content_type(subtype: &str) -> String {
    if subtype == "proto" {
        CONTENT_TYPE_GRPC.to_owned()
    } else {
        format!("{CONTENT_TYPE_GRPC}+{subtype}")
    }
}

/// `application/grpc`, optionally followed by `+suffix` naming the codec.
fn parse_content_type(value: &str) -> Option<String> {
    let rest = value.strip_prefix(CONTENT_TYPE_GRPC)?;
    match rest.bytes().next() {
        None => Some("proto".to_owned()),
        Some(b'+') => Some(rest[1..].to_owned()),
        Some(_) => None,
    }
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

impl RpcRequest {
    /// Serialises the request head, pseudo-headers first.
    pub fn to_wire(&self) -> RawHeaders {
        let mut headers: RawHeaders = vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"POST")),
            (
                Bytes::from_static(b":scheme"),
                Bytes::copy_from_slice(self.scheme.as_bytes()),
            ),
            (
                Bytes::from_static(b":path"),
                Bytes::copy_from_slice(self.path.as_bytes()),
            ),
            (
                Bytes::from_static(b":authority"),
                Bytes::copy_from_slice(self.authority.as_bytes()),
            ),
            (Bytes::from_static(b"te"), Bytes::from_static(b"trailers")),
            (
                Bytes::from_static(b"content-type"),
                content_type(&self.content_subtype).into(),
            ),
            (
                Bytes::from_static(b"user-agent"),
                Bytes::from_static(USER_AGENT.as_bytes()),
            ),
        ];
        if let Some(deadline) = &self.deadline {
            headers.push((
                Bytes::from_static(b"grpc-timeout"),
                encode_timeout(deadline.time_remaining()).into(),
            ));
        }
        if let Some(encoding) = &self.message_encoding {
            headers.push((
                Bytes::from_static(b"grpc-encoding"),
                Bytes::copy_from_slice(encoding.as_bytes()),
            ));
        }
        if let Some(accept) = &self.accept_encoding {
            headers.push((
                Bytes::from_static(b"grpc-accept-encoding"),
                Bytes::copy_from_slice(accept.as_bytes()),
            ));
        }
        headers.extend(self.metadata.to_wire());
        headers
    }

    /// Validates and parses a request head received by a server.
    pub fn from_wire(headers: &RawHeaders) -> Result<Self, RequestError> {
        match header_str(headers, ":method").as_deref() {
            Some("POST") => {}
            _ => return Err(RequestError::Http { status: 405 }),
        }
        let content_subtype = header_str(headers, "content-type")
            .as_deref()
            .and_then(parse_content_type)
            .ok_or(RequestError::Http { status: 415 })?;
        if header_str(headers, "te").as_deref() != Some("trailers") {
            return Err(RequestError::Grpc(Status::unimplemented(
                "te: trailers is required",
            )));
        }
        let path = match header_str(headers, ":path") {
            Some(path) if path.starts_with('/') => path,
            _ => return Err(RequestError::Http { status: 400 }),
        };
        let deadline = match header_str(headers, "grpc-timeout") {
            None => None,
            Some(raw) => match parse_timeout(&raw) {
                Some(timeout) => Some(Deadline::from_timeout(timeout)),
                None => {
                    return Err(RequestError::Grpc(Status::internal(format!(
                        "malformed grpc-timeout {raw:?}"
                    ))))
                }
            },
        };
        Ok(Self {
            path,
            authority: header_str(headers, ":authority").unwrap_or_default(),
            scheme: header_str(headers, ":scheme").unwrap_or_else(|| "http".to_owned()),
            content_subtype,
            metadata: Metadata::from_wire(headers),
            deadline,
            message_encoding: header_str(headers, "grpc-encoding"),
            accept_encoding: header_str(headers, "grpc-accept-encoding"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> RpcRequest {
        let mut metadata = Metadata::new();
        metadata.add("x-request-id", "abc").unwrap();
        RpcRequest {
            path: "/helloworld.Greeter/SayHello".to_owned(),
            authority: "localhost:50051".to_owned(),
            scheme: "http".to_owned(),
            content_subtype: "json".to_owned(),
            metadata,
            deadline: Some(Deadline::from_timeout(Duration::from_secs(5))),
            message_encoding: Some("gzip".to_owned()),
            accept_encoding: Some("gzip,deflate,identity".to_owned()),
        }
    }

    #[test]
    fn round_trip() {
        let wire = request().to_wire();
        assert_eq!(wire[0].0.as_ref(), b":method");
        let parsed = RpcRequest::from_wire(&wire).unwrap();
        assert_eq!(parsed.path, "/helloworld.Greeter/SayHello");
        assert_eq!(parsed.authority, "localhost:50051");
        assert_eq!(parsed.content_subtype, "json");
        assert_eq!(parsed.metadata.get("x-request-id"), Some("abc"));
        assert_eq!(parsed.message_encoding.as_deref(), Some("gzip"));
        let remaining = parsed.deadline.unwrap().time_remaining();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(4));
    }

    #[test]
    fn bare_proto_content_type() {
        let mut req = request();
        req.content_subtype = "proto".to_owned();
        let wire = req.to_wire();
        assert!(wire
            .iter()
            .any(|(k, v)| k.as_ref() == b"content-type" && v.as_ref() == b"application/grpc"));
        assert_eq!(
            RpcRequest::from_wire(&wire).unwrap().content_subtype,
            "proto"
        );
    }

    #[test]
    fn non_grpc_content_type_is_415() {
        let mut wire = request().to_wire();
        for (key, value) in &mut wire {
            if key.as_ref() == b"content-type" {
                *value = Bytes::from_static(b"text/html");
            }
        }
        assert_eq!(
            RpcRequest::from_wire(&wire),
            Err(RequestError::Http { status: 415 })
        );
    }

    #[test]
    fn missing_te_is_unimplemented() {
        let mut wire = request().to_wire();
        wire.retain(|(key, _)| key.as_ref() != b"te");
        match RpcRequest::from_wire(&wire) {
            Err(RequestError::Grpc(status)) => {
                assert_eq!(status.code(), crate::status::Code::Unimplemented);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn non_post_is_405() {
        let mut wire = request().to_wire();
        wire[0].1 = Bytes::from_static(b"GET");
        assert_eq!(
            RpcRequest::from_wire(&wire),
            Err(RequestError::Http { status: 405 })
        );
    }

    #[test]
    fn malformed_timeout_rejected() {
        let mut wire = request().to_wire();
        for (key, value) in &mut wire {
            if key.as_ref() == b"grpc-timeout" {
                *value = Bytes::from_static(b"forever");
            }
        }
        assert!(matches!(
            RpcRequest::from_wire(&wire),
            Err(RequestError::Grpc(_))
        ));
    }
}
