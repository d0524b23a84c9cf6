//! # Route Codecs
//!
//! A codec knows the wire shape of one downstream method. It is used on both sides of
//! the gateway: the boundary listener decodes the inbound body and encodes the final
//! result, the HTTP endpoint encodes the outbound call and decodes the instance's reply.
//!
//! Codecs are selected by [`CodecKind`], a closed set parsed from configuration, so an
//! unknown method is rejected when the config is read rather than on the first request.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::error::{GatewayError, GatewayResult};

/// Encode/decode functions for one logical method
pub trait RouteCodec: Send + Sync {
    /// Validate and decode an inbound client request
    fn decode_request(&self, body: &[u8]) -> GatewayResult<Value>;

    /// Encode a request for the wire call against one instance
    fn encode_request(&self, request: &Value) -> GatewayResult<Bytes>;

    /// Decode an instance's successful reply; domain errors become `Downstream`
    fn decode_response(&self, body: &[u8]) -> GatewayResult<Value>;

    /// Encode the final result for the client
    fn encode_response(&self, response: &Value) -> GatewayResult<Bytes>;
}

/// The known downstream methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    Sum,
    Concat,
    Uppercase,
    Count,
}

impl CodecKind {
    pub const ALL: [CodecKind; 4] = [Self::Sum, Self::Concat, Self::Uppercase, Self::Count];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Concat => "concat",
            Self::Uppercase => "uppercase",
            Self::Count => "count",
        }
    }

    /// Table lookup from method identity to its codec
    pub fn codec(self) -> Arc<dyn RouteCodec> {
        match self {
            Self::Sum => Arc::new(JsonCodec::<SumRequest, SumResponse>::new(self)),
            Self::Concat => Arc::new(JsonCodec::<ConcatRequest, ConcatResponse>::new(self)),
            Self::Uppercase => Arc::new(JsonCodec::<StringRequest, UppercaseResponse>::new(self)),
            Self::Count => Arc::new(JsonCodec::<StringRequest, CountResponse>::new(self)),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response types that can carry a domain error next to their value
pub trait DomainResponse {
    fn domain_error(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumResponse {
    pub v: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatRequest {
    pub a: String,
    pub b: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcatResponse {
    pub v: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Shared by `uppercase` and `count`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringRequest {
    pub s: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UppercaseResponse {
    pub v: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountResponse {
    pub v: u64,
}

macro_rules! domain_error_field {
    ($($ty:ty),*) => {
        $(impl DomainResponse for $ty {
            fn domain_error(&self) -> Option<&str> {
                self.err.as_deref().filter(|e| !e.is_empty())
            }
        })*
    };
}

domain_error_field!(SumResponse, ConcatResponse, UppercaseResponse);

impl DomainResponse for CountResponse {
    fn domain_error(&self) -> Option<&str> {
        None
    }
}

/// JSON codec parameterized by the typed request and response
pub struct JsonCodec<Req, Resp> {
    kind: CodecKind,
    _types: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> JsonCodec<Req, Resp> {
    pub fn new(kind: CodecKind) -> Self {
        Self {
            kind,
            _types: PhantomData,
        }
    }

    fn error(&self, message: impl fmt::Display) -> GatewayError {
        GatewayError::codec(self.kind.as_str(), message.to_string())
    }
}

impl<Req, Resp> RouteCodec for JsonCodec<Req, Resp>
where
    Req: Serialize + DeserializeOwned,
    Resp: Serialize + DeserializeOwned + DomainResponse,
{
    fn decode_request(&self, body: &[u8]) -> GatewayResult<Value> {
        let request: Req = serde_json::from_slice(body).map_err(|e| self.error(e))?;
        serde_json::to_value(request).map_err(|e| self.error(e))
    }

    fn encode_request(&self, request: &Value) -> GatewayResult<Bytes> {
        // Round-trip through the typed request so a malformed value never hits the wire.
        let typed: Req = serde_json::from_value(request.clone()).map_err(|e| self.error(e))?;
        serde_json::to_vec(&typed)
            .map(Bytes::from)
            .map_err(|e| self.error(e))
    }

    fn decode_response(&self, body: &[u8]) -> GatewayResult<Value> {
        let response: Resp = serde_json::from_slice(body).map_err(|e| self.error(e))?;
        if let Some(message) = response.domain_error() {
            return Err(GatewayError::downstream(self.kind.as_str(), message));
        }
        serde_json::to_value(response).map_err(|e| self.error(e))
    }

    fn encode_response(&self, response: &Value) -> GatewayResult<Bytes> {
        serde_json::to_vec(response)
            .map(Bytes::from)
            .map_err(|e| self.error(e))
    }
}
