//! RPC wire messages.
//!
//! ```text
//! request: {name?, method?, path?, payload, authenticationToken?, ip?}
//! reply:   {headers, body} | {error: {code, message, metadata, type, stack?}}
//! ```
//!
//! The correlation id and reply destination travel as broker message
//! properties, never inside the body.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, RequestError};
use crate::pipeline::RouteMethod;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<RouteMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl RpcRequest {
    /// Address a route by its logical name.
    pub fn named(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: Some(name.into()),
            payload,
            ..Default::default()
        }
    }

    /// Address a route by method and concrete path.
    pub fn to_path(method: RouteMethod, path: impl Into<String>, payload: Value) -> Self {
        Self {
            method: Some(method),
            path: Some(path.into()),
            payload,
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.authentication_token = Some(token.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// A request must name a route or give a method or path.
    pub fn is_addressable(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
            || self.method.is_some()
            || self.path.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Payload as an object; `null` becomes `{}`.
    pub fn payload_object(&self) -> Value {
        match &self.payload {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorEnvelope {
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RpcErrorEnvelope {
    pub fn from_error(err: &RequestError) -> Self {
        Self {
            code: err.status_code(),
            message: err.message.clone(),
            metadata: err.metadata.clone(),
            kind: err.kind.as_str().to_string(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn to_request_error(&self) -> RequestError {
        RequestError::new(ErrorKind::from_status_code(self.code), self.message.clone())
            .with_metadata(self.metadata.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcReply {
    Failure {
        error: RpcErrorEnvelope,
    },
    Success {
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Value,
    },
}

impl RpcReply {
    pub fn failure(err: &RequestError) -> Self {
        RpcReply::Failure {
            error: RpcErrorEnvelope::from_error(err),
        }
    }
}

/// Successful reply as seen by the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RpcResponse {
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}
