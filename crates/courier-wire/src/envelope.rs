//! Envelope variants and the value types that identify them.

use std::fmt;

use courier_core::ErrorObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request identifier: string or integer, unique among currently
/// outstanding requests for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id, as produced by the session's counter.
    Number(u64),
    /// String id, as some servers and peers use.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// A progress token associating progress notifications with a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// Numeric token.
    Number(u64),
    /// String token.
    String(String),
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// An outbound or inbound request: expects exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Request id, echoed back by the response.
    pub id: RequestId,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Method-specific parameters.
    pub params: Option<Value>,
}

/// A response correlated to an outstanding request by id. Carries either
/// a `result` or an `error`, never both.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The id of the request this answers.
    pub id: RequestId,
    /// Successful result payload.
    pub result: Option<Value>,
    /// Application-level error payload.
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Consumes the response, yielding the result or the error object.
    pub fn into_result(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A one-way message: no id, no response expected.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name, e.g. `notifications/progress`.
    pub method: String,
    /// Method-specific parameters.
    pub params: Option<Value>,
}

/// A single protocol message in wire-neutral structured form.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Client-to-server (or server-to-client) request.
    Request(Request),
    /// Answer to an outstanding request.
    Response(Response),
    /// One-way notification.
    Notification(Notification),
}

impl Envelope {
    /// Builds a request envelope.
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    /// Builds a successful response envelope.
    pub fn response(id: RequestId, result: Value) -> Self {
        Self::Response(Response {
            id,
            result: Some(result),
            error: None,
        })
    }

    /// Builds an error response envelope.
    pub fn error_response(id: RequestId, error: ErrorObject) -> Self {
        Self::Response(Response {
            id,
            result: None,
            error: Some(error),
        })
    }

    /// Builds a notification envelope.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }
}
