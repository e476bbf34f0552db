//! Error types defined by the JSON-RPC specification.

use std::fmt::{self, Display, Formatter};

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The result of a computation that may fail with a JSON-RPC [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A list of numeric error codes used in JSON-RPC responses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the server.
    ParseError,
    /// The JSON sent is not a valid Request object.
    InvalidRequest,
    /// The method does not exist / is not available.
    MethodNotFound,
    /// Invalid method parameter(s).
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// Reserved for implementation-defined server errors.
    ServerError(i64),

    /// The request was cancelled by the client.
    ///
    /// # Compatibility
    ///
    /// This error code is defined by the Language Server Protocol.
    RequestCancelled,
    /// The request was invalidated by another incoming request.
    ///
    /// # Compatibility
    ///
    /// This error code is specific to the Language Server Protocol.
    ContentModified,
    /// The server cancelled the request.
    ///
    /// The error may carry a `{ "retriggerRequest": bool }` data payload
    /// indicating whether re-sending the same request makes sense.
    ///
    /// # Compatibility
    ///
    /// This error code is specific to the Language Server Protocol.
    ServerCancelled,
    /// The request was handled but failed for reasons the server chose to
    /// report as an error response.
    ///
    /// # Compatibility
    ///
    /// This error code is specific to the Language Server Protocol.
    RequestFailed,
}

impl ErrorCode {
    /// Returns the integer error code value.
    #[inline]
    pub fn code(&self) -> i64 {
        match *self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::RequestCancelled => -32800,
            ErrorCode::ContentModified => -32801,
            ErrorCode::ServerCancelled => -32802,
            ErrorCode::RequestFailed => -32803,
            ErrorCode::ServerError(code) => code,
        }
    }

    /// Returns a human-readable description of the error.
    #[inline]
    pub fn description(&self) -> &'static str {
        match *self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::RequestCancelled => "Canceled",
            ErrorCode::ContentModified => "Content modified",
            ErrorCode::ServerCancelled => "Server cancelled",
            ErrorCode::RequestFailed => "Request failed",
            ErrorCode::ServerError(_) => "Server error",
        }
    }
}

impl From<i64> for ErrorCode {
    #[inline]
    fn from(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32800 => ErrorCode::RequestCancelled,
            -32801 => ErrorCode::ContentModified,
            -32802 => ErrorCode::ServerCancelled,
            -32803 => ErrorCode::RequestFailed,
            code => ErrorCode::ServerError(code),
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.code(), f)
    }
}

impl<'a> Deserialize<'a> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'a>,
    {
        let code: i64 = Deserialize::deserialize(deserializer)?;
        Ok(ErrorCode::from(code))
    }
}

impl Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.code().serialize(serializer)
    }
}

/// A JSON-RPC error object.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Error {
    /// A number indicating the error type that occurred.
    pub code: ErrorCode,
    /// A short description of the error.
    pub message: String,
    /// Additional information about the error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Error {
    /// Creates a new error from the given `ErrorCode`.
    #[inline]
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: code.description().to_string(),
            data: None,
        }
    }

    /// Creates a new parse error (`-32700`).
    #[inline]
    pub fn parse_error() -> Self {
        Error::new(ErrorCode::ParseError)
    }

    /// Creates a new "invalid request" error (`-32600`).
    #[inline]
    pub fn invalid_request() -> Self {
        Error::new(ErrorCode::InvalidRequest)
    }

    /// Creates a new "method not found" error (`-32601`).
    #[inline]
    pub fn method_not_found() -> Self {
        Error::new(ErrorCode::MethodNotFound)
    }

    /// Creates a new "invalid params" error (`-32602`).
    #[inline]
    pub fn invalid_params<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        Error {
            code: ErrorCode::InvalidParams,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a new internal error (`-32603`).
    #[inline]
    pub fn internal_error() -> Self {
        Error::new(ErrorCode::InternalError)
    }

    /// Creates a new "request cancelled" error (`-32800`).
    ///
    /// # Compatibility
    ///
    /// This error code is defined by the Language Server Protocol.
    #[inline]
    pub fn request_cancelled() -> Self {
        Error::new(ErrorCode::RequestCancelled)
    }

    /// Creates a new "content modified" error (`-32801`).
    ///
    /// # Compatibility
    ///
    /// This error code is defined by the Language Server Protocol.
    #[inline]
    pub fn content_modified() -> Self {
        Error::new(ErrorCode::ContentModified)
    }

    /// Creates a new "request failed" error (`-32803`) with the given message.
    ///
    /// # Compatibility
    ///
    /// This error code is defined by the Language Server Protocol.
    #[inline]
    pub fn request_failed<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        Error {
            code: ErrorCode::RequestFailed,
            message: message.into(),
            data: None,
        }
    }

    /// Returns the `retriggerRequest` flag of a "server cancelled" error.
    ///
    /// The flag defaults to `true` when the error carries no data, matching
    /// the protocol's guidance that a bare `ServerCancelled` response may be
    /// retried. Errors with any other code never request a retrigger.
    pub fn retrigger_request(&self) -> bool {
        if self.code != ErrorCode::ServerCancelled {
            return false;
        }

        match self.data.as_ref().and_then(|d| d.get("retriggerRequest")) {
            Some(Value::Bool(retrigger)) => *retrigger,
            _ => true,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_lsp_error_codes() {
        assert_eq!(ErrorCode::from(-32802), ErrorCode::ServerCancelled);
        assert_eq!(ErrorCode::from(-32803), ErrorCode::RequestFailed);
        assert_eq!(ErrorCode::ServerCancelled.code(), -32802);
        assert_eq!(ErrorCode::RequestFailed.code(), -32803);
    }

    #[test]
    fn server_cancelled_defaults_to_retrigger() {
        let bare = Error::new(ErrorCode::ServerCancelled);
        assert!(bare.retrigger_request());

        let explicit = Error {
            data: Some(json!({"retriggerRequest": false})),
            ..Error::new(ErrorCode::ServerCancelled)
        };
        assert!(!explicit.retrigger_request());

        assert!(!Error::request_cancelled().retrigger_request());
    }
}
