//! CloudStack error types.
//!
//! CloudStack reports failures through HTTP status codes that double as
//! business signals, optionally accompanied by an XML body carrying
//! `errorcode` / `errortext` elements. This module provides a single error
//! type covering local configuration problems, transport failures, the
//! structured API errors produced by the response classifier, and local
//! defects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a [`CsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CsErrorKind {
    /// No usable endpoint or credential context.
    Configuration,
    /// No response, a dropped connection, or a body that is not XML.
    Communication,
    /// A classified business error returned by the server.
    Api,
    /// A classified business error tagged as an authentication failure.
    Authentication,
    /// An unexpected local failure (signing, encoding, worker crash).
    Internal,
}

impl fmt::Display for CsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Communication => write!(f, "communication"),
            Self::Api => write!(f, "api"),
            Self::Authentication => write!(f, "authentication"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Top-level error type for all CloudStack operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsError {
    pub kind: CsErrorKind,
    pub message: String,
    /// Error code for API errors (HTTP status unless the body overrides it).
    pub code: Option<i32>,
}

impl fmt::Display for CsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "CloudStack {} error [{}]: {}", self.kind, code, self.message),
            None => write!(f, "CloudStack {} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for CsError {}

impl CsError {
    pub fn new(kind: CsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(CsErrorKind::Configuration, message)
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::new(CsErrorKind::Communication, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CsErrorKind::Internal, message)
    }

    /// Build a general structured API error.
    pub fn api(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: CsErrorKind::Api,
            message: message.into(),
            code: Some(code),
        }
    }

    /// Build a structured API error tagged as an authentication failure.
    pub fn authentication(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: CsErrorKind::Authentication,
            message: message.into(),
            code: Some(code),
        }
    }

    /// The API error code, if this is a structured API error.
    pub fn http_code(&self) -> Option<i32> {
        self.code
    }

    /// Whether this is a structured API error of either flavour.
    pub fn is_api(&self) -> bool {
        matches!(self.kind, CsErrorKind::Api | CsErrorKind::Authentication)
    }

    pub fn is_authentication(&self) -> bool {
        self.kind == CsErrorKind::Authentication
    }

    /// Whether the error carries the given API code.
    pub fn has_code(&self, code: i32) -> bool {
        self.is_api() && self.code == Some(code)
    }

    /// Codes CloudStack uses when the caller's account cannot use the
    /// service at all (unauthorized, forbidden, unknown account).
    pub fn is_not_subscribed(&self) -> bool {
        self.is_api() && matches!(self.code, Some(401 | 403 | 531))
    }
}

// ── Parsed error ────────────────────────────────────────────────────────

/// Code and message extracted from a non-200 CloudStack response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedError {
    pub code: i32,
    pub message: String,
}

impl ParsedError {
    /// Default code and message for an HTTP status with no usable body.
    pub fn from_status(status: u16) -> Self {
        let code = i32::from(status);
        let message = match code {
            401 => "Unauthorized user".to_string(),
            430 => "Malformed parameters".to_string(),
            530 | 547 => format!("Server error in cloud ({})", code),
            531 => "Unable to find account".to_string(),
            _ => format!("Received error code from server: {}", code),
        };
        Self { code, message }
    }

    /// Raise as a general structured API error.
    pub fn into_error(self) -> CsError {
        CsError::api(self.code, self.message)
    }
}

/// Convert CsError to a plain String error for callers that only display it.
impl From<CsError> for String {
    fn from(err: CsError) -> String {
        err.to_string()
    }
}

impl From<reqwest::Error> for CsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() || err.is_connect() {
            Self::internal(err.to_string())
        } else {
            Self::communication(err.to_string())
        }
    }
}

/// Convenience result type for CloudStack operations.
pub type CsResult<T> = Result<T, CsError>;
