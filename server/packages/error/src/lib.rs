use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Transport,
    InvalidResponse,
    Subscription,
    PolicyViolation,
    Persistence,
    ServerStart,
    InvalidRequest,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::Transport => "urn:cadence:error:transport",
            Self::InvalidResponse => "urn:cadence:error:invalid_response",
            Self::Subscription => "urn:cadence:error:subscription",
            Self::PolicyViolation => "urn:cadence:error:policy_violation",
            Self::Persistence => "urn:cadence:error:persistence",
            Self::ServerStart => "urn:cadence:error:server_start",
            Self::InvalidRequest => "urn:cadence:error:invalid_request",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Transport => "Transport Error",
            Self::InvalidResponse => "Invalid Response",
            Self::Subscription => "Subscription Failure",
            Self::PolicyViolation => "Policy Violation",
            Self::Persistence => "Persistence Error",
            Self::ServerStart => "Server Start Failed",
            Self::InvalidRequest => "Invalid Request",
        }
    }

    /// Policy violations are logged, never shown to the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::PolicyViolation)
    }
}

/// The shape handed to the surrounding shell for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorNotice {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorNotice {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            type_: error_type,
            title: error_type.title().to_string(),
            message: message.into(),
            status: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CadenceError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("connection failed: {message}")]
    Connection { message: String },
    #[error("invalid response: {message}")]
    InvalidResponse { message: String },
    #[error("event subscription failed: {message}")]
    Subscription { message: String },
    #[error("policy violation: {message}")]
    PolicyViolation { message: String },
    #[error("persistence failed: {message}")]
    Persistence { message: String },
    #[error("server start failed: {message}")]
    ServerStart { message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl CadenceError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Http { .. } | Self::Connection { .. } => ErrorType::Transport,
            Self::InvalidResponse { .. } => ErrorType::InvalidResponse,
            Self::Subscription { .. } => ErrorType::Subscription,
            Self::PolicyViolation { .. } => ErrorType::PolicyViolation,
            Self::Persistence { .. } => ErrorType::Persistence,
            Self::ServerStart { .. } => ErrorType::ServerStart,
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for transport failures that carry an HTTP status in the 4xx range.
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(status) if (400..500).contains(&status))
    }

    pub fn to_notice(&self) -> ErrorNotice {
        let mut notice = ErrorNotice::new(self.error_type(), self.to_string());
        notice.status = self.status();
        if let Self::Http { body, .. } = self {
            if let Ok(parsed) = serde_json::from_str::<Value>(body) {
                notice.details = Some(parsed);
            } else if !body.is_empty() {
                let mut map = Map::new();
                map.insert("body".to_string(), Value::String(body.clone()));
                notice.details = Some(Value::Object(map));
            }
        }
        notice
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<CadenceError> for ErrorNotice {
    fn from(value: CadenceError) -> Self {
        value.to_notice()
    }
}

impl From<&CadenceError> for ErrorNotice {
    fn from(value: &CadenceError) -> Self {
        value.to_notice()
    }
}
