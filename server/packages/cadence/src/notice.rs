use cadence_error::{CadenceError, ErrorNotice};
use cadence_opencode_client::PermissionRequest;
use serde::Serialize;

use crate::subscription::SubscriptionState;

/// Informational events for whoever presents the shell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShellNotice {
    Error(ErrorNotice),
    PermissionRequested(PermissionRequest),
    /// The session list changed on the server and should be refetched.
    SessionsStale,
    TaskCompleted {
        #[serde(rename = "sessionID", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    SubscriptionEnded {
        generation: u64,
        state: SubscriptionState,
    },
}

impl From<&CadenceError> for ShellNotice {
    fn from(err: &CadenceError) -> Self {
        Self::Error(err.to_notice())
    }
}

impl From<CadenceError> for ShellNotice {
    fn from(err: CadenceError) -> Self {
        Self::Error(err.to_notice())
    }
}
