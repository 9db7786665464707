use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Address of the agent server plus the working directory every call is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEndpoint {
    pub base_url: String,
    pub working_context: String,
}

impl ServerEndpoint {
    pub fn new(base_url: &str, working_context: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            working_context: working_context.into(),
        }
    }
}

pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time: SessionTime,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    pub fn updated_at(&self) -> Option<i64> {
        self.time.updated.or(self.time.created)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    pub role: Role,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(info: MessageInfo) -> Self {
        Self {
            info,
            parts: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn part(&self, part_id: &str) -> Option<&Part> {
        self.parts.iter().find(|part| part.id == part_id)
    }

    /// Concatenation of every text part, in order.
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::text).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PartKind {
    Text { text: String },
    Tool { tool: String, state: ToolState },
    /// Any part type this client does not interpret (reasoning, step markers, ...).
    Other { kind: String },
}

/// One fragment of a message. Unknown part types survive a round trip untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPart", into = "RawPart")]
pub struct Part {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    pub kind: PartKind,
    pub extra: Map<String, Value>,
}

impl Part {
    pub fn text_part(
        id: impl Into<String>,
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            message_id: message_id.into(),
            kind: PartKind::Text { text: text.into() },
            extra: Map::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        match &self.kind {
            PartKind::Text { .. } => "text",
            PartKind::Tool { .. } => "tool",
            PartKind::Other { kind } => kind,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, PartKind::Text { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            PartKind::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawPart {
    id: String,
    #[serde(rename = "sessionID", default)]
    session_id: String,
    #[serde(rename = "messageID", default)]
    message_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<ToolState>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<RawPart> for Part {
    fn from(raw: RawPart) -> Self {
        let RawPart {
            id,
            session_id,
            message_id,
            kind,
            text,
            tool,
            state,
            mut extra,
        } = raw;
        let kind = match kind.as_str() {
            "text" => PartKind::Text {
                text: text.unwrap_or_default(),
            },
            "tool" => PartKind::Tool {
                tool: tool.unwrap_or_default(),
                state: state.unwrap_or_default(),
            },
            _ => {
                if let Some(text) = text {
                    extra.insert("text".to_string(), Value::String(text));
                }
                if let Some(tool) = tool {
                    extra.insert("tool".to_string(), Value::String(tool));
                }
                if let Some(state) = state.and_then(|state| serde_json::to_value(state).ok()) {
                    extra.insert("state".to_string(), state);
                }
                PartKind::Other { kind }
            }
        };
        Self {
            id,
            session_id,
            message_id,
            kind,
            extra,
        }
    }
}

impl From<Part> for RawPart {
    fn from(part: Part) -> Self {
        let (kind, text, tool, state) = match part.kind {
            PartKind::Text { text } => ("text".to_string(), Some(text), None, None),
            PartKind::Tool { tool, state } => ("tool".to_string(), None, Some(tool), Some(state)),
            PartKind::Other { kind } => (kind, None, None, None),
        };
        Self {
            id: part.id,
            session_id: part.session_id,
            message_id: part.message_id,
            kind,
            text,
            tool,
            state,
            extra: part.extra,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    pub permission: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub always: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

impl PermissionReply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for PermissionReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionReply {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "once" | "o" => Ok(Self::Once),
            "always" | "a" => Ok(Self::Always),
            "reject" | "r" => Ok(Self::Reject),
            other => Err(format!("unknown permission reply: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct PermissionReplyBody<'a> {
    pub reply: PermissionReply,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Ask,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub permission: String,
    pub pattern: String,
    pub action: PermissionAction,
}

impl PermissionRule {
    pub fn new(permission: &str, pattern: &str, action: PermissionAction) -> Self {
        Self {
            permission: permission.to_string(),
            pattern: pattern.to_string(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub title: String,
    #[serde(default)]
    pub permission: Vec<PermissionRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSessionsQuery {
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub roots: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Parses the server's `provider/model` notation.
    pub fn parse(value: &str) -> Option<Self> {
        let (provider_id, model_id) = value.split_once('/')?;
        if provider_id.is_empty() || model_id.is_empty() {
            return None;
        }
        Some(Self::new(provider_id, model_id))
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PromptPart {
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub parts: Vec<PromptPart>,
}

impl PromptRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            model: None,
            agent: None,
            variant: None,
            parts: vec![PromptPart::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizeRequest {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
    pub auto: bool,
}

impl SummarizeRequest {
    pub fn for_model(model: &ModelRef) -> Self {
        Self {
            provider_id: model.provider_id.clone(),
            model_id: model.model_id.clone(),
            auto: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Raw `/provider` payload; `all` entries vary between server versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderListing {
    #[serde(default)]
    pub all: Vec<Value>,
    #[serde(default)]
    pub default: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderListing {
    /// First provider with a default model, in key order.
    pub fn default_model(&self) -> Option<ModelRef> {
        self.default.iter().find_map(|(provider_id, model_id)| {
            let model_id = model_id.as_str()?;
            if provider_id.is_empty() || model_id.is_empty() {
                return None;
            }
            Some(ModelRef::new(provider_id.clone(), model_id))
        })
    }
}
