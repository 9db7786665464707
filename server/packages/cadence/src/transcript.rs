use std::collections::{HashMap, HashSet};

use cadence_opencode_client::{Message, PartKind, Role};

/// Tracks how much of each part the terminal has shown so only new text is
/// printed as the conversation grows.
#[derive(Debug, Default)]
pub(crate) struct TranscriptPrinter {
    printed: HashMap<String, usize>,
    tools_shown: HashSet<String>,
    last_message: Option<String>,
}

impl TranscriptPrinter {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Everything not yet shown, user messages included.
    pub(crate) fn replay(&mut self, messages: &[Message]) -> String {
        self.render(messages, true)
    }

    /// New assistant output since the last call. User messages are marked as
    /// seen without being echoed.
    pub(crate) fn render_new(&mut self, messages: &[Message]) -> String {
        self.render(messages, false)
    }

    fn render(&mut self, messages: &[Message], include_user: bool) -> String {
        let mut out = String::new();
        for message in messages {
            let chunk = self.render_message(message);
            if chunk.is_empty() || (message.info.role == Role::User && !include_user) {
                continue;
            }
            if self.last_message.as_deref() != Some(message.id()) {
                if !out.is_empty() || self.last_message.is_some() {
                    out.push('\n');
                }
                out.push_str(match message.info.role {
                    Role::User => "you> ",
                    Role::Assistant => "assistant> ",
                });
                self.last_message = Some(message.id().to_string());
            }
            out.push_str(&chunk);
        }
        out
    }

    fn render_message(&mut self, message: &Message) -> String {
        let mut out = String::new();
        for part in &message.parts {
            match &part.kind {
                PartKind::Text { text } => {
                    let already = self.printed.get(&part.id).copied().unwrap_or(0);
                    if text.len() > already {
                        // A replaced part may no longer share the shown prefix.
                        out.push_str(text.get(already..).unwrap_or(text));
                    }
                    self.printed.insert(part.id.clone(), text.len());
                }
                PartKind::Tool { tool, state } => {
                    let finished = matches!(state.status.as_deref(), Some("completed" | "error"));
                    if finished && self.tools_shown.insert(part.id.clone()) {
                        let title = state.title.as_deref().unwrap_or_default();
                        out.push_str(&format!("\n[{tool}] {title}\n"));
                    }
                }
                PartKind::Other { .. } => {}
            }
        }
        out
    }
}
