use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use cadence_opencode_client::{
    Message, MessageInfo, MessageTime, Part, PartKind, PartUpdated, PermissionRequest, Role,
};
use serde_json::Map;
use tokio::sync::watch;

/// Reconstructed client-visible state for the active session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    pub active_session: Option<String>,
    pub messages: Vec<Message>,
    /// Requests waiting for a human decision, oldest first.
    pub permission_queue: VecDeque<PermissionRequest>,
    pub sessions_stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    /// Not for the active session.
    Ignored,
    Appended,
    DeltaApplied,
    Replaced,
}

impl ConversationState {
    /// Makes `session_id` active, discarding whatever was reconstructed before.
    pub fn open_session(&mut self, session_id: impl Into<String>, messages: Vec<Message>) {
        self.active_session = Some(session_id.into());
        self.messages = messages;
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id() == message_id)
    }

    pub fn apply_part_update(&mut self, update: PartUpdated) -> PartOutcome {
        let PartUpdated { part, delta } = update;
        if part.session_id.is_empty() || part.message_id.is_empty() {
            return PartOutcome::Ignored;
        }
        if self.active_session.as_deref() != Some(part.session_id.as_str()) {
            return PartOutcome::Ignored;
        }

        let message = self.ensure_assistant_message(&part.message_id, &part.session_id);
        upsert_part(message, part, delta)
    }

    /// Adds the user's prompt locally ahead of the server echo. Returns the
    /// synthetic message id, or `None` when no session is active.
    pub fn append_local_user_message(&mut self, text: &str) -> Option<String> {
        let session_id = self.active_session.clone()?;
        let now = chrono::Utc::now().timestamp_millis();
        let message_id = format!("local-user-{now}");
        let mut message = Message::new(MessageInfo {
            id: message_id.clone(),
            session_id: session_id.clone(),
            role: Role::User,
            time: MessageTime {
                created: Some(now),
                completed: None,
            },
            extra: Map::new(),
        });
        message.parts.push(Part::text_part(
            format!("p-{message_id}"),
            session_id,
            message_id.clone(),
            text,
        ));
        self.messages.push(message);
        Some(message_id)
    }

    pub fn enqueue_permission(&mut self, request: PermissionRequest) {
        if self.permission_queue.iter().any(|queued| queued.id == request.id) {
            return;
        }
        self.permission_queue.push_back(request);
    }

    pub fn take_permission(&mut self, request_id: &str) -> Option<PermissionRequest> {
        let index = self
            .permission_queue
            .iter()
            .position(|request| request.id == request_id)?;
        self.permission_queue.remove(index)
    }

    pub fn pending_permission(&self) -> Option<&PermissionRequest> {
        self.permission_queue.front()
    }

    fn ensure_assistant_message(&mut self, message_id: &str, session_id: &str) -> &mut Message {
        let index = match self
            .messages
            .iter()
            .position(|message| message.id() == message_id)
        {
            Some(index) => index,
            None => {
                self.messages.push(Message::new(MessageInfo {
                    id: message_id.to_string(),
                    session_id: session_id.to_string(),
                    role: Role::Assistant,
                    time: MessageTime {
                        created: Some(chrono::Utc::now().timestamp_millis()),
                        completed: None,
                    },
                    extra: Map::new(),
                }));
                self.messages.len() - 1
            }
        };
        &mut self.messages[index]
    }
}

fn upsert_part(message: &mut Message, part: Part, delta: Option<String>) -> PartOutcome {
    let Some(index) = message
        .parts
        .iter()
        .position(|candidate| candidate.id == part.id)
    else {
        let mut part = part;
        // A first occurrence may carry its opening text only as the delta.
        if let (PartKind::Text { text }, Some(delta)) = (&mut part.kind, delta) {
            if text.is_empty() {
                *text = delta;
            }
        }
        message.parts.push(part);
        return PartOutcome::Appended;
    };
    let existing = &mut message.parts[index];

    // Text accumulates from deltas; the `text` field carried alongside is ignored.
    if let (true, Some(delta)) = (part.is_text(), delta) {
        if let PartKind::Text { text } = &mut existing.kind {
            text.push_str(&delta);
            return PartOutcome::DeltaApplied;
        }
    }

    *existing = part;
    PartOutcome::Replaced
}

/// Shared [`ConversationState`] with change notification.
///
/// Every mutation bumps a version published on a `watch` channel; observers
/// wait for a change and then take a [`snapshot`](Self::snapshot).
#[derive(Debug)]
pub struct ConversationStore {
    state: Mutex<ConversationState>,
    version: watch::Sender<u64>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(ConversationState::default()),
            version,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn snapshot(&self) -> ConversationState {
        self.lock().clone()
    }

    pub fn read<R>(&self, inspect: impl FnOnce(&ConversationState) -> R) -> R {
        inspect(&self.lock())
    }

    pub fn update<R>(&self, apply: impl FnOnce(&mut ConversationState) -> R) -> R {
        let result = apply(&mut self.lock());
        self.version.send_modify(|version| *version += 1);
        result
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_opencode_client::ToolState;

    fn text_update(part_id: &str, text: &str, delta: Option<&str>) -> PartUpdated {
        PartUpdated {
            part: Part::text_part(part_id, "s1", "m1", text),
            delta: delta.map(str::to_string),
        }
    }

    fn active_state() -> ConversationState {
        let mut state = ConversationState::default();
        state.open_session("s1", Vec::new());
        state
    }

    #[test]
    fn deltas_accumulate_on_a_synthesized_assistant_message() {
        let mut state = active_state();
        assert_eq!(
            state.apply_part_update(text_update("p1", "", Some("Hello"))),
            PartOutcome::Appended
        );
        assert_eq!(
            state.apply_part_update(text_update("p1", "Hello world", Some(" world"))),
            PartOutcome::DeltaApplied
        );

        let message = state.message("m1").expect("message m1");
        assert_eq!(message.info.role, Role::Assistant);
        assert_eq!(message.parts.len(), 1);
        assert_eq!(message.text(), "Hello world");
    }

    #[test]
    fn initial_text_then_deltas_concatenate_in_order() {
        let mut state = active_state();
        state.apply_part_update(text_update("p1", "The", None));
        for delta in [" quick", " brown", " fox"] {
            state.apply_part_update(text_update("p1", "ignored", Some(delta)));
        }
        assert_eq!(state.message("m1").expect("m1").text(), "The quick brown fox");
    }

    #[test]
    fn update_without_delta_replaces_the_part() {
        let mut state = active_state();
        state.apply_part_update(text_update("p1", "draft", None));
        assert_eq!(
            state.apply_part_update(text_update("p1", "final", None)),
            PartOutcome::Replaced
        );
        assert_eq!(state.message("m1").expect("m1").text(), "final");

        let mut tool = Part::text_part("p2", "s1", "m1", "");
        tool.kind = PartKind::Tool {
            tool: "bash".to_string(),
            state: ToolState {
                status: Some("running".to_string()),
                ..ToolState::default()
            },
        };
        state.apply_part_update(PartUpdated {
            part: tool.clone(),
            delta: None,
        });
        if let PartKind::Tool { state: tool_state, .. } = &mut tool.kind {
            tool_state.status = Some("completed".to_string());
        }
        state.apply_part_update(PartUpdated {
            part: tool.clone(),
            delta: Some("stray".to_string()),
        });
        assert_eq!(state.message("m1").expect("m1").part("p2"), Some(&tool));
    }

    #[test]
    fn parts_for_other_sessions_are_ignored() {
        let mut state = active_state();
        let update = PartUpdated {
            part: Part::text_part("p1", "s2", "m9", "elsewhere"),
            delta: None,
        };
        assert_eq!(state.apply_part_update(update), PartOutcome::Ignored);
        assert!(state.messages.is_empty());

        let mut idle = ConversationState::default();
        assert_eq!(
            idle.apply_part_update(text_update("p1", "x", None)),
            PartOutcome::Ignored
        );
    }

    #[test]
    fn local_user_message_needs_an_active_session() {
        let mut state = ConversationState::default();
        assert_eq!(state.append_local_user_message("hi"), None);

        state.open_session("s1", Vec::new());
        let id = state.append_local_user_message("hi").expect("local id");
        assert!(id.starts_with("local-user-"));
        let message = state.message(&id).expect("local message");
        assert_eq!(message.info.role, Role::User);
        assert_eq!(message.parts[0].id, format!("p-{id}"));
        assert_eq!(message.text(), "hi");
    }

    #[test]
    fn permission_queue_deduplicates_and_removes_by_id() {
        let mut state = ConversationState::default();
        let request = |id: &str| PermissionRequest {
            id: id.to_string(),
            session_id: "s1".to_string(),
            permission: "bash".to_string(),
            patterns: Vec::new(),
            always: Vec::new(),
            extra: Map::new(),
        };
        state.enqueue_permission(request("r1"));
        state.enqueue_permission(request("r1"));
        state.enqueue_permission(request("r2"));
        assert_eq!(state.permission_queue.len(), 2);

        assert_eq!(state.take_permission("r2").map(|r| r.id), Some("r2".to_string()));
        assert_eq!(state.pending_permission().map(|r| r.id.as_str()), Some("r1"));
        assert!(state.take_permission("missing").is_none());
    }

    #[tokio::test]
    async fn store_updates_bump_the_version() {
        let store = ConversationStore::new();
        let mut changes = store.subscribe();
        store.update(|state| state.open_session("s1", Vec::new()));

        changes.changed().await.expect("version change");
        assert_eq!(*changes.borrow(), 1);
        assert_eq!(store.snapshot().active_session.as_deref(), Some("s1"));
    }
}
