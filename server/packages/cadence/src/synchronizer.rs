use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use cadence_error::CadenceError;
use cadence_opencode_client::{
    OpencodeClient, PermissionReply, PermissionRequest, ServerEvent,
};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conversation::ConversationStore;
use crate::notice::ShellNotice;
use crate::permission_memory::PermissionMemory;
use crate::subscription::{SubscriptionSlot, SubscriptionState, SubscriptionStatus};

const NOTICE_CAPACITY: usize = 256;

/// Drives the event subscription and applies its events.
///
/// Events of one generation are applied strictly in arrival order by a single
/// task. A restart cancels that task and waits for it before the next
/// generation opens its stream.
#[derive(Debug)]
pub struct Synchronizer {
    shared: Arc<Shared>,
    slot: Mutex<SubscriptionSlot>,
}

#[derive(Debug)]
struct Shared {
    client: Arc<OpencodeClient>,
    memory: Arc<PermissionMemory>,
    store: Arc<ConversationStore>,
    notices: broadcast::Sender<ShellNotice>,
    status: watch::Sender<SubscriptionStatus>,
    // Every request seen on the stream and not yet answered, surfaced or not.
    pending: StdMutex<HashMap<String, PermissionRequest>>,
    focused: AtomicBool,
}

impl Synchronizer {
    pub fn new(
        client: Arc<OpencodeClient>,
        memory: Arc<PermissionMemory>,
        store: Arc<ConversationStore>,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (status, _) = watch::channel(SubscriptionStatus::default());
        Self {
            shared: Arc::new(Shared {
                client,
                memory,
                store,
                notices,
                status,
                pending: StdMutex::new(HashMap::new()),
                focused: AtomicBool::new(false),
            }),
            slot: Mutex::new(SubscriptionSlot::new()),
        }
    }

    pub fn client(&self) -> &Arc<OpencodeClient> {
        &self.shared.client
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.shared.store
    }

    pub fn memory(&self) -> &Arc<PermissionMemory> {
        &self.shared.memory
    }

    pub fn notices(&self) -> broadcast::Receiver<ShellNotice> {
        self.shared.notices.subscribe()
    }

    pub fn notice_sender(&self) -> broadcast::Sender<ShellNotice> {
        self.shared.notices.clone()
    }

    pub fn status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.shared.status.subscribe()
    }

    pub fn set_focused(&self, focused: bool) {
        self.shared.focused.store(focused, Ordering::SeqCst);
    }

    /// Starts a fresh generation, cancelling and draining the current one first.
    pub async fn restart(&self) -> u64 {
        let shared = self.shared.clone();
        let mut slot = self.slot.lock().await;
        let generation = slot
            .supersede(move |generation, token| shared.run(generation, token))
            .await;
        debug!(generation, "event subscription restarted");
        generation
    }

    /// Stops the current generation, if any, and waits for it.
    pub async fn cancel(&self) -> Option<u64> {
        self.slot.lock().await.cancel().await
    }

    pub async fn active_generation(&self) -> Option<u64> {
        self.slot.lock().await.active_generation()
    }

    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        self.shared.pending().values().cloned().collect()
    }

    /// Answers a permission request.
    ///
    /// With [`PermissionReply::Always`] the request's `always` patterns are
    /// recorded durably before the server sees the reply. Replying to an id
    /// the server no longer knows is not an error.
    pub async fn respond(&self, request_id: &str, reply: PermissionReply) -> Result<(), CadenceError> {
        self.shared.respond(request_id, reply).await
    }

    /// Applies one event outside of any subscription, in the same way the
    /// stream task would.
    pub async fn apply_event(&self, event: ServerEvent) {
        self.shared.apply_event(event).await;
    }
}

impl Shared {
    async fn run(self: Arc<Self>, generation: u64, token: CancellationToken) {
        self.set_status(generation, SubscriptionState::Starting);

        let mut events = match self.client.subscribe_events(token.clone()).await {
            Ok(events) => events,
            Err(err) => {
                self.end(generation, &token, Some(err));
                return;
            }
        };
        if token.is_cancelled() {
            self.end(generation, &token, None);
            return;
        }

        self.set_status(generation, SubscriptionState::Active);
        info!(generation, "event subscription active");

        loop {
            let next = events.next().await;
            // Nothing from this generation is applied once it is cancelled.
            if token.is_cancelled() {
                self.end(generation, &token, None);
                return;
            }
            match next {
                Some(Ok(value)) => self.apply_value(value).await,
                Some(Err(err)) => {
                    self.end(generation, &token, Some(err));
                    return;
                }
                None => {
                    self.end(generation, &token, None);
                    return;
                }
            }
        }
    }

    fn end(&self, generation: u64, token: &CancellationToken, error: Option<CadenceError>) {
        let state = match error {
            _ if token.is_cancelled() => SubscriptionState::Superseded,
            Some(err) => {
                warn!(generation, error = %err, "event subscription failed");
                self.notify(ShellNotice::from(&err));
                SubscriptionState::Failed(err.to_string())
            }
            None => {
                info!(generation, "event stream closed by server");
                SubscriptionState::Closed
            }
        };

        self.set_status(generation, state.clone());
        if state != SubscriptionState::Superseded {
            self.notify(ShellNotice::SubscriptionEnded { generation, state });
        }
    }

    fn set_status(&self, generation: u64, state: SubscriptionState) {
        self.status.send_replace(SubscriptionStatus { generation, state });
    }

    fn notify(&self, notice: ShellNotice) {
        // No receivers is fine; notices are informational.
        let _ = self.notices.send(notice);
    }

    async fn apply_value(&self, value: Value) {
        match ServerEvent::from_value(value) {
            Ok(event) => self.apply_event(event).await,
            Err(err) => debug!(error = %err, "skipping event with unexpected payload"),
        }
    }

    async fn apply_event(&self, event: ServerEvent) {
        tracing::trace!(event_type = event.type_name(), "applying event");
        match event {
            ServerEvent::PermissionAsked(request) => self.permission_asked(request).await,
            ServerEvent::MessagePartUpdated(update) => {
                self.store.update(|state| state.apply_part_update(update));
            }
            ServerEvent::SessionIdle(idle) => {
                if !self.focused.load(Ordering::SeqCst) {
                    self.notify(ShellNotice::TaskCompleted {
                        session_id: idle.session_id,
                    });
                }
            }
            ServerEvent::SessionCreated(_)
            | ServerEvent::SessionUpdated(_)
            | ServerEvent::SessionDeleted(_) => {
                self.store.update(|state| state.sessions_stale = true);
                self.notify(ShellNotice::SessionsStale);
            }
            ServerEvent::Unknown(event_type) => {
                tracing::trace!(event_type = %event_type, "ignoring event");
            }
        }
    }

    async fn permission_asked(&self, request: PermissionRequest) {
        self.pending()
            .insert(request.id.clone(), request.clone());

        if self.memory.matches(&request.permission, &request.always) {
            match self
                .client
                .reply_permission(&request.id, PermissionReply::Always, None)
                .await
            {
                Ok(_) => {
                    self.pending().remove(&request.id);
                    info!(
                        request_id = %request.id,
                        permission = %request.permission,
                        "permission auto-approved from memory"
                    );
                    return;
                }
                Err(err) => {
                    warn!(
                        request_id = %request.id,
                        error = %err,
                        "auto-approval reply failed; asking instead"
                    );
                }
            }
        }

        self.store
            .update(|state| state.enqueue_permission(request.clone()));
        self.notify(ShellNotice::PermissionRequested(request));
    }

    async fn respond(&self, request_id: &str, reply: PermissionReply) -> Result<(), CadenceError> {
        let known = self.pending().get(request_id).cloned();

        if reply == PermissionReply::Always {
            if let Some(request) = &known {
                self.memory.merge(&request.permission, &request.always).await?;
            }
        }

        self.pending().remove(request_id);
        self.store.update(|state| state.take_permission(request_id));

        match self.client.reply_permission(request_id, reply, None).await {
            Ok(_) => Ok(()),
            Err(err) if known.is_none() || err.is_client_error() => {
                let violation = CadenceError::PolicyViolation {
                    message: format!("reply to permission request {request_id}: {err}"),
                };
                debug!(error = %violation, "ignoring reply to a stale permission request");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PermissionRequest>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_opencode_client::{Part, PartUpdated, SessionChange, SessionIdle};
    use serde_json::Map;

    async fn synchronizer(dir: &std::path::Path) -> Synchronizer {
        // Nothing listens here; any network call fails fast.
        let client = Arc::new(OpencodeClient::new("http://127.0.0.1:9", "/work"));
        let memory = Arc::new(PermissionMemory::load(dir.join("memory.json")).await);
        Synchronizer::new(client, memory, Arc::new(ConversationStore::new()))
    }

    fn request(id: &str, always: &[&str]) -> PermissionRequest {
        PermissionRequest {
            id: id.to_string(),
            session_id: "s1".to_string(),
            permission: "bash".to_string(),
            patterns: vec!["git status".to_string()],
            always: always.iter().map(|value| value.to_string()).collect(),
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn failed_auto_approval_falls_back_to_asking() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sync = synchronizer(temp.path()).await;
        sync.memory()
            .merge("bash", &["git *".to_string()])
            .await
            .expect("merge");
        let mut notices = sync.notices();

        sync.apply_event(ServerEvent::PermissionAsked(request("r1", &["git *"])))
            .await;

        assert_eq!(
            sync.store().snapshot().pending_permission().map(|r| r.id.clone()),
            Some("r1".to_string())
        );
        match notices.try_recv().expect("notice") {
            ShellNotice::PermissionRequested(surfaced) => assert_eq!(surfaced.id, "r1"),
            other => panic!("unexpected notice {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_always_list_is_never_auto_approved() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sync = synchronizer(temp.path()).await;
        sync.apply_event(ServerEvent::PermissionAsked(request("r1", &[])))
            .await;
        assert_eq!(sync.pending_requests().len(), 1);
        assert_eq!(sync.store().snapshot().permission_queue.len(), 1);
    }

    #[tokio::test]
    async fn always_reply_persists_memory_even_when_the_server_is_gone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sync = synchronizer(temp.path()).await;
        sync.apply_event(ServerEvent::PermissionAsked(request("r1", &["git *"])))
            .await;

        let result = sync.respond("r1", PermissionReply::Always).await;
        assert!(matches!(result, Err(CadenceError::Connection { .. })));
        assert!(sync.memory().matches("bash", &["git *".to_string()]));
        assert!(sync.pending_requests().is_empty());
        assert!(sync.store().snapshot().permission_queue.is_empty());
    }

    #[tokio::test]
    async fn reply_to_unknown_request_is_best_effort() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sync = synchronizer(temp.path()).await;
        sync.respond("ghost", PermissionReply::Once)
            .await
            .expect("unknown ids are not errors");
    }

    #[tokio::test]
    async fn idle_notifies_only_when_unfocused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sync = synchronizer(temp.path()).await;
        let mut notices = sync.notices();

        sync.set_focused(true);
        sync.apply_event(ServerEvent::SessionIdle(SessionIdle {
            session_id: Some("s1".to_string()),
        }))
        .await;
        assert!(notices.try_recv().is_err());

        sync.set_focused(false);
        sync.apply_event(ServerEvent::SessionIdle(SessionIdle {
            session_id: Some("s1".to_string()),
        }))
        .await;
        assert_eq!(
            notices.try_recv().expect("completion notice"),
            ShellNotice::TaskCompleted {
                session_id: Some("s1".to_string())
            }
        );
    }

    #[tokio::test]
    async fn session_changes_mark_the_list_stale_without_touching_messages() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sync = synchronizer(temp.path()).await;
        sync.store().update(|state| state.open_session("s1", Vec::new()));
        sync.apply_event(ServerEvent::MessagePartUpdated(PartUpdated {
            part: Part::text_part("p1", "s1", "m1", "hi"),
            delta: None,
        }))
        .await;

        sync.apply_event(ServerEvent::SessionDeleted(SessionChange::default()))
            .await;
        sync.apply_event(ServerEvent::Unknown("installation.updated".to_string()))
            .await;

        let state = sync.store().snapshot();
        assert!(state.sessions_stale);
        assert_eq!(state.messages.len(), 1);
    }

    #[tokio::test]
    async fn failed_connection_ends_the_generation_with_a_notice() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sync = synchronizer(temp.path()).await;
        let mut notices = sync.notices();
        let mut status = sync.status();

        let generation = sync.restart().await;
        let ended = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            status.wait_for(|status| status.state.is_terminal()),
        )
        .await
        .expect("terminal state in time")
        .expect("status channel")
        .clone();
        assert_eq!(ended.generation, generation);
        assert!(matches!(ended.state, SubscriptionState::Failed(_)));

        assert!(matches!(notices.recv().await.expect("error"), ShellNotice::Error(_)));
        assert!(matches!(
            notices.recv().await.expect("ended"),
            ShellNotice::SubscriptionEnded { .. }
        ));
    }
}
