use std::fmt;
use std::future::Future;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Idle,
    Starting,
    Active,
    /// Cancelled by a restart or shutdown.
    Superseded,
    /// The server ended the stream.
    Closed,
    Failed(String),
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Superseded | Self::Closed | Self::Failed(_))
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Starting => f.write_str("starting"),
            Self::Active => f.write_str("active"),
            Self::Superseded => f.write_str("superseded"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub generation: u64,
    pub state: SubscriptionState,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self {
            generation: 0,
            state: SubscriptionState::Idle,
        }
    }
}

#[derive(Debug)]
struct ActiveSubscription {
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owner of the single live event subscription.
///
/// The slot holds at most one running generation. [`supersede`](Self::supersede)
/// cancels the current one and waits for its task to return before the next
/// task is spawned, so two generations never run side by side.
#[derive(Debug, Default)]
pub struct SubscriptionSlot {
    active: Option<ActiveSubscription>,
    last_generation: u64,
}

impl SubscriptionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_generation(&self) -> Option<u64> {
        self.active.as_ref().map(|active| active.generation)
    }

    /// Whether a generation has been started and its task has not returned.
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .map(|active| !active.task.is_finished())
            .unwrap_or(false)
    }

    pub async fn supersede<F, Fut>(&mut self, start: F) -> u64
    where
        F: FnOnce(u64, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel().await;

        self.last_generation += 1;
        let generation = self.last_generation;
        let token = CancellationToken::new();
        let task = tokio::spawn(start(generation, token.clone()));
        self.active = Some(ActiveSubscription {
            generation,
            token,
            task,
        });
        generation
    }

    /// Cancels the running generation and waits for it to stop.
    pub async fn cancel(&mut self) -> Option<u64> {
        let active = self.active.take()?;
        active.token.cancel();
        if let Err(err) = active.task.await {
            if err.is_panic() {
                tracing::warn!(generation = active.generation, "event subscription task panicked");
            }
        }
        Some(active.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: String) {
        log.lock().expect("log lock").push(entry);
    }

    fn worker(log: Log) -> impl FnOnce(u64, CancellationToken) -> futures::future::BoxFuture<'static, ()> {
        move |generation, token| {
            Box::pin(async move {
                record(&log, format!("start {generation}"));
                token.cancelled().await;
                // Slow teardown: the next generation must still wait for it.
                tokio::time::sleep(Duration::from_millis(30)).await;
                record(&log, format!("stop {generation}"));
            })
        }
    }

    #[tokio::test]
    async fn supersede_waits_for_the_previous_generation() {
        let log: Log = Arc::default();
        let mut slot = SubscriptionSlot::new();

        assert_eq!(slot.supersede(worker(log.clone())).await, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(slot.supersede(worker(log.clone())).await, 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(slot.active_generation(), Some(2));
        assert!(slot.is_running());

        assert_eq!(slot.cancel().await, Some(2));
        assert_eq!(slot.cancel().await, None);
        assert!(!slot.is_running());

        let log = log.lock().expect("log lock").clone();
        assert_eq!(log, vec!["start 1", "stop 1", "start 2", "stop 2"]);
    }

    #[tokio::test]
    async fn finished_generation_is_not_running() {
        let mut slot = SubscriptionSlot::new();
        slot.supersede(|_, _| async {}).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!slot.is_running());
        assert_eq!(slot.active_generation(), Some(1));
    }

    #[test]
    fn terminal_states() {
        assert!(SubscriptionState::Closed.is_terminal());
        assert!(SubscriptionState::Failed("reset".to_string()).is_terminal());
        assert!(!SubscriptionState::Active.is_terminal());
        assert_eq!(
            SubscriptionState::Failed("reset".to_string()).to_string(),
            "failed: reset"
        );
    }
}
