//! Cancellable consumer-group polling loop.
//!
//! Shared by the event log and the broker's stream leg. Each poll:
//!
//! 1. re-reads one page of this consumer's pending entries (delivered but
//!    never acked), continuing from where the previous page ended;
//! 2. claims entries other consumers of the group left idle, such as the
//!    pending list of a process that exited;
//! 3. reads new entries.
//!
//! Entries whose processing returns [`EntryOutcome::Retry`] stay pending and
//! come back on a later poll, which gives at-least-once delivery.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{self, KeyValueStore, ReadCursor, StoreError, StreamEntry, CLAIM_START};

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver the whole stream history to the group.
    #[default]
    Beginning,
    /// Deliver only entries appended after the group is created.
    Latest,
}

impl GroupStart {
    pub fn as_id(&self) -> &'static str {
        match self {
            Self::Beginning => "0",
            Self::Latest => "$",
        }
    }
}

/// Default idle time before another consumer's entry is claimed.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(30);

/// Settings for one consumer-group loop.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    /// How long a read for new entries may block server-side.
    pub block: Option<Duration>,
    /// Pause after a successful or empty poll.
    pub idle_backoff: Duration,
    /// Pause after a failed poll.
    pub error_backoff: Duration,
    pub start: GroupStart,
    /// Claim other consumers' entries once they sit unacked this long.
    /// `None` disables claiming.
    pub claim_idle: Option<Duration>,
}

impl ConsumerOptions {
    /// Options for `group` with consumer name `{group}-{pid}`.
    pub fn new(group: impl Into<String>) -> Self {
        let group = group.into();
        let consumer = format!("{}-{}", group, std::process::id());
        Self {
            group,
            consumer,
            batch_size: 10,
            block: Some(Duration::from_millis(1000)),
            idle_backoff: Duration::from_millis(100),
            error_backoff: Duration::from_secs(5),
            start: GroupStart::Beginning,
            claim_idle: Some(DEFAULT_CLAIM_IDLE),
        }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block(mut self, block: Option<Duration>) -> Self {
        self.block = block;
        self
    }

    pub fn with_backoff(mut self, idle: Duration, error: Duration) -> Self {
        self.idle_backoff = idle;
        self.error_backoff = error;
        self
    }

    pub fn with_start(mut self, start: GroupStart) -> Self {
        self.start = start;
        self
    }

    pub fn with_claim_idle(mut self, claim_idle: Option<Duration>) -> Self {
        self.claim_idle = claim_idle;
        self
    }
}

/// What to do with an entry after processing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Acknowledge; the entry will not be delivered to the group again.
    Ack,
    /// Leave pending for redelivery.
    Retry,
}

/// Create the consumer group, treating an existing group as success.
pub async fn ensure_group(
    store: &dyn KeyValueStore,
    stream: &str,
    group: &str,
    start: GroupStart,
) -> store::Result<()> {
    match store.xgroup_create(stream, group, start.as_id()).await {
        Ok(()) => {
            info!(stream = %stream, group = %group, "Created consumer group");
            Ok(())
        }
        Err(StoreError::GroupExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Handle to one or more running consumer tasks.
///
/// Dropping the handle does not stop the tasks; call [`cancel`](Self::cancel)
/// or [`shutdown`](Self::shutdown).
#[derive(Debug)]
pub struct ConsumerHandle {
    token: CancellationToken,
    children: Vec<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            children: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Take over the tasks of another handle; cancelling this one cancels both.
    pub fn absorb(&mut self, other: ConsumerHandle) {
        if self.token.is_cancelled() {
            other.cancel();
        }
        self.children.push(other.token);
        self.children.extend(other.children);
        self.tasks.extend(other.tasks);
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Number of tasks tracked by this handle.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every loop to stop at its next poll boundary.
    pub fn cancel(&self) {
        self.token.cancel();
        for child in &self.children {
            child.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for all tasks to finish.
    pub async fn shutdown(self) {
        self.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "Consumer task panicked");
                }
            }
        }
    }
}

/// Spawn a consumer-group loop over `stream` that runs until `token` fires.
pub fn spawn_group_loop<F, Fut>(
    store: Arc<dyn KeyValueStore>,
    stream: String,
    options: ConsumerOptions,
    token: CancellationToken,
    process: F,
) -> JoinHandle<()>
where
    F: Fn(StreamEntry) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EntryOutcome> + Send,
{
    tokio::spawn(async move {
        run_group_loop(store.as_ref(), &stream, &options, &token, &process).await;
    })
}

/// Read positions carried between polls.
#[derive(Debug)]
struct PollState {
    group_ready: bool,
    pending_after: String,
    claim_start: String,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            group_ready: false,
            pending_after: ReadCursor::pending().as_id().to_string(),
            claim_start: CLAIM_START.to_string(),
        }
    }
}

async fn run_group_loop<F, Fut>(
    store: &dyn KeyValueStore,
    stream: &str,
    options: &ConsumerOptions,
    token: &CancellationToken,
    process: &F,
) where
    F: Fn(StreamEntry) -> Fut,
    Fut: Future<Output = EntryOutcome>,
{
    info!(
        stream = %stream,
        group = %options.group,
        consumer = %options.consumer,
        "Consumer loop started"
    );
    let mut state = PollState::default();

    loop {
        if token.is_cancelled() {
            break;
        }

        let result = poll_once(store, stream, options, token, process, &mut state).await;

        let delay = match result {
            Ok(processed) => {
                if processed > 0 {
                    debug!(stream = %stream, processed = processed, "Poll processed entries");
                }
                options.idle_backoff
            }
            Err(e) => {
                state = PollState::default();
                error!(
                    stream = %stream,
                    group = %options.group,
                    error = %e,
                    backoff_ms = %options.error_backoff.as_millis(),
                    "Consumer poll failed"
                );
                options.error_backoff
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(stream = %stream, group = %options.group, "Consumer loop stopped");
}

async fn poll_once<F, Fut>(
    store: &dyn KeyValueStore,
    stream: &str,
    options: &ConsumerOptions,
    token: &CancellationToken,
    process: &F,
    state: &mut PollState,
) -> store::Result<usize>
where
    F: Fn(StreamEntry) -> Fut,
    Fut: Future<Output = EntryOutcome>,
{
    if !state.group_ready {
        ensure_group(store, stream, &options.group, options.start).await?;
        state.group_ready = true;
    }

    let mut processed = 0;

    // Reads race cancellation; processing and acks run to completion.
    let cursor = ReadCursor::pending_after(state.pending_after.clone());
    let read = store.xreadgroup(
        stream,
        &options.group,
        &options.consumer,
        cursor,
        options.batch_size,
        None,
    );
    let pending = tokio::select! {
        _ = token.cancelled() => return Ok(processed),
        entries = read => entries?,
    };
    // A short page ends the sweep; the next one starts over from the head.
    state.pending_after = match pending.last() {
        Some(last) if pending.len() >= options.batch_size => last.id.clone(),
        _ => ReadCursor::pending().as_id().to_string(),
    };
    processed += settle(store, stream, options, pending, process).await?;

    if let Some(min_idle) = options.claim_idle {
        let claim = store.xautoclaim(
            stream,
            &options.group,
            &options.consumer,
            min_idle,
            &state.claim_start,
            options.batch_size,
        );
        let claim = tokio::select! {
            _ = token.cancelled() => return Ok(processed),
            claim = claim => claim?,
        };
        if !claim.entries.is_empty() || !claim.deleted.is_empty() {
            info!(
                stream = %stream,
                group = %options.group,
                claimed = claim.entries.len(),
                deleted = claim.deleted.len(),
                "Claimed idle entries"
            );
        }
        state.claim_start = claim.next;
        processed += settle(store, stream, options, claim.entries, process).await?;
    }

    let read = store.xreadgroup(
        stream,
        &options.group,
        &options.consumer,
        ReadCursor::New,
        options.batch_size,
        options.block,
    );
    let fresh = tokio::select! {
        _ = token.cancelled() => return Ok(processed),
        entries = read => entries?,
    };
    processed += settle(store, stream, options, fresh, process).await?;

    Ok(processed)
}

/// Process `entries` in order and ack the ones that are done.
async fn settle<F, Fut>(
    store: &dyn KeyValueStore,
    stream: &str,
    options: &ConsumerOptions,
    entries: Vec<StreamEntry>,
    process: &F,
) -> store::Result<usize>
where
    F: Fn(StreamEntry) -> Fut,
    Fut: Future<Output = EntryOutcome>,
{
    let count = entries.len();
    let mut acked = Vec::new();
    for entry in entries {
        let id = entry.id.clone();
        if entry.fields.is_empty() {
            warn!(stream = %stream, id = %id, "Pending entry was trimmed, acking");
            acked.push(id);
            continue;
        }
        match process(entry).await {
            EntryOutcome::Ack => acked.push(id),
            EntryOutcome::Retry => {
                warn!(stream = %stream, id = %id, "Entry left pending for redelivery");
            }
        }
    }

    if !acked.is_empty() {
        store.xack(stream, &options.group, &acked).await?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_options(group: &str) -> ConsumerOptions {
        ConsumerOptions::new(group)
            .with_consumer("c1")
            .with_block(None)
            .with_backoff(Duration::from_millis(5), Duration::from_millis(5))
    }

    fn data(value: &str) -> Vec<(String, String)> {
        vec![("data".to_string(), value.to_string())]
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_default_consumer_name_uses_pid() {
        let options = ConsumerOptions::new("workers");
        assert_eq!(options.consumer, format!("workers-{}", std::process::id()));
        assert_eq!(options.start.as_id(), "0");
        assert_eq!(options.claim_idle, Some(DEFAULT_CLAIM_IDLE));
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent() {
        let store = MemoryStore::new();
        ensure_group(&store, "s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        ensure_group(&store, "s", "g", GroupStart::Beginning)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_retry_is_redelivered_then_acked_once() {
        let store = Arc::new(MemoryStore::new());
        store.xadd("s", &data("x")).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let token = CancellationToken::new();
        let mut handle = ConsumerHandle::new(token.clone());
        handle.push(spawn_group_loop(
            store.clone(),
            "s".to_string(),
            fast_options("g"),
            token,
            move |_entry| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        EntryOutcome::Retry
                    } else {
                        EntryOutcome::Ack
                    }
                }
            },
        ));

        wait_until(|| calls.load(Ordering::SeqCst) >= 2).await;
        handle.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.xpending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poison_entries_do_not_starve_later_retries() {
        let store = Arc::new(MemoryStore::new());
        store.xadd("s", &data("poison")).await.unwrap();
        store.xadd("s", &data("flaky")).await.unwrap();

        let flaky_calls = Arc::new(AtomicUsize::new(0));
        let counter = flaky_calls.clone();
        let token = CancellationToken::new();
        let mut handle = ConsumerHandle::new(token.clone());
        handle.push(spawn_group_loop(
            store.clone(),
            "s".to_string(),
            fast_options("g").with_batch_size(1),
            token,
            move |entry| {
                let counter = counter.clone();
                async move {
                    if entry.field("data") == Some("poison") {
                        return EntryOutcome::Retry;
                    }
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        EntryOutcome::Retry
                    } else {
                        EntryOutcome::Ack
                    }
                }
            },
        ));

        wait_until(|| flaky_calls.load(Ordering::SeqCst) >= 2).await;
        handle.shutdown().await;

        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.xpending_count("s", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restarted_consumer_claims_abandoned_entries() {
        let store = Arc::new(MemoryStore::new());
        store.xadd("s", &data("x")).await.unwrap();
        ensure_group(store.as_ref(), "s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        // The previous process read the entry and exited before acking.
        let abandoned = store
            .xreadgroup("s", "g", "g-1111", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(abandoned.len(), 1);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let token = CancellationToken::new();
        let mut handle = ConsumerHandle::new(token.clone());
        handle.push(spawn_group_loop(
            store.clone(),
            "s".to_string(),
            fast_options("g")
                .with_consumer("g-2222")
                .with_claim_idle(Some(Duration::from_millis(20))),
            token,
            move |_entry| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    EntryOutcome::Ack
                }
            },
        ));

        wait_until(|| calls.load(Ordering::SeqCst) >= 1).await;
        handle.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.xpending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claiming_disabled_leaves_other_consumers_entries() {
        let store = Arc::new(MemoryStore::new());
        store.xadd("s", &data("x")).await.unwrap();
        ensure_group(store.as_ref(), "s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        store
            .xreadgroup("s", "g", "other", ReadCursor::New, 10, None)
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let token = CancellationToken::new();
        let mut handle = ConsumerHandle::new(token.clone());
        handle.push(spawn_group_loop(
            store.clone(),
            "s".to_string(),
            fast_options("g").with_claim_idle(None),
            token,
            move |_entry| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    EntryOutcome::Ack
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.xpending_count("s", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_loop() {
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        let mut handle = ConsumerHandle::new(token.clone());
        handle.push(spawn_group_loop(
            store,
            "s".to_string(),
            fast_options("g"),
            token,
            |_entry| async { EntryOutcome::Ack },
        ));

        handle.cancel();
        assert!(handle.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("loop did not stop");
    }

    #[test]
    fn test_absorbed_handle_is_cancelled_with_parent() {
        let mut parent = ConsumerHandle::new(CancellationToken::new());
        let child_token = CancellationToken::new();
        parent.absorb(ConsumerHandle::new(child_token.clone()));
        parent.cancel();
        assert!(child_token.is_cancelled());
    }
}
