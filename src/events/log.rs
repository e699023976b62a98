use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Event, EventHandler, EventType, NewEvent, Result};
use crate::clock::Clock;
use crate::consumer::{spawn_group_loop, ConsumerHandle, ConsumerOptions};
use crate::handler::DispatchResult;
use crate::store::{KeyValueStore, StreamEntry};

/// Stream field holding the JSON-encoded event.
pub(crate) const DATA_FIELD: &str = "data";

/// Outcome of appending to one secondary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAppend {
    pub stream: String,
    /// Store entry id, or the error message if the append failed.
    pub result: std::result::Result<String, String>,
}

/// Result of publishing one event.
///
/// The global append always succeeded if this value exists. Secondary
/// appends are independent and may have failed; they are not retried.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPublication {
    pub event: Event,
    pub main_entry_id: String,
    pub secondary: Vec<StreamAppend>,
}

impl EventPublication {
    /// True if every stream the event belongs to received it.
    pub fn is_complete(&self) -> bool {
        self.secondary.iter().all(|s| s.result.is_ok())
    }

    pub fn failed_streams(&self) -> Vec<&str> {
        self.secondary
            .iter()
            .filter(|s| s.result.is_err())
            .map(|s| s.stream.as_str())
            .collect()
    }
}

/// Which events a consumer wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeFilter {
    /// Only deliver events of this type; others are acked and skipped.
    pub event_type: Option<EventType>,
    /// Read one entity's stream instead of the global stream.
    pub entity: Option<(String, String)>,
}

impl ConsumeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity = Some((entity_type.into(), entity_id.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub streams: u64,
    pub total_entries: u64,
}

/// Event log rooted at one stream prefix.
pub struct EventLog {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    append_lock: Arc<Mutex<()>>,
}

impl EventLog {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            prefix: prefix.into(),
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Serialize appends with every log holding the same lock.
    pub fn with_append_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.append_lock = lock;
        self
    }

    pub fn main_stream(&self) -> String {
        format!("{}:main", self.prefix)
    }

    pub fn entity_stream(&self, entity_type: &str, entity_id: &str) -> String {
        format!("{}:entity:{}:{}", self.prefix, entity_type, entity_id)
    }

    pub fn user_stream(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.prefix, user_id)
    }

    fn new_event_id(&self, now_ms: i64) -> String {
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", now_ms, &random[..9])
    }

    /// Append an event to the global stream and to its entity and user streams.
    ///
    /// Fails only if the global append fails. Secondary append failures are
    /// reported in the returned publication.
    #[tracing::instrument(name = "events.publish", skip_all, fields(event_type = %new.event_type))]
    pub async fn publish(&self, new: NewEvent) -> Result<EventPublication> {
        let now_ms = self.clock.now_epoch_ms();
        let event = Event {
            event_id: self.new_event_id(now_ms),
            event_type: new.event_type,
            timestamp_epoch_ms: now_ms,
            user_id: new.user_id,
            entity_id: new.entity_id,
            entity_type: new.entity_type,
            payload: new.payload,
            metadata: new.metadata,
        };
        let fields = vec![(DATA_FIELD.to_string(), serde_json::to_string(&event)?)];

        let mut secondary_streams = Vec::new();
        if let (Some(entity_type), Some(entity_id)) = (&event.entity_type, &event.entity_id) {
            secondary_streams.push(self.entity_stream(entity_type, entity_id));
        }
        if let Some(user_id) = &event.user_id {
            secondary_streams.push(self.user_stream(user_id));
        }

        // Logs sharing the lock append in turn, so their streams agree on
        // order. Writers in other processes are not coordinated.
        let _guard = self.append_lock.lock().await;

        let main_entry_id = self.store.xadd(&self.main_stream(), &fields).await?;

        let mut secondary = Vec::with_capacity(secondary_streams.len());
        for stream in secondary_streams {
            let result = match self.store.xadd(&stream, &fields).await {
                Ok(id) => Ok(id),
                Err(e) => {
                    warn!(
                        stream = %stream,
                        event_id = %event.event_id,
                        error = %e,
                        "Secondary stream append failed"
                    );
                    Err(e.to_string())
                }
            };
            secondary.push(StreamAppend { stream, result });
        }

        debug!(event_id = %event.event_id, entry_id = %main_entry_id, "Published event");
        Ok(EventPublication {
            event,
            main_entry_id,
            secondary,
        })
    }

    /// Start a consumer-group loop delivering events to `handler`.
    ///
    /// Handler failures leave the entry pending so it is delivered again.
    /// Undecodable entries are logged and acknowledged.
    pub fn consume(
        &self,
        handler: Arc<dyn EventHandler>,
        filter: ConsumeFilter,
        options: ConsumerOptions,
    ) -> ConsumerHandle {
        let stream = match &filter.entity {
            Some((entity_type, entity_id)) => self.entity_stream(entity_type, entity_id),
            None => self.main_stream(),
        };
        let wanted = filter.event_type;

        let token = CancellationToken::new();
        let mut handle = ConsumerHandle::new(token.clone());
        handle.push(spawn_group_loop(
            self.store.clone(),
            stream,
            options,
            token,
            move |entry| {
                let handler = handler.clone();
                async move { process_entry(entry, wanted, handler).await.entry_outcome() }
            },
        ));
        handle
    }

    /// Events of one entity with store time at or after `since_epoch_ms`.
    ///
    /// Reads the stream directly without a consumer group, so replays can be
    /// repeated and resumed from the last timestamp seen.
    pub async fn replay(
        &self,
        entity_type: &str,
        entity_id: &str,
        since_epoch_ms: i64,
    ) -> Result<Vec<Event>> {
        let stream = self.entity_stream(entity_type, entity_id);
        self.read_range(&stream, since_epoch_ms, None).await
    }

    /// Events of the global stream from `since_epoch_ms`, at most `limit`.
    pub async fn replay_global(&self, since_epoch_ms: i64, limit: Option<usize>) -> Result<Vec<Event>> {
        self.read_range(&self.main_stream(), since_epoch_ms, limit)
            .await
    }

    async fn read_range(
        &self,
        stream: &str,
        since_epoch_ms: i64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let start = since_epoch_ms.max(0).to_string();
        let entries = self.store.xrange(stream, &start, "+", limit).await?;

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match decode_entry(&entry) {
                Ok(event) => events.push(event),
                Err(reason) => {
                    warn!(stream = %stream, id = %entry.id, reason = %reason, "Skipping undecodable entry");
                }
            }
        }
        Ok(events)
    }

    /// Number of streams under the events prefix and their total length.
    pub async fn get_stats(&self) -> Result<EventStats> {
        let streams = self.store.scan(&format!("{}:*", self.prefix)).await?;
        let mut stats = EventStats::default();
        for stream in streams {
            stats.streams += 1;
            stats.total_entries += self.store.xlen(&stream).await?;
        }
        info!(
            prefix = %self.prefix,
            streams = stats.streams,
            total_entries = stats.total_entries,
            "Collected event stats"
        );
        Ok(stats)
    }
}

fn decode_entry(entry: &StreamEntry) -> std::result::Result<Event, String> {
    let data = entry
        .field(DATA_FIELD)
        .ok_or_else(|| format!("missing '{}' field", DATA_FIELD))?;
    serde_json::from_str(data).map_err(|e| e.to_string())
}

async fn process_entry(
    entry: StreamEntry,
    wanted: Option<EventType>,
    handler: Arc<dyn EventHandler>,
) -> DispatchResult {
    let event = match decode_entry(&entry) {
        Ok(event) => event,
        Err(reason) => {
            error!(id = %entry.id, reason = %reason, "Failed to decode event");
            return DispatchResult::DecodeError;
        }
    };

    if wanted.is_some_and(|t| t != event.event_type) {
        return DispatchResult::Skipped;
    }

    let event_id = event.event_id.clone();
    match handler.handle(Arc::new(event)).await {
        Ok(()) => DispatchResult::Success,
        Err(e) => {
            warn!(event_id = %event_id, error = %e, "Event handler failed");
            DispatchResult::HandlerFailed
        }
    }
}
