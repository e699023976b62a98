//! Stream and consumer-group state for the in-memory store.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use crate::store::{
    parse_stream_id, ReadCursor, StoreError, StreamClaim, StreamEntry, CLAIM_START,
};

pub(super) type EntryId = (u64, u64);

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    deliveries: u64,
    delivered_at_ms: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

/// Append-only log with consumer groups and a pending-entries list per group.
#[derive(Debug, Default)]
pub(super) struct StreamLog {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

pub(super) fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

/// Parse a range bound. Bare millisecond bounds cover the whole millisecond.
fn parse_bound(raw: &str, is_end: bool) -> Result<EntryId, StoreError> {
    match raw {
        "-" => Ok((0, 0)),
        "+" => Ok((u64::MAX, u64::MAX)),
        _ if !raw.contains('-') => {
            let ms = raw
                .parse::<u64>()
                .map_err(|_| StoreError::Command(format!("Invalid stream ID: {}", raw)))?;
            Ok(if is_end { (ms, u64::MAX) } else { (ms, 0) })
        }
        _ => parse_stream_id(raw)
            .ok_or_else(|| StoreError::Command(format!("Invalid stream ID: {}", raw))),
    }
}

fn missing_group(stream: &str, group: &str) -> StoreError {
    StoreError::Command(format!(
        "NOGROUP No such consumer group '{}' for key '{}'",
        group, stream
    ))
}

fn to_entry(id: EntryId, fields: &HashMap<String, String>) -> StreamEntry {
    StreamEntry {
        id: format_id(id),
        fields: fields.clone(),
    }
}

impl StreamLog {
    pub(super) fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Append with an id derived from `now_ms`, strictly greater than the last one.
    pub(super) fn append(&mut self, now_ms: u64, fields: &[(String, String)]) -> String {
        let id = if now_ms > self.last_id.0 {
            (now_ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = id;
        self.entries.insert(id, fields.iter().cloned().collect());
        format_id(id)
    }

    pub(super) fn create_group(
        &mut self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        if self.groups.contains_key(group) {
            return Err(StoreError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let last_delivered = match start_id {
            "$" => self.last_id,
            other => parse_bound(other, false)?,
        };
        self.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub(super) fn read_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: &ReadCursor,
        count: usize,
        now_ms: u64,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let state = self
            .groups
            .get_mut(group)
            .ok_or_else(|| missing_group(stream, group))?;
        let count = count.max(1);

        match cursor {
            ReadCursor::New => {
                let fresh: Vec<EntryId> = self
                    .entries
                    .range((Bound::Excluded(state.last_delivered), Bound::Unbounded))
                    .take(count)
                    .map(|(id, _)| *id)
                    .collect();

                let mut out = Vec::with_capacity(fresh.len());
                for id in fresh {
                    state.last_delivered = id;
                    state.pending.insert(
                        id,
                        PendingEntry {
                            consumer: consumer.to_string(),
                            deliveries: 1,
                            delivered_at_ms: now_ms,
                        },
                    );
                    if let Some(fields) = self.entries.get(&id) {
                        out.push(to_entry(id, fields));
                    }
                }
                Ok(out)
            }
            ReadCursor::Pending { after } => {
                let after = parse_bound(after, false)?;
                let mut out = Vec::new();
                let owned = state
                    .pending
                    .range_mut((Bound::Excluded(after), Bound::Unbounded))
                    .filter(|(_, pending)| pending.consumer == consumer)
                    .take(count);
                for (id, pending) in owned {
                    pending.deliveries += 1;
                    pending.delivered_at_ms = now_ms;
                    // A trimmed entry stays pending and is returned without fields.
                    out.push(match self.entries.get(id) {
                        Some(fields) => to_entry(*id, fields),
                        None => StreamEntry {
                            id: format_id(*id),
                            fields: HashMap::new(),
                        },
                    });
                }
                Ok(out)
            }
        }
    }

    /// Move pending entries idle for at least `min_idle_ms` to `consumer`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: &str,
        count: usize,
        now_ms: u64,
    ) -> Result<StreamClaim, StoreError> {
        let state = self
            .groups
            .get_mut(group)
            .ok_or_else(|| missing_group(stream, group))?;
        let start = parse_bound(start, false)?;
        let count = count.max(1);

        let mut claim = StreamClaim::default();
        let mut next = None;
        let mut deleted = Vec::new();
        for (id, pending) in state.pending.range_mut(start..) {
            if claim.entries.len() >= count {
                next = Some(*id);
                break;
            }
            if now_ms.saturating_sub(pending.delivered_at_ms) < min_idle_ms {
                continue;
            }
            match self.entries.get(id) {
                Some(fields) => {
                    pending.consumer = consumer.to_string();
                    pending.deliveries += 1;
                    pending.delivered_at_ms = now_ms;
                    claim.entries.push(to_entry(*id, fields));
                }
                None => deleted.push(*id),
            }
        }
        for id in &deleted {
            state.pending.remove(id);
        }

        claim.deleted = deleted.into_iter().map(format_id).collect();
        claim.next = next.map(format_id).unwrap_or_else(|| CLAIM_START.to_string());
        Ok(claim)
    }

    pub(super) fn ack(&mut self, group: &str, ids: &[String]) -> u64 {
        let Some(state) = self.groups.get_mut(group) else {
            return 0;
        };
        ids.iter()
            .filter_map(|raw| parse_stream_id(raw))
            .filter(|id| state.pending.remove(id).is_some())
            .count() as u64
    }

    pub(super) fn range(
        &self,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let from = parse_bound(start, false)?;
        let to = parse_bound(end, true)?;
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .range(from..=to)
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| to_entry(*id, fields))
            .collect())
    }

    pub(super) fn pending_count(&self, group: &str) -> u64 {
        self.groups
            .get(group)
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0)
    }

    /// Delivery count of a pending entry (diagnostics).
    pub(super) fn deliveries(&self, group: &str, id: &str) -> Option<u64> {
        let id = parse_stream_id(id)?;
        self.groups
            .get(group)?
            .pending
            .get(&id)
            .map(|p| p.deliveries)
    }
}
