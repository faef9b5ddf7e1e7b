//! Bounded in-memory window of recent tool call events.
//!
//! The store is copy-on-write: the single writer mutates the current
//! [`StoreSnapshot`] through `Arc::make_mut` while readers hold on to the `Arc`
//! they cloned. A reader therefore sees a fixed set of events for as long as it
//! keeps its snapshot, and only ever holds the lock for one pointer clone.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::ToolCallEvent;

/// Result of a single [`RollingEventStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new event was stored; `evicted` older events were dropped to make room.
    Inserted { evicted: usize },
    /// An event with the same id was already stored and has been replaced in place.
    Replaced,
    /// The event started before the retention horizon and was not stored.
    Expired,
}

#[derive(Debug, Clone)]
struct Slot {
    /// Monotonic slot number; `slot - head` is the position in `events`.
    slot: u64,
    event: Arc<ToolCallEvent>,
}

/// An immutable view of the store contents at one point in time.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    events: VecDeque<Slot>,
    head: u64,
    by_id: HashMap<String, u64>,
    by_request: HashMap<String, Vec<u64>>,
    by_tool: HashMap<String, Vec<u64>>,
    latest: Option<DateTime<Utc>>,
    /// Number of appends applied, including replacements.
    version: u64,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Events in arrival order, oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ToolCallEvent> + '_ {
        self.events.iter().map(|slot| slot.event.as_ref())
    }

    pub fn get(&self, id: &str) -> Option<&ToolCallEvent> {
        self.by_id.get(id).and_then(|slot| self.at(*slot))
    }

    /// The last `n` events, newest first.
    pub fn recent(&self, n: usize) -> Vec<ToolCallEvent> {
        self.iter().rev().take(n).cloned().collect()
    }

    /// All events of one request, in chain order.
    pub fn by_request_id(&self, request_id: &str) -> Vec<ToolCallEvent> {
        let mut events = self.collect_slots(self.by_request.get(request_id));
        events.sort_by_key(ToolCallEvent::chain_key);
        events
    }

    /// All events of one tool, in arrival order.
    pub fn by_tool(&self, tool: &str) -> Vec<ToolCallEvent> {
        self.collect_slots(self.by_tool.get(tool))
    }

    /// Events whose start time falls in `[from, to)`, in arrival order.
    pub fn window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<ToolCallEvent> {
        self.iter()
            .filter(|e| e.started_at >= from && e.started_at < to)
            .cloned()
            .collect()
    }

    /// Slot the next inserted event will occupy. Replacements keep their slot.
    pub fn next_slot(&self) -> u64 {
        self.head + self.events.len() as u64
    }

    /// Events inserted at or after `slot`, oldest first.
    ///
    /// Use with a cursor from [`next_slot`](Self::next_slot) to follow new
    /// arrivals without revisiting replaced events.
    pub fn inserted_since(&self, slot: u64) -> Vec<ToolCallEvent> {
        let skip = slot.saturating_sub(self.head) as usize;
        self.events
            .iter()
            .skip(skip)
            .map(|s| s.event.as_ref().clone())
            .collect()
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> + '_ {
        self.by_tool.keys().map(String::as_str)
    }

    fn at(&self, slot: u64) -> Option<&ToolCallEvent> {
        let index = slot.checked_sub(self.head)? as usize;
        self.events.get(index).map(|s| s.event.as_ref())
    }

    fn collect_slots(&self, slots: Option<&Vec<u64>>) -> Vec<ToolCallEvent> {
        slots
            .map(|slots| {
                slots
                    .iter()
                    .filter_map(|slot| self.at(*slot).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn append(
        &mut self,
        event: ToolCallEvent,
        capacity: usize,
        retention: Option<chrono::Duration>,
    ) -> AppendOutcome {
        if let Some(&slot) = self.by_id.get(&event.id) {
            self.version += 1;
            self.replace(slot, event);
            return AppendOutcome::Replaced;
        }

        // a late arrival older than the horizon would sit behind newer events
        // where front eviction never reaches it
        if self
            .retention_cutoff(retention)
            .is_some_and(|cutoff| event.started_at < cutoff)
        {
            return AppendOutcome::Expired;
        }
        self.version += 1;

        if self.latest.map_or(true, |latest| event.started_at > latest) {
            self.latest = Some(event.started_at);
        }

        let slot = self.next_slot();
        self.by_id.insert(event.id.clone(), slot);
        self.by_request
            .entry(event.request_id.clone())
            .or_default()
            .push(slot);
        self.by_tool.entry(event.tool.clone()).or_default().push(slot);
        self.events.push_back(Slot {
            slot,
            event: Arc::new(event),
        });

        let mut evicted = 0;
        while self.events.len() > capacity {
            self.evict_front();
            evicted += 1;
        }
        if let Some(cutoff) = self.retention_cutoff(retention) {
            while self
                .events
                .front()
                .is_some_and(|front| front.event.started_at < cutoff)
            {
                self.evict_front();
                evicted += 1;
            }
        }

        AppendOutcome::Inserted { evicted }
    }

    /// `latest - retention`; `None` without retention or when it underflows.
    fn retention_cutoff(&self, retention: Option<chrono::Duration>) -> Option<DateTime<Utc>> {
        self.latest?.checked_sub_signed(retention?)
    }

    fn replace(&mut self, slot: u64, event: ToolCallEvent) {
        let index = (slot - self.head) as usize;
        let previous = Arc::clone(&self.events[index].event);

        if previous.request_id != event.request_id {
            remove_slot(&mut self.by_request, &previous.request_id, slot);
            insert_slot(&mut self.by_request, &event.request_id, slot);
        }
        if previous.tool != event.tool {
            remove_slot(&mut self.by_tool, &previous.tool, slot);
            insert_slot(&mut self.by_tool, &event.tool, slot);
        }
        if self.latest.map_or(true, |latest| event.started_at > latest) {
            self.latest = Some(event.started_at);
        }

        self.events[index].event = Arc::new(event);
    }

    fn evict_front(&mut self) {
        let Some(front) = self.events.pop_front() else {
            return;
        };
        self.head = front.slot + 1;
        self.by_id.remove(&front.event.id);
        remove_slot(&mut self.by_request, &front.event.request_id, front.slot);
        remove_slot(&mut self.by_tool, &front.event.tool, front.slot);
    }
}

fn remove_slot(index: &mut HashMap<String, Vec<u64>>, key: &str, slot: u64) {
    if let Some(slots) = index.get_mut(key) {
        if let Ok(pos) = slots.binary_search(&slot) {
            slots.remove(pos);
        }
        if slots.is_empty() {
            index.remove(key);
        }
    }
}

fn insert_slot(index: &mut HashMap<String, Vec<u64>>, key: &str, slot: u64) {
    let slots = index.entry(key.to_string()).or_default();
    if let Err(pos) = slots.binary_search(&slot) {
        slots.insert(pos, slot);
    }
}

/// Fixed-capacity, arrival-ordered buffer of recent events.
pub struct RollingEventStore {
    inner: RwLock<Arc<StoreSnapshot>>,
    capacity: usize,
    retention: Option<chrono::Duration>,
}

impl RollingEventStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Arc::new(StoreSnapshot::default())),
            capacity: capacity.max(1),
            retention: None,
        }
    }

    /// Also evict events older than `retention` relative to the newest event seen.
    ///
    /// Events that arrive already older than that horizon are not stored.
    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn append(&self, event: ToolCallEvent) -> AppendOutcome {
        let mut guard = self.inner.write();
        Arc::make_mut(&mut guard).append(event, self.capacity, self.retention)
    }

    /// The current contents. Later appends never alter the returned snapshot.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.inner.read())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn recent(&self, n: usize) -> Vec<ToolCallEvent> {
        self.snapshot().recent(n)
    }

    pub fn by_request_id(&self, request_id: &str) -> Vec<ToolCallEvent> {
        self.snapshot().by_request_id(request_id)
    }

    pub fn by_tool(&self, tool: &str) -> Vec<ToolCallEvent> {
        self.snapshot().by_tool(tool)
    }

    pub fn window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<ToolCallEvent> {
        self.snapshot().window(from, to)
    }
}

impl Default for RollingEventStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}
