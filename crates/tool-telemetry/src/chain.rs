use std::sync::Arc;

use crate::store::{RollingEventStore, StoreSnapshot};
use crate::types::ToolCallChain;

/// Materialize the chain for `request_id` from one snapshot.
///
/// `None` means no stored event carries that request id.
pub fn build_chain(snapshot: &StoreSnapshot, request_id: &str) -> Option<ToolCallChain> {
    let calls = snapshot.by_request_id(request_id);
    if calls.is_empty() {
        return None;
    }

    let total_duration_ms = calls
        .iter()
        .fold(0u64, |total, c| total.saturating_add(c.duration_ms));
    let first_start = calls.iter().map(|c| c.started_at).min()?;
    let last_finish = calls.iter().map(|c| c.finished_at()).max()?;
    let span_ms = (last_finish - first_start).num_milliseconds().max(0) as u64;

    Some(ToolCallChain {
        request_id: request_id.to_string(),
        calls,
        total_duration_ms,
        span_ms,
    })
}

/// Groups stored events by request id into ordered chains.
#[derive(Clone)]
pub struct ChainReconstructor {
    store: Arc<RollingEventStore>,
}

impl ChainReconstructor {
    pub fn new(store: Arc<RollingEventStore>) -> Self {
        Self { store }
    }

    pub fn chain_for(&self, request_id: &str) -> Option<ToolCallChain> {
        build_chain(&self.store.snapshot(), request_id)
    }
}
