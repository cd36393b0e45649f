//! Burst-debouncing buffer: per-user ordered fragment store plus a registry
//! of cancellable debounce timers.
//!
//! Every enqueue appends to the user's pending burst and replaces the user's
//! timer. When a timer fires after a quiet window it drains the whole burst
//! and submits one consolidated message downstream. Timer cancellation is
//! best-effort only; the staleness check in [`MessageBuffer::fire`] is the
//! authoritative dedup mechanism for callbacks that outlive their
//! cancellation.

use ana_channels::{InboundMessage, MessageId, UserKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Separator between fragments of one consolidated burst.
pub const FRAGMENT_SEPARATOR: &str = " | ";

/// One coalesced unit of work handed to the router pipeline.
#[derive(Debug, Clone)]
pub struct ConsolidatedBurst {
    pub user_key: UserKey,
    pub transport_address: String,
    pub display_name: String,
    /// Fragments joined in arrival order with [`FRAGMENT_SEPARATOR`].
    pub content: String,
    /// Id of the fragment whose timer drained the burst.
    pub trigger_message_id: MessageId,
    pub fragment_count: usize,
    pub received_at: DateTime<Utc>,
}

/// Consumer of drained bursts. Implementations own all downstream failure
/// handling; the buffer never retries a submission.
#[async_trait]
pub trait BurstSink: Send + Sync {
    async fn submit(&self, burst: ConsolidatedBurst);
}

#[derive(Debug, Clone)]
struct Fragment {
    content: String,
    message_id: MessageId,
    arrival_index: usize,
}

struct PendingBurst {
    transport_address: String,
    display_name: String,
    fragments: Vec<Fragment>,
    started_at: DateTime<Utc>,
    /// Safety net against lost timer state (e.g. process restart): a burst
    /// older than this is dropped instead of processed.
    expires_at: Instant,
}

impl PendingBurst {
    fn new(msg: &InboundMessage) -> Self {
        Self {
            transport_address: msg.transport_address.clone(),
            display_name: msg.display_name.clone(),
            fragments: Vec::new(),
            started_at: msg.received_at,
            expires_at: Instant::now(),
        }
    }

    fn push(&mut self, msg: &InboundMessage) {
        self.fragments.push(Fragment {
            content: msg.content.clone(),
            message_id: msg.message_id.clone(),
            arrival_index: self.fragments.len(),
        });
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// An empty or missing id on either side auto-matches, preserving
    /// forward progress when upstream omits message ids.
    fn tail_matches(&self, captured: &MessageId) -> bool {
        if captured.is_empty() {
            return true;
        }
        match self.fragments.last() {
            Some(tail) if !tail.message_id.is_empty() => tail.message_id == *captured,
            _ => true,
        }
    }

    fn consolidate(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join(FRAGMENT_SEPARATOR)
    }
}

struct DebounceHandle {
    captured_id: MessageId,
    task: JoinHandle<()>,
}

/// Observability snapshot returned by [`MessageBuffer::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub burst_len: usize,
    pub last_message_id: MessageId,
}

pub struct MessageBuffer {
    bursts: DashMap<UserKey, PendingBurst>,
    timers: DashMap<UserKey, DebounceHandle>,
    window: Duration,
    ttl_margin: Duration,
    sink: Arc<dyn BurstSink>,
}

impl MessageBuffer {
    pub fn new(window: Duration, ttl_margin: Duration, sink: Arc<dyn BurstSink>) -> Self {
        Self {
            bursts: DashMap::new(),
            timers: DashMap::new(),
            window,
            ttl_margin,
            sink,
        }
    }

    /// Appends a fragment to the user's pending burst (creating it if absent,
    /// restarting it if its TTL lapsed), refreshes the burst TTL, and
    /// replaces the user's debounce timer. Never suspends on downstream
    /// work; only the burst store and the timer registry are touched.
    pub fn enqueue(self: &Arc<Self>, msg: InboundMessage) -> EnqueueReceipt {
        let key = msg.user_key.clone();
        let now = Instant::now();

        let burst_len = {
            let mut entry = self
                .bursts
                .entry(key.clone())
                .or_insert_with(|| PendingBurst::new(&msg));
            if entry.is_expired(now) && !entry.fragments.is_empty() {
                tracing::warn!(user_key = %key, "pending burst expired; starting a new one");
                *entry = PendingBurst::new(&msg);
            }
            entry.push(&msg);
            entry.expires_at = now + self.window + self.ttl_margin;
            entry.fragments.len()
        };

        let buffer = Arc::clone(self);
        let fire_key = key.clone();
        let captured_id = msg.message_id.clone();
        let timer_id = captured_id.clone();
        let window = self.window;
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            buffer.fire(&fire_key, &timer_id).await;
        });

        // Insert-and-cancel must be atomic per key; the shard lock held by
        // DashMap::insert gives us that critical section.
        if let Some(previous) = self.timers.insert(
            key.clone(),
            DebounceHandle {
                captured_id: captured_id.clone(),
                task,
            },
        ) {
            previous.task.abort();
            tracing::debug!(user_key = %key, "previous debounce timer cancelled");
        }

        tracing::info!(
            user_key = %key,
            burst_len,
            message_id = %captured_id,
            "message enqueued"
        );
        EnqueueReceipt {
            burst_len,
            last_message_id: captured_id,
        }
    }

    /// Timer callback. Drains the burst and submits it downstream exactly
    /// once, or aborts as a no-op when this callback has been superseded by
    /// a later enqueue for the same key.
    pub async fn fire(&self, key: &UserKey, captured_last_fragment_id: &MessageId) {
        // This callback is done regardless of outcome, so reap its handle
        // first. Keyed on the captured id: a stale callback must not remove
        // the newer timer that superseded it.
        self.timers
            .remove_if(key, |_, handle| handle.captured_id == *captured_last_fragment_id);

        // Passive TTL expiry: an orphaned burst is dropped, not processed.
        if let Some((_, stale)) = self
            .bursts
            .remove_if(key, |_, burst| burst.is_expired(Instant::now()))
        {
            tracing::warn!(
                user_key = %key,
                fragment_count = stale.fragments.len(),
                "burst TTL expired before processing; dropping"
            );
            return;
        }

        // Atomic read-and-delete, gated on the staleness check: only the
        // callback scheduled by the current tail fragment may drain.
        let Some((_, burst)) = self
            .bursts
            .remove_if(key, |_, burst| burst.tail_matches(captured_last_fragment_id))
        else {
            if self.bursts.contains_key(key) {
                tracing::debug!(
                    user_key = %key,
                    trigger = %captured_last_fragment_id,
                    "stale debounce callback; a newer fire is responsible"
                );
            } else {
                // Accepted race: drained by a concurrent fire or never
                // buffered (e.g. restart). Not an error.
                tracing::warn!(user_key = %key, "buffer empty or expired");
            }
            return;
        };

        if burst.fragments.is_empty() {
            return;
        }

        let consolidated = ConsolidatedBurst {
            user_key: key.clone(),
            transport_address: burst.transport_address.clone(),
            display_name: burst.display_name.clone(),
            content: burst.consolidate(),
            trigger_message_id: captured_last_fragment_id.clone(),
            fragment_count: burst.fragments.len(),
            received_at: burst.started_at,
        };
        tracing::info!(
            user_key = %key,
            fragment_count = consolidated.fragment_count,
            last_arrival_index = burst.fragments.last().map_or(0, |f| f.arrival_index),
            "burst drained; submitting consolidated message"
        );
        self.sink.submit(consolidated).await;
    }

    /// Current burst length for a key, for observability.
    pub fn burst_len(&self, key: &UserKey) -> usize {
        self.bursts.get(key).map(|b| b.fragments.len()).unwrap_or(0)
    }

    /// Number of live debounce timer handles across all keys.
    pub fn pending_timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Aborts all pending debounce timers. Buffered bursts are left behind
    /// and reaped through TTL expiry, matching the crash-recovery path.
    pub fn shutdown(&self) {
        let mut aborted = 0_usize;
        self.timers.retain(|_, handle| {
            handle.task.abort();
            aborted += 1;
            false
        });
        if aborted > 0 {
            tracing::info!(aborted, "debounce timers aborted during shutdown");
        }
    }
}
