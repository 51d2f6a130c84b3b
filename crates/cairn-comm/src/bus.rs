//! Message bus — registers filters and demultiplexes incoming messages.
//!
//! Filters are indexed by their source peer (source-agnostic chains go to a
//! global list). Each incoming message is claimed by at most one filter:
//! the matching candidate with the nearest deadline, ties broken by
//! registration order. A message nothing claims sits in a bounded backlog
//! for a while, so a handler that re-registers its filter between packets
//! cannot drop one in the gap — registration checks the backlog first.
//!
//! A periodic sweep evicts expired filters; disconnect and restart
//! notifications release the filters bound to that peer. Matching under the
//! registry lock touches only filter predicates and per-filter leaf state;
//! sinks (callbacks and waiter wakeups) always run with no bus lock held.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use cairn_core::{short_id, Message, PeerId};

use crate::filter::MessageFilter;

/// Most unclaimed messages kept around for late filters.
const BACKLOG_CAP: usize = 1024;

/// How long an unclaimed message stays claimable.
const BACKLOG_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// A source of the filter chain is already disconnected or restarted.
    #[error("peer disconnected")]
    Disconnected,

    /// Async registration requires a callback sink.
    #[error("filter has no callback")]
    NoCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for a matching message")]
    Timeout,

    /// A source of the chain dropped or restarted; the filter's
    /// `dropped_connection` names the peer.
    #[error("peer disconnected while waiting")]
    Disconnected,

    /// Blocking waits are not allowed on callback filters.
    #[error("filter delivers through a callback")]
    CallbackFilter,
}

struct Entry {
    seq: u64,
    filter: Arc<MessageFilter>,
}

struct Backlogged {
    arrived: Instant,
    msg: Message,
}

#[derive(Default)]
struct BusInner {
    /// Filters whose whole chain names a source, indexed per peer. A chain
    /// spanning several peers has an entry in each list.
    by_source: HashMap<PeerId, Vec<Entry>>,
    /// Chains with at least one source-agnostic link.
    global: Vec<Entry>,
    /// Recent messages no filter claimed, oldest first.
    backlog: VecDeque<Backlogged>,
    next_seq: u64,
}

impl BusInner {
    fn insert(&mut self, filter: &Arc<MessageFilter>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        match filter.chain_sources() {
            Some(sources) => {
                for source in sources {
                    self.by_source.entry(source).or_default().push(Entry {
                        seq,
                        filter: filter.clone(),
                    });
                }
            }
            None => self.global.push(Entry {
                seq,
                filter: filter.clone(),
            }),
        }
    }

    fn remove(&mut self, filter: &Arc<MessageFilter>) -> bool {
        let mut removed = false;
        let before = self.global.len();
        self.global.retain(|e| !Arc::ptr_eq(&e.filter, filter));
        removed |= self.global.len() != before;
        if let Some(sources) = filter.chain_sources() {
            for source in sources {
                if let Some(entries) = self.by_source.get_mut(&source) {
                    let before = entries.len();
                    entries.retain(|e| !Arc::ptr_eq(&e.filter, filter));
                    removed |= entries.len() != before;
                    if entries.is_empty() {
                        self.by_source.remove(&source);
                    }
                }
            }
        }
        removed
    }

    /// The matching candidate with the nearest deadline; registration
    /// order breaks ties (candidates arrive sorted by seq).
    fn find_winner(&self, msg: &Message, now: Instant) -> Option<Arc<MessageFilter>> {
        let mut candidates: Vec<(u64, &Arc<MessageFilter>)> = self
            .global
            .iter()
            .map(|e| (e.seq, &e.filter))
            .collect();
        if let Some(source) = msg.source() {
            if let Some(entries) = self.by_source.get(&source) {
                candidates.extend(entries.iter().map(|e| (e.seq, &e.filter)));
            }
        }
        candidates.sort_by_key(|(seq, _)| *seq);

        let mut winner: Option<(Option<Instant>, Arc<MessageFilter>)> = None;
        for (_, filter) in candidates {
            if !filter.matches(msg, now) {
                continue;
            }
            let deadline = filter.deadline();
            let closer = match &winner {
                None => true,
                Some((best, _)) => match (deadline, best) {
                    (Some(d), Some(b)) => d < *b,
                    (Some(_), None) => true,
                    _ => false,
                },
            };
            if closer {
                winner = Some((deadline, filter.clone()));
            }
        }
        winner.map(|(_, filter)| filter)
    }

    fn prune_backlog(&mut self, now: Instant) {
        while self.backlog.len() >= BACKLOG_CAP {
            self.backlog.pop_front();
        }
        while self
            .backlog
            .front()
            .is_some_and(|b| now.duration_since(b.arrived) > BACKLOG_TTL)
        {
            self.backlog.pop_front();
        }
    }

    /// Claim the oldest backlogged message the filter matches.
    fn claim_backlog(&mut self, filter: &MessageFilter, now: Instant) -> Option<Message> {
        let idx = self
            .backlog
            .iter()
            .position(|b| filter.matches(&b.msg, now))?;
        self.backlog.remove(idx).map(|b| b.msg)
    }
}

pub struct MessageBus {
    inner: Mutex<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().expect("bus lock poisoned")
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a callback filter. A backlogged message that already
    /// matches is delivered straight away instead. Fails if any source in
    /// the chain is already gone; nothing is registered in that case.
    pub fn add_async_filter(&self, filter: Arc<MessageFilter>) -> Result<(), RegisterError> {
        if !filter.has_callback() {
            tracing::error!(filter = %filter, "async registration without a callback");
            return Err(RegisterError::NoCallback);
        }
        filter.start_waiting();
        if filter.any_connections_dropped() {
            return Err(RegisterError::Disconnected);
        }
        let claimed = {
            let mut inner = self.lock();
            let now = Instant::now();
            match inner.claim_backlog(&filter, now) {
                Some(msg) => Some(msg),
                None => {
                    inner.insert(&filter);
                    None
                }
            }
        };
        if let Some(msg) = claimed {
            filter.set_message(msg);
            filter.deliver_matched();
        }
        Ok(())
    }

    /// Remove every entry of `filter`. Returns false if the filter was not
    /// registered (for instance because a delivery just claimed it).
    pub fn unregister(&self, filter: &Arc<MessageFilter>) -> bool {
        self.lock().remove(filter)
    }

    /// Cancel a registered filter on behalf of its owner. The filter is
    /// released with a timeout disposition.
    pub fn cancel_filter(&self, filter: &Arc<MessageFilter>) {
        if self.unregister(filter) {
            filter.deliver_timeout();
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Match one incoming message against the registered filters. Returns
    /// true if a filter claimed it; otherwise the message is backlogged
    /// for a late registration to pick up.
    pub fn dispatch(&self, msg: Message) -> bool {
        let now = Instant::now();
        let filter = {
            let mut inner = self.lock();
            match inner.find_winner(&msg, now) {
                Some(filter) => {
                    inner.remove(&filter);
                    filter
                }
                None => {
                    tracing::trace!(message = %msg, "message unclaimed, backlogged");
                    inner.prune_backlog(now);
                    inner.backlog.push_back(Backlogged { arrived: now, msg });
                    return false;
                }
            }
        };
        filter.set_message(msg);
        filter.deliver_matched();
        true
    }

    // ── Expiry ───────────────────────────────────────────────────────────────

    /// Evict filters past their deadline (or whose callback asks to be
    /// released) and deliver their timeout; drop stale backlog entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        // Expiry checks run filter callbacks (`should_timeout`), so take a
        // snapshot first and evaluate with no bus lock held.
        for filter in self.snapshot() {
            if filter.timed_out(now) && self.unregister(&filter) {
                tracing::trace!(filter = %filter, "filter expired");
                filter.deliver_timeout();
            }
        }
        self.lock().prune_backlog(now);
    }

    /// Every registered filter, deduplicated, in no particular order.
    fn snapshot(&self) -> Vec<Arc<MessageFilter>> {
        let inner = self.lock();
        let mut filters: Vec<Arc<MessageFilter>> =
            inner.global.iter().map(|e| e.filter.clone()).collect();
        for entries in inner.by_source.values() {
            for entry in entries {
                if !filters.iter().any(|f| Arc::ptr_eq(f, &entry.filter)) {
                    filters.push(entry.filter.clone());
                }
            }
        }
        filters
    }

    // ── Connection events ────────────────────────────────────────────────────

    /// Release every filter bound to `peer` with a disconnect disposition.
    pub fn peer_disconnected(&self, peer: PeerId) {
        self.drop_peer_filters(peer, false);
    }

    /// Release every filter bound to `peer` with a restart disposition.
    pub fn peer_restarted(&self, peer: PeerId) {
        self.drop_peer_filters(peer, true);
    }

    fn drop_peer_filters(&self, peer: PeerId, restarted: bool) {
        let affected: Vec<Arc<MessageFilter>> = self
            .snapshot()
            .into_iter()
            .filter(|f| f.matches_dropped_connection(peer))
            .collect();
        tracing::debug!(
            peer = short_id(&peer),
            restarted,
            filters = affected.len(),
            "releasing filters for dropped connection"
        );
        for filter in affected {
            if self.unregister(&filter) {
                if restarted {
                    filter.deliver_restart(peer);
                } else {
                    filter.deliver_disconnect(peer);
                }
            }
        }
    }

    // ── Waiting ──────────────────────────────────────────────────────────────

    /// Register `filter` and block until a message matches, a source
    /// drops, or the deadline passes. The filter must use the waiter sink.
    pub async fn wait_for(&self, filter: Arc<MessageFilter>) -> Result<Message, WaitError> {
        if filter.has_callback() {
            tracing::error!(filter = %filter, "blocking wait on a callback filter");
            return Err(WaitError::CallbackFilter);
        }
        filter.start_waiting();
        if filter.any_connections_dropped() {
            return Err(WaitError::Disconnected);
        }
        {
            let mut inner = self.lock();
            let now = Instant::now();
            if let Some(msg) = inner.claim_backlog(&filter, now) {
                drop(inner);
                filter.set_message(msg.clone());
                return Ok(msg);
            }
            inner.insert(&filter);
        }

        loop {
            let notified = filter.notified();
            if let Some(msg) = filter.matched_message() {
                return Ok(msg);
            }
            if filter.dropped_connection().is_some() {
                return Err(WaitError::Disconnected);
            }
            match filter.deadline() {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        if let Some(msg) = filter.matched_message() {
                            return Ok(msg);
                        }
                        if filter.dropped_connection().is_some() {
                            return Err(WaitError::Disconnected);
                        }
                        if !self.unregister(&filter) {
                            // Claimed by a concurrent delivery; give it one
                            // more beat to land.
                            let _ = tokio::time::timeout(
                                Duration::from_millis(50),
                                filter.notified(),
                            )
                            .await;
                            if let Some(msg) = filter.matched_message() {
                                return Ok(msg);
                            }
                            if filter.dropped_connection().is_some() {
                                return Err(WaitError::Disconnected);
                            }
                        }
                        return Err(WaitError::Timeout);
                    }
                }
            }
        }
    }

    // ── Receive loop ─────────────────────────────────────────────────────────

    /// Drive the bus from an inbound channel: dispatch each message and run
    /// the expiry sweep on a timer until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Message>,
        mut shutdown: broadcast::Receiver<()>,
        sweep_every: Duration,
    ) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(sweep_every);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("message bus shutting down");
                    return Ok(());
                }

                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        tracing::info!("inbound channel closed, bus exiting");
                        return Ok(());
                    };
                    self.dispatch(msg);
                }

                _ = tick.tick() => self.sweep(),
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
