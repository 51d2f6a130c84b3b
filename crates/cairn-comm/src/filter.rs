//! Message filters — declarative predicates over incoming messages.
//!
//! A filter pairs a predicate (type, source, field equalities, deadline)
//! with a delivery sink: either a waiter that a task blocks on, or an async
//! callback the bus invokes. Alternatives chain through `or`, so one
//! registration can claim any of several message shapes.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

use cairn_core::{short_id, Message, MessageError, MessageType, PeerId, Value};

use crate::peer::PeerLink;

/// Async delivery sink for a registered filter.
///
/// Invoked by the bus with no internal locks held. Implementations must be
/// short; anything long-running belongs on its own task.
pub trait FilterCallback: Send + Sync {
    /// A message matched. The filter's matched flag has already been
    /// cleared, so re-registering from here is safe.
    fn on_matched(&self, msg: Message);

    /// The filter's deadline passed, `should_timeout` asked for eviction,
    /// or the registrant cancelled the filter.
    fn on_timeout(&self) {}

    /// The source peer disconnected while the filter was registered.
    fn on_disconnect(&self, _peer: PeerId) {}

    /// The source peer restarted while the filter was registered.
    fn on_restarted(&self, _peer: PeerId) {}

    /// Polled by the expiry sweep; returning true evicts the filter even
    /// before its deadline.
    fn should_timeout(&self) -> bool {
        false
    }
}

enum FilterSink {
    /// A task will block on the filter; woken through the Notify.
    Waiter(Notify),
    /// The bus delivers through the callback; blocking waits are rejected.
    Callback(Arc<dyn FilterCallback>),
}

struct FilterState {
    /// None = no deadline.
    deadline: Option<Instant>,
    matched: bool,
    message: Option<Message>,
    dropped_connection: Option<PeerId>,
}

/// How the deadline was configured, so it can be re-based when waiting
/// actually starts.
#[derive(Clone, Copy, PartialEq)]
enum TimeoutMode {
    Unset,
    None,
    After(Duration),
}

pub struct MessageFilter {
    mtype: Option<&'static MessageType>,
    source: Option<Arc<dyn PeerLink>>,
    old_boot_id: u64,
    fields: Vec<(&'static str, Value)>,
    timeout: TimeoutMode,
    /// True (the default): the deadline counts from the start of waiting.
    /// False: it counts from the `set_timeout` call.
    timeout_from_wait: bool,
    or: Option<Arc<MessageFilter>>,
    sink: FilterSink,
    state: Mutex<FilterState>,
}

impl std::fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFilter")
            .field("mtype", &self.mtype)
            .field("old_boot_id", &self.old_boot_id)
            .field("timeout_from_wait", &self.timeout_from_wait)
            .finish()
    }
}

impl MessageFilter {
    pub fn new() -> Self {
        Self {
            mtype: None,
            source: None,
            old_boot_id: 0,
            fields: Vec::new(),
            timeout: TimeoutMode::Unset,
            timeout_from_wait: true,
            or: None,
            sink: FilterSink::Waiter(Notify::new()),
            state: Mutex::new(FilterState {
                deadline: None,
                matched: false,
                message: None,
                dropped_connection: None,
            }),
        }
    }

    // ── Builder ──────────────────────────────────────────────────────────────

    pub fn set_type(mut self, mtype: &'static MessageType) -> Self {
        self.mtype = Some(mtype);
        self
    }

    /// Require the message to originate from `peer`. Snapshots the peer's
    /// current boot id so a restart is detected as a drop.
    pub fn set_source(mut self, peer: Arc<dyn PeerLink>) -> Self {
        self.old_boot_id = peer.boot_id();
        self.source = Some(peer);
        self
    }

    /// Add an equality constraint. Requires `set_type` first; the value is
    /// checked against the schema and a mismatch fails with
    /// `IncorrectType`. Setting a field twice overwrites the expected value
    /// in place.
    pub fn set_field(
        mut self,
        field: &str,
        value: impl Into<Value>,
    ) -> Result<Self, MessageError> {
        let value = value.into();
        let Some(mtype) = self.mtype else {
            return Err(MessageError::UnknownField {
                mtype: "<untyped filter>",
                field: field.to_string(),
            });
        };
        let name = mtype.check(field, &value)?;
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        Ok(self)
    }

    /// Expire after `timeout`. Where two registered filters match the same
    /// message, the one with the nearer deadline gets priority.
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        if self.timeout != TimeoutMode::Unset {
            tracing::error!(filter = %self, "timeout set twice on filter");
        }
        self.timeout = TimeoutMode::After(timeout);
        self.state.get_mut().expect("filter lock poisoned").deadline =
            Some(Instant::now() + timeout);
        self
    }

    /// Never expire. Only sensible together with a callback whose
    /// `should_timeout` eventually releases the filter.
    pub fn set_no_timeout(mut self) -> Self {
        if self.timeout != TimeoutMode::Unset {
            tracing::error!(filter = %self, "timeout set twice on filter");
        }
        self.timeout = TimeoutMode::None;
        self.state.get_mut().expect("filter lock poisoned").deadline = None;
        self
    }

    /// If true, the deadline counts from the `set_timeout` call instead of
    /// being re-based when waiting starts.
    pub fn set_timeout_relative_to_creation(mut self, relative: bool) -> Self {
        self.timeout_from_wait = !relative;
        self
    }

    /// Attach an alternative. Replacing an existing alternative is almost
    /// certainly a bug in the caller; it is logged and overridden.
    pub fn or(mut self, other: MessageFilter) -> Self {
        if self.or.is_some() {
            tracing::error!(filter = %self, "replacing the alternative of a filter chain");
        }
        self.or = Some(Arc::new(other));
        self
    }

    /// Deliver through `cb` instead of waking a waiter. A filter with a
    /// callback cannot be used in a blocking wait.
    pub fn set_callback(mut self, cb: Arc<dyn FilterCallback>) -> Self {
        self.sink = FilterSink::Callback(cb);
        self
    }

    // ── Predicate ────────────────────────────────────────────────────────────

    /// Does `msg` satisfy this filter (or any alternative) at `now`?
    pub fn matches(&self, msg: &Message, now: Instant) -> bool {
        if let Some(or) = &self.or {
            if or.matches(msg, now) {
                return true;
            }
        }
        if let Some(mtype) = self.mtype {
            if !msg.is(mtype) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if msg.source() != Some(source.peer_id()) {
                return false;
            }
        }
        for (name, want) in &self.fields {
            match msg.get(name) {
                Some(got) if got == want => {}
                _ => return false,
            }
        }
        !self.deadline_passed(now)
    }

    fn deadline_passed(&self, now: Instant) -> bool {
        let state = self.state.lock().expect("filter lock poisoned");
        state.deadline.is_some_and(|d| d <= now)
    }

    /// Expiry check used by the bus sweep: the deadline passed, or the
    /// callback asked to be released. A matched filter still sitting in
    /// the registry is a bookkeeping error; it is evicted.
    pub(crate) fn timed_out(&self, now: Instant) -> bool {
        if self.matched() {
            tracing::error!(filter = %self, "matched filter still registered at sweep");
            return true;
        }
        if let FilterSink::Callback(cb) = &self.sink {
            if cb.should_timeout() {
                return true;
            }
        }
        self.deadline_passed(now)
    }

    /// True if the source of this filter or of any alternative has
    /// disconnected or restarted, unless the filter already matched.
    pub fn any_connections_dropped(&self) -> bool {
        if self.matched() {
            return false;
        }
        if let Some(source) = &self.source {
            if !source.is_connected() || source.boot_id() != self.old_boot_id {
                return true;
            }
        }
        self.or
            .as_ref()
            .is_some_and(|or| or.any_connections_dropped())
    }

    /// Is `peer` the source of this filter or of any alternative?
    pub fn matches_dropped_connection(&self, peer: PeerId) -> bool {
        if self.source.as_ref().is_some_and(|s| s.peer_id() == peer) {
            return true;
        }
        self.or
            .as_ref()
            .is_some_and(|or| or.matches_dropped_connection(peer))
    }

    // ── State ────────────────────────────────────────────────────────────────

    pub fn matched(&self) -> bool {
        self.state.lock().expect("filter lock poisoned").matched
    }

    pub fn message(&self) -> Option<Message> {
        self.state
            .lock()
            .expect("filter lock poisoned")
            .message
            .clone()
    }

    /// The matched message, only while the matched flag is set.
    pub(crate) fn matched_message(&self) -> Option<Message> {
        let state = self.state.lock().expect("filter lock poisoned");
        if state.matched {
            state.message.clone()
        } else {
            None
        }
    }

    /// Which connection dropped or restarted, if any.
    pub fn dropped_connection(&self) -> Option<PeerId> {
        self.state
            .lock()
            .expect("filter lock poisoned")
            .dropped_connection
    }

    /// Re-arm after a match so the filter can be registered again. Clears
    /// every alternative in the chain.
    pub fn clear_matched(&self) {
        {
            let mut state = self.state.lock().expect("filter lock poisoned");
            state.matched = false;
            state.message = None;
        }
        if let Some(or) = &self.or {
            or.clear_matched();
        }
    }

    /// The configured timeout span, if a finite one was chosen.
    pub fn initial_timeout(&self) -> Option<Duration> {
        match self.timeout {
            TimeoutMode::After(timeout) => Some(timeout),
            _ => None,
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.state.lock().expect("filter lock poisoned").deadline
    }

    pub(crate) fn has_callback(&self) -> bool {
        matches!(self.sink, FilterSink::Callback(_))
    }

    /// Sources along the chain, or None if any link is source-agnostic.
    pub(crate) fn chain_sources(&self) -> Option<Vec<PeerId>> {
        let mut sources = Vec::new();
        let mut cursor = Some(self);
        while let Some(filter) = cursor {
            match &filter.source {
                Some(peer) => {
                    let id = peer.peer_id();
                    if !sources.contains(&id) {
                        sources.push(id);
                    }
                }
                None => return None,
            }
            cursor = filter.or.as_deref();
        }
        Some(sources)
    }

    /// Called once when the filter is registered (or a blocking wait
    /// starts): re-bases relative deadlines and flags filters that never
    /// chose a timeout mode.
    pub(crate) fn start_waiting(&self) {
        if self.timeout == TimeoutMode::Unset {
            tracing::error!(filter = %self, "filter registered without a timeout mode");
        }
        if let (true, TimeoutMode::After(timeout)) = (self.timeout_from_wait, self.timeout) {
            self.state.lock().expect("filter lock poisoned").deadline =
                Some(Instant::now() + timeout);
        }
        if let Some(or) = &self.or {
            or.start_waiting();
        }
    }

    // ── Delivery (bus-side) ──────────────────────────────────────────────────

    pub(crate) fn notified(&self) -> Notified<'_> {
        match &self.sink {
            FilterSink::Waiter(notify) => notify.notified(),
            // wait_for rejects callback filters before ever waiting
            FilterSink::Callback(_) => unreachable!("blocking wait on a callback filter"),
        }
    }

    fn wake(&self) {
        if let FilterSink::Waiter(notify) = &self.sink {
            notify.notify_waiters();
        }
    }

    /// Record the match and wake any waiter.
    pub(crate) fn set_message(&self, msg: Message) {
        {
            let mut state = self.state.lock().expect("filter lock poisoned");
            state.message = Some(msg);
            state.matched = true;
        }
        self.wake();
    }

    /// Deliver a match through the callback sink. The matched flag is
    /// cleared first so the callback can re-register the filter.
    pub(crate) fn deliver_matched(&self) {
        let FilterSink::Callback(cb) = &self.sink else {
            return;
        };
        let msg = {
            let state = self.state.lock().expect("filter lock poisoned");
            state.message.clone()
        };
        self.clear_matched();
        if let Some(msg) = msg {
            cb.on_matched(msg);
        }
    }

    pub(crate) fn deliver_timeout(&self) {
        self.wake();
        if let FilterSink::Callback(cb) = &self.sink {
            cb.on_timeout();
        }
    }

    pub(crate) fn deliver_disconnect(&self, peer: PeerId) {
        {
            let mut state = self.state.lock().expect("filter lock poisoned");
            state.dropped_connection = Some(peer);
        }
        self.wake();
        if let FilterSink::Callback(cb) = &self.sink {
            cb.on_disconnect(peer);
        }
    }

    pub(crate) fn deliver_restart(&self, peer: PeerId) {
        {
            let mut state = self.state.lock().expect("filter lock poisoned");
            state.dropped_connection = Some(peer);
        }
        self.wake();
        if let FilterSink::Callback(cb) = &self.sink {
            cb.on_restarted(peer);
        }
    }
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "filter(type={}, source={})",
            self.mtype.map(|t| t.name()).unwrap_or("*"),
            self.source
                .as_ref()
                .map(|s| short_id(&s.peer_id()))
                .unwrap_or_else(|| "*".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::Instant;

    use cairn_core::{Message, MessageError, MessageType, PeerId, ScalarType};

    use super::MessageFilter;
    use crate::peer::{PacketCallback, PeerLink, SendError};
    use crate::throttle::ByteCounter;

    static TYPE_X: MessageType = MessageType::new("type_x", &[("uid", ScalarType::I64)]);
    static TYPE_Y: MessageType = MessageType::new("type_y", &[]);

    /// A link stub with controllable boot id; sends are not exercised here.
    struct StubLink {
        id: PeerId,
        boot: AtomicU64,
    }

    impl StubLink {
        fn new(id_byte: u8) -> Arc<Self> {
            Arc::new(Self {
                id: [id_byte; 32],
                boot: AtomicU64::new(1),
            })
        }
    }

    #[async_trait::async_trait]
    impl PeerLink for StubLink {
        fn peer_id(&self) -> PeerId {
            self.id
        }

        fn boot_id(&self) -> u64 {
            self.boot.load(Ordering::SeqCst)
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn message_overhead(&self) -> usize {
            0
        }

        fn send_async(
            &self,
            _msg: Message,
            _callback: Option<Arc<dyn PacketCallback>>,
            _ctr: &dyn ByteCounter,
        ) -> Result<(), SendError> {
            Err(SendError::NotConnected)
        }

        async fn send_throttled(
            &self,
            _msg: Message,
            _size: usize,
            _ctr: &dyn ByteCounter,
            _limit: Duration,
            _tag: Arc<dyn PacketCallback>,
        ) -> Result<(), SendError> {
            Err(SendError::NotConnected)
        }
    }

    fn msg_x(uid: i64) -> Message {
        Message::new(&TYPE_X)
            .set("uid", uid)
            .unwrap()
            .received_from([1u8; 32], 1)
    }

    fn msg_y() -> Message {
        Message::new(&TYPE_Y).received_from([1u8; 32], 1)
    }

    #[tokio::test]
    async fn field_type_checked_against_schema() {
        let err = MessageFilter::new()
            .set_type(&TYPE_X)
            .set_field("uid", Bytes::from_static(b"no"))
            .unwrap_err();
        assert!(matches!(err, MessageError::IncorrectType { .. }));
    }

    #[tokio::test]
    async fn field_requires_a_type_first() {
        let err = MessageFilter::new().set_field("uid", 1i64).unwrap_err();
        assert!(matches!(err, MessageError::UnknownField { .. }));
    }

    #[tokio::test]
    async fn or_chain_matches_either_branch() {
        let filter = MessageFilter::new()
            .set_type(&TYPE_X)
            .set_field("uid", 7i64)
            .unwrap()
            .set_no_timeout()
            .or(MessageFilter::new().set_type(&TYPE_Y).set_no_timeout());

        let now = Instant::now();
        assert!(filter.matches(&msg_y(), now));
        assert!(filter.matches(&msg_x(7), now));
        assert!(!filter.matches(&msg_x(8), now));
    }

    #[tokio::test]
    async fn clear_matched_rearms_the_chain() {
        let filter = MessageFilter::new()
            .set_type(&TYPE_X)
            .set_field("uid", 7i64)
            .unwrap()
            .set_no_timeout()
            .or(MessageFilter::new().set_type(&TYPE_Y).set_no_timeout());

        filter.set_message(msg_y());
        assert!(filter.matched());
        assert!(filter.message().is_some());

        filter.clear_matched();
        assert!(!filter.matched());
        assert!(filter.message().is_none(), "matched and message move together");
        assert!(filter.matches(&msg_x(7), Instant::now()));
    }

    #[tokio::test]
    async fn overwriting_a_field_keeps_one_constraint() {
        let filter = MessageFilter::new()
            .set_type(&TYPE_X)
            .set_field("uid", 1i64)
            .unwrap()
            .set_field("uid", 2i64)
            .unwrap()
            .set_no_timeout();
        assert!(!filter.matches(&msg_x(1), Instant::now()));
        assert!(filter.matches(&msg_x(2), Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_filter_stops_matching() {
        let filter = MessageFilter::new()
            .set_type(&TYPE_X)
            .set_timeout(Duration::from_secs(1))
            .set_timeout_relative_to_creation(true);
        assert!(filter.matches(&msg_x(0), Instant::now()));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!filter.matches(&msg_x(0), Instant::now()));
    }

    #[tokio::test]
    async fn boot_id_change_counts_as_a_drop() {
        let link = StubLink::new(1);
        let filter = MessageFilter::new()
            .set_type(&TYPE_X)
            .set_source(link.clone())
            .set_no_timeout();
        assert!(!filter.any_connections_dropped());

        link.boot.fetch_add(1, Ordering::SeqCst);
        assert!(filter.any_connections_dropped());

        // ...unless the filter already matched
        filter.set_message(msg_x(0));
        assert!(!filter.any_connections_dropped());
    }

    #[tokio::test]
    async fn drop_check_recurses_into_alternatives() {
        let link_a = StubLink::new(1);
        let link_b = StubLink::new(2);
        let filter = MessageFilter::new()
            .set_type(&TYPE_X)
            .set_source(link_a)
            .set_no_timeout()
            .or(MessageFilter::new()
                .set_type(&TYPE_Y)
                .set_source(link_b.clone())
                .set_no_timeout());

        assert!(!filter.any_connections_dropped());
        link_b.boot.fetch_add(1, Ordering::SeqCst);
        assert!(filter.any_connections_dropped());
        assert!(filter.matches_dropped_connection([2u8; 32]));
        assert!(!filter.matches_dropped_connection([3u8; 32]));
    }

    #[tokio::test]
    async fn chain_sources_collects_distinct_peers() {
        let link_a = StubLink::new(1);
        let link_b = StubLink::new(2);
        let chained = MessageFilter::new()
            .set_source(link_a.clone())
            .set_no_timeout()
            .or(MessageFilter::new().set_source(link_b).set_no_timeout());
        assert_eq!(
            chained.chain_sources(),
            Some(vec![[1u8; 32], [2u8; 32]])
        );

        let open = MessageFilter::new()
            .set_source(link_a)
            .set_no_timeout()
            .or(MessageFilter::new().set_type(&TYPE_Y).set_no_timeout());
        assert_eq!(open.chain_sources(), None, "a source-agnostic link makes the chain global");
    }
}
