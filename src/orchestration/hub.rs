use crate::config::HubSettings;
use crate::orchestration::events::{EventBody, RunEvent};
use crate::runtime::worker_primitives::sleep_with_stop;
use crate::shared::clock::{Clock, SystemClock};
use crate::shared::logging::Logger;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub queue_capacity: usize,
    pub keepalive_interval: Duration,
    pub read_idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&HubSettings::default())
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity.max(1),
            keepalive_interval: settings.keepalive_interval(),
            read_idle_timeout: settings.read_idle_timeout(),
            sweep_interval: settings.sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Overflow,
    Idle,
    Unregistered,
    Disconnected,
    HubClosed,
}

impl EvictionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overflow => "overflow",
            Self::Idle => "idle",
            Self::Unregistered => "unregistered",
            Self::Disconnected => "disconnected",
            Self::HubClosed => "hub_closed",
        }
    }
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("event kind `{kind}` is reserved for the hub")]
    ReservedKind { kind: &'static str },
    #[error("event hub is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("no event within the timeout")]
    Timeout,
    #[error("subscription closed: {0}")]
    Closed(EvictionReason),
}

/// Which run events a subscriber wants. Hub-originated messages are always
/// delivered regardless of the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub all: bool,
    pub runs: BTreeSet<String>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self {
            all: true,
            runs: BTreeSet::new(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn runs<I, S>(runs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all: false,
            runs: runs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, event: &RunEvent) -> bool {
        if self.all {
            return true;
        }
        event
            .run_id
            .as_ref()
            .is_some_and(|run_id| self.runs.contains(run_id))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub evicted: usize,
}

struct SubscriberState {
    filter: Mutex<SubscriptionFilter>,
    last_read_ms: AtomicI64,
    closed: Mutex<Option<EvictionReason>>,
}

impl SubscriberState {
    fn filter(&self) -> std::sync::MutexGuard<'_, SubscriptionFilter> {
        self.filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_reason(&self) -> Option<EvictionReason> {
        *self
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn close(&self, reason: EvictionReason) {
        let mut closed = self
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if closed.is_none() {
            *closed = Some(reason);
        }
    }
}

struct SubscriberEntry {
    id: u64,
    sender: SyncSender<Arc<RunEvent>>,
    last_sent_ms: AtomicI64,
    state: Arc<SubscriberState>,
}

enum Delivery {
    Sent,
    Evict(EvictionReason),
}

impl SubscriberEntry {
    fn deliver(&self, event: Arc<RunEvent>, now: i64) -> Delivery {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.last_sent_ms.store(now, Ordering::Relaxed);
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => Delivery::Evict(EvictionReason::Overflow),
            Err(TrySendError::Disconnected(_)) => Delivery::Evict(EvictionReason::Disconnected),
        }
    }
}

struct HubInner {
    config: HubConfig,
    clock: Arc<dyn Clock>,
    logger: Logger,
    subscribers: RwLock<HashMap<u64, Arc<SubscriberEntry>>>,
    next_subscriber_id: AtomicU64,
    hub_sequence: AtomicU64,
    closed: AtomicBool,
}

/// Fan-out of run events to registered subscribers.
///
/// `publish` snapshots matching subscribers under the read lock and delivers
/// with `try_send` outside it. A full queue evicts that subscriber; nothing
/// ever blocks the publisher.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("config", &self.inner.config)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Logger::disabled())
    }

    pub fn with_parts(config: HubConfig, clock: Arc<dyn Clock>, logger: Logger) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                clock,
                logger,
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                hub_sequence: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> HubConfig {
        self.inner.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    pub fn subscriber_count(&self) -> usize {
        self.read_subscribers().len()
    }

    pub fn is_registered(&self, subscriber_id: u64) -> bool {
        self.read_subscribers().contains_key(&subscriber_id)
    }

    /// Registers a subscriber and queues its welcome message.
    pub fn register(&self, filter: SubscriptionFilter) -> Result<Subscription, HubError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let now = self.inner.clock.now_millis();
        let (sender, receiver) = mpsc::sync_channel(self.inner.config.queue_capacity.max(1));
        let state = Arc::new(SubscriberState {
            filter: Mutex::new(filter),
            last_read_ms: AtomicI64::new(now),
            closed: Mutex::new(None),
        });
        let entry = Arc::new(SubscriberEntry {
            id,
            sender,
            last_sent_ms: AtomicI64::new(now),
            state: Arc::clone(&state),
        });
        self.write_subscribers().insert(id, Arc::clone(&entry));

        let welcome = self.hub_event(EventBody::Connected {
            server_time: now,
            subscriber_id: id,
        });
        if let Delivery::Evict(reason) = entry.deliver(welcome, now) {
            self.evict(id, reason);
        }
        self.inner
            .logger
            .debug("hub.subscriber.registered", format!("subscriber={id}"));

        Ok(Subscription {
            id,
            receiver,
            state,
            hub: self.clone(),
        })
    }

    /// Removes a subscriber. Messages still queued for it are dropped.
    pub fn unregister(&self, subscriber_id: u64) -> bool {
        self.remove(subscriber_id, EvictionReason::Unregistered)
    }

    pub fn publish(&self, event: RunEvent) -> Result<PublishOutcome, HubError> {
        let kind = event.kind();
        if kind.is_hub_originated() {
            return Err(HubError::ReservedKind {
                kind: kind.as_str(),
            });
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        let targets = self
            .read_subscribers()
            .values()
            .filter(|entry| entry.state.filter().matches(&event))
            .cloned()
            .collect::<Vec<_>>();

        let event = Arc::new(event);
        let now = self.inner.clock.now_millis();
        let mut outcome = PublishOutcome::default();
        for entry in targets {
            match entry.deliver(Arc::clone(&event), now) {
                Delivery::Sent => outcome.delivered += 1,
                Delivery::Evict(reason) => {
                    if self.evict(entry.id, reason) {
                        outcome.evicted += 1;
                    }
                }
            }
        }
        Ok(outcome)
    }

    pub fn update_filter(&self, subscriber_id: u64, update: impl FnOnce(&mut SubscriptionFilter)) {
        let entry = self.read_subscribers().get(&subscriber_id).cloned();
        if let Some(entry) = entry {
            update(&mut entry.state.filter());
        }
    }

    /// Answers a client ping with a pong carrying the server time.
    pub fn reply_pong(&self, subscriber_id: u64) -> bool {
        let Some(entry) = self.read_subscribers().get(&subscriber_id).cloned() else {
            return false;
        };
        let now = self.inner.clock.now_millis();
        let pong = self.hub_event(EventBody::Pong { server_time: now });
        match entry.deliver(pong, now) {
            Delivery::Sent => true,
            Delivery::Evict(reason) => {
                self.evict(subscriber_id, reason);
                false
            }
        }
    }

    /// Records read-side activity for a subscriber.
    pub fn touch(&self, subscriber_id: u64) {
        if let Some(entry) = self.read_subscribers().get(&subscriber_id) {
            entry
                .state
                .last_read_ms
                .store(self.inner.clock.now_millis(), Ordering::Relaxed);
        }
    }

    /// Keepalive pass: evicts subscribers idle past the read timeout and pings
    /// the ones that have not been sent anything for a keepalive interval.
    pub fn sweep(&self) -> SweepOutcome {
        let now = self.inner.clock.now_millis();
        let idle_ms = duration_millis(self.inner.config.read_idle_timeout);
        let keepalive_ms = duration_millis(self.inner.config.keepalive_interval);
        let snapshot = self.read_subscribers().values().cloned().collect::<Vec<_>>();

        let mut outcome = SweepOutcome::default();
        for entry in snapshot {
            let last_read = entry.state.last_read_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last_read) > idle_ms {
                if self.evict(entry.id, EvictionReason::Idle) {
                    outcome.evicted += 1;
                }
                continue;
            }
            let last_sent = entry.last_sent_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last_sent) < keepalive_ms {
                continue;
            }
            let ping = self.hub_event(EventBody::Ping { server_time: now });
            match entry.deliver(ping, now) {
                Delivery::Sent => outcome.pinged += 1,
                Delivery::Evict(reason) => {
                    if self.evict(entry.id, reason) {
                        outcome.evicted += 1;
                    }
                }
            }
        }
        outcome
    }

    /// Runs `sweep` every `sweep_interval` until `stop` is raised.
    pub fn spawn_maintenance(&self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        let hub = self.clone();
        let interval = self.inner.config.sweep_interval;
        thread::Builder::new()
            .name("runcast-hub-maintenance".to_string())
            .spawn(move || {
                while sleep_with_stop(&stop, interval) {
                    hub.sweep();
                }
            })
    }

    /// Closes every subscription and refuses further registrations.
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained = self.write_subscribers().drain().collect::<Vec<_>>();
        for (_, entry) in drained {
            entry.state.close(EvictionReason::HubClosed);
        }
    }

    fn hub_event(&self, body: EventBody) -> Arc<RunEvent> {
        Arc::new(RunEvent {
            run_id: None,
            sequence: self.inner.hub_sequence.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: self.inner.clock.now_millis(),
            body,
        })
    }

    fn evict(&self, subscriber_id: u64, reason: EvictionReason) -> bool {
        let removed = self.remove(subscriber_id, reason);
        if removed {
            self.inner.logger.warn(
                "hub.subscriber.evicted",
                format!("subscriber={subscriber_id} reason={reason}"),
            );
        }
        removed
    }

    fn remove(&self, subscriber_id: u64, reason: EvictionReason) -> bool {
        let removed = self.write_subscribers().remove(&subscriber_id);
        match removed {
            Some(entry) => {
                entry.state.close(reason);
                true
            }
            None => false,
        }
    }

    fn read_subscribers(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Arc<SubscriberEntry>>> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_subscribers(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Arc<SubscriberEntry>>> {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub pinged: usize,
    pub evicted: usize,
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Receiving end of a hub registration. Dropping it unregisters.
pub struct Subscription {
    id: u64,
    receiver: Receiver<Arc<RunEvent>>,
    state: Arc<SubscriberState>,
    hub: EventHub,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> SubscriptionFilter {
        self.state.filter().clone()
    }

    pub fn closed_reason(&self) -> Option<EvictionReason> {
        self.state.closed_reason()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Arc<RunEvent>, SubscriptionError> {
        self.mark_read()?;
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => {
                self.mark_read()?;
                Ok(event)
            }
            Err(RecvTimeoutError::Timeout) => Err(SubscriptionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(self.closed_error()),
        }
    }

    /// Non-blocking receive; `Ok(None)` when nothing is queued.
    pub fn try_recv(&self) -> Result<Option<Arc<RunEvent>>, SubscriptionError> {
        self.mark_read()?;
        self.try_recv_quiet()
    }

    /// Like `try_recv` but leaves the read-idle clock alone. Transports whose
    /// liveness comes from inbound client frames drain with this and report
    /// activity through `SubscriptionHandle::touch`.
    pub fn try_recv_quiet(&self) -> Result<Option<Arc<RunEvent>>, SubscriptionError> {
        if let Some(reason) = self.state.closed_reason() {
            return Err(SubscriptionError::Closed(reason));
        }
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.closed_error()),
        }
    }

    pub fn subscribe(&self, run_id: impl Into<String>) {
        self.state.filter().runs.insert(run_id.into());
    }

    pub fn unsubscribe(&self, run_id: &str) {
        self.state.filter().runs.remove(run_id);
    }

    pub fn subscribe_all(&self) {
        self.state.filter().all = true;
    }

    pub fn unsubscribe_all(&self) {
        let mut filter = self.state.filter();
        filter.all = false;
        filter.runs.clear();
    }

    /// Cloneable control handle for a connection's reader thread.
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            id: self.id,
            hub: self.hub.clone(),
        }
    }

    fn mark_read(&self) -> Result<(), SubscriptionError> {
        if let Some(reason) = self.state.closed_reason() {
            return Err(SubscriptionError::Closed(reason));
        }
        self.state
            .last_read_ms
            .store(self.hub.inner.clock.now_millis(), Ordering::Relaxed);
        Ok(())
    }

    fn closed_error(&self) -> SubscriptionError {
        SubscriptionError::Closed(
            self.state
                .closed_reason()
                .unwrap_or(EvictionReason::Disconnected),
        )
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[derive(Clone)]
pub struct SubscriptionHandle {
    id: u64,
    hub: EventHub,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_registered(&self) -> bool {
        self.hub.is_registered(self.id)
    }

    pub fn touch(&self) {
        self.hub.touch(self.id);
    }

    pub fn update_filter(&self, update: impl FnOnce(&mut SubscriptionFilter)) {
        self.hub.update_filter(self.id, update);
    }

    pub fn reply_pong(&self) -> bool {
        self.hub.reply_pong(self.id)
    }

    pub fn unregister(&self) -> bool {
        self.hub.unregister(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::run::RunStatus;
    use crate::shared::clock::ManualClock;

    fn status_event(run_id: &str, sequence: u64) -> RunEvent {
        RunEvent {
            run_id: Some(run_id.to_string()),
            sequence,
            timestamp: 0,
            body: EventBody::Status {
                status: RunStatus::Running,
                previous: None,
                reason: None,
            },
        }
    }

    fn small_hub(clock: Arc<ManualClock>, capacity: usize) -> EventHub {
        EventHub::with_parts(
            HubConfig {
                queue_capacity: capacity,
                keepalive_interval: Duration::from_secs(30),
                read_idle_timeout: Duration::from_secs(60),
                sweep_interval: Duration::from_millis(10),
            },
            clock,
            Logger::disabled(),
        )
    }

    #[test]
    fn welcome_is_the_first_message() {
        let hub = small_hub(Arc::new(ManualClock::new(42)), 4);
        let sub = hub.register(SubscriptionFilter::all()).expect("register");
        let welcome = sub.try_recv().expect("open").expect("welcome");
        assert_eq!(
            welcome.body,
            EventBody::Connected {
                server_time: 42,
                subscriber_id: sub.id()
            }
        );
        assert!(sub.try_recv().expect("open").is_none());
    }

    #[test]
    fn reserved_kinds_cannot_be_published() {
        let hub = small_hub(Arc::new(ManualClock::new(0)), 4);
        let err = hub
            .publish(RunEvent {
                run_id: None,
                sequence: 1,
                timestamp: 0,
                body: EventBody::Ping { server_time: 0 },
            })
            .expect_err("reserved");
        assert_eq!(err, HubError::ReservedKind { kind: "ping" });
    }

    #[test]
    fn run_filter_limits_delivery() {
        let hub = small_hub(Arc::new(ManualClock::new(0)), 8);
        let only_a = hub
            .register(SubscriptionFilter::runs(["run-a"]))
            .expect("register");
        let _ = only_a.try_recv();

        let outcome = hub.publish(status_event("run-b", 1)).expect("publish");
        assert_eq!(outcome.delivered, 0);
        hub.publish(status_event("run-a", 1)).expect("publish");
        let event = only_a.try_recv().expect("open").expect("event");
        assert_eq!(event.run_id.as_deref(), Some("run-a"));
    }

    #[test]
    fn full_queue_evicts_and_reports_overflow() {
        let hub = small_hub(Arc::new(ManualClock::new(0)), 2);
        let sub = hub.register(SubscriptionFilter::all()).expect("register");
        // welcome occupies one slot
        hub.publish(status_event("run-a", 1)).expect("publish");
        let outcome = hub.publish(status_event("run-a", 2)).expect("publish");
        assert_eq!(outcome.evicted, 1);
        assert!(!hub.is_registered(sub.id()));
        assert_eq!(
            sub.try_recv(),
            Err(SubscriptionError::Closed(EvictionReason::Overflow))
        );
    }

    #[test]
    fn sweep_pings_quiet_subscribers_and_evicts_idle_ones() {
        let clock = Arc::new(ManualClock::new(0));
        let hub = small_hub(Arc::clone(&clock), 8);
        let reader = hub.register(SubscriptionFilter::none()).expect("register");
        let stalled = hub.register(SubscriptionFilter::none()).expect("register");

        clock.advance_millis(31_000);
        let _ = reader.try_recv();
        assert_eq!(hub.sweep().pinged, 2);

        clock.advance_millis(31_000);
        let _ = reader.try_recv();
        let outcome = hub.sweep();
        assert_eq!(outcome.evicted, 1);
        assert_eq!(
            stalled.try_recv(),
            Err(SubscriptionError::Closed(EvictionReason::Idle))
        );
        assert!(hub.is_registered(reader.id()));
    }

    #[test]
    fn quiet_drain_does_not_count_as_read_activity() {
        let clock = Arc::new(ManualClock::new(0));
        let hub = small_hub(Arc::clone(&clock), 8);
        let drained = hub.register(SubscriptionFilter::none()).expect("register");
        let touched = hub.register(SubscriptionFilter::none()).expect("register");

        for _ in 0..4 {
            clock.advance_millis(20_000);
            let _ = drained.try_recv_quiet();
            let _ = touched.try_recv_quiet();
            touched.handle().touch();
        }
        let outcome = hub.sweep();
        assert_eq!(outcome.evicted, 1);
        assert_eq!(
            drained.try_recv_quiet(),
            Err(SubscriptionError::Closed(EvictionReason::Idle))
        );
        assert!(hub.is_registered(touched.id()));
    }

    #[test]
    fn dropping_a_subscription_unregisters_it() {
        let hub = small_hub(Arc::new(ManualClock::new(0)), 4);
        let sub = hub.register(SubscriptionFilter::all()).expect("register");
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn closed_hub_refuses_registration() {
        let hub = small_hub(Arc::new(ManualClock::new(0)), 4);
        let sub = hub.register(SubscriptionFilter::all()).expect("register");
        hub.close_all();
        assert_eq!(
            sub.try_recv(),
            Err(SubscriptionError::Closed(EvictionReason::HubClosed))
        );
        assert!(matches!(
            hub.register(SubscriptionFilter::all()),
            Err(HubError::Closed)
        ));
    }
}
