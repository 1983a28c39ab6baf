//! Rate-limited outbound scheduling.
//!
//! The server assigns every command to a rate class and disconnects clients
//! whose moving average interval between sends drops too low. Outgoing
//! commands wait in a per-family FIFO; each queue asks its class monitor how
//! many sends fit right now and sends at most that many, oldest first.

use crate::arbiter::RequestHandler;
use crate::config::RateConfig;
use crate::error::{ClientError, ListenerError};
use crate::mux::{CommandListener, CommandMultiplexer, ReceivedCommand, ResponseListener};
use crate::transport::{ConnectionEvent, ConnectionListener, FrameTransport, TransportState};
use dashmap::DashMap;
use flapwire_protocol::message::{RateChange, RateChangeCode};
use flapwire_protocol::{family, Command, CommandBody, RateClassInfo, RateInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;

/// Grants send budget.
pub trait RateMonitor: Send + Sync {
    /// Reserves up to `wanted` sends and returns how many were granted. The
    /// granted sends count as made.
    fn acquire(&self, wanted: usize) -> usize;
}

/// Monitor for families with no announced rate class.
#[derive(Debug, Default)]
pub struct Unlimited;

impl RateMonitor for Unlimited {
    fn acquire(&self, wanted: usize) -> usize {
        wanted
    }
}

#[derive(Debug)]
struct ClassState {
    info: RateClassInfo,
    current_avg: u32,
    last_send: Instant,
    limited: bool,
}

impl ClassState {
    fn limit(&self) -> u32 {
        if self.limited {
            self.info.clear_avg
        } else {
            self.info.alert_avg
        }
    }

    fn next_average(&self, old: u32, elapsed_ms: u64) -> u32 {
        let window = u64::from(self.info.window_size.max(1));
        let avg = ((window - 1) * u64::from(old) + elapsed_ms) / window;
        avg.min(u64::from(self.info.max_avg)) as u32
    }

    /// Simulates back-to-back sends starting now. Returns the count and the
    /// resulting average and limited flag.
    fn simulate(&self, wanted: usize, elapsed_ms: u64, margin: u32) -> (usize, u32, bool) {
        let mut avg = self.current_avg;
        let mut limited = self.limited;
        let mut count = 0;
        while count < wanted {
            let elapsed = if count == 0 { elapsed_ms } else { 0 };
            let next = self.next_average(avg, elapsed);
            let limit = if limited {
                self.info.clear_avg
            } else {
                self.info.alert_avg
            };
            if u64::from(next) <= u64::from(limit) + u64::from(margin) {
                break;
            }
            avg = next;
            if limited && avg > self.info.clear_avg {
                limited = false;
            }
            count += 1;
        }
        (count, avg, limited)
    }
}

/// Tracks the moving average of one server rate class.
#[derive(Debug)]
pub struct RateClassMonitor {
    margin: u32,
    state: Mutex<ClassState>,
}

impl RateClassMonitor {
    pub fn new(info: RateClassInfo, error_margin_ms: u64) -> Self {
        Self::starting_at(info, error_margin_ms, Instant::now())
    }

    fn starting_at(info: RateClassInfo, error_margin_ms: u64, now: Instant) -> Self {
        let current_avg = if info.current_avg == 0 {
            info.max_avg
        } else {
            info.current_avg.min(info.max_avg)
        };
        Self {
            margin: error_margin_ms.min(u64::from(u32::MAX)) as u32,
            state: Mutex::new(ClassState {
                info,
                current_avg,
                last_send: now,
                limited: false,
            }),
        }
    }

    pub fn class_id(&self) -> u16 {
        self.state.lock().info.class_id
    }

    pub fn info(&self) -> RateClassInfo {
        self.state.lock().info
    }

    pub fn current_average(&self) -> u32 {
        self.state.lock().current_avg
    }

    pub fn is_limited(&self) -> bool {
        self.state.lock().limited
    }

    /// Average below which sending stops, margin excluded.
    pub fn limit(&self) -> u32 {
        self.state.lock().limit()
    }

    /// How many sends would currently be granted, without reserving them.
    pub fn possible_sends(&self, wanted: usize) -> usize {
        let state = self.state.lock();
        let elapsed = elapsed_ms(state.last_send, Instant::now());
        state.simulate(wanted, elapsed, self.margin).0
    }

    /// Applies a server rate-change notification.
    pub fn update(&self, change: &RateChange) {
        let mut state = self.state.lock();
        state.info = change.class;
        state.current_avg = change.class.current_avg.min(change.class.max_avg);
        match change.code {
            RateChangeCode::Limited => state.limited = true,
            RateChangeCode::Clear => state.limited = false,
            RateChangeCode::Changed | RateChangeCode::Warning => {}
        }
        tracing::debug!(
            class = change.class.class_id,
            code = ?change.code,
            avg = state.current_avg,
            limited = state.limited,
            "Rate class updated"
        );
    }

    fn acquire_at(&self, wanted: usize, now: Instant) -> usize {
        let mut state = self.state.lock();
        if state.info.max_avg == 0 {
            return wanted;
        }
        let elapsed = elapsed_ms(state.last_send, now);
        let (count, avg, limited) = state.simulate(wanted, elapsed, self.margin);
        if count > 0 {
            state.current_avg = avg;
            state.limited = limited;
            state.last_send = now;
        }
        count
    }
}

impl RateMonitor for RateClassMonitor {
    fn acquire(&self, wanted: usize) -> usize {
        self.acquire_at(wanted, Instant::now())
    }
}

fn elapsed_ms(since: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(since).as_millis().min(u128::from(u64::MAX)) as u64
}

/// FIFO paired with a rate monitor.
pub struct RateQueue<T> {
    items: Mutex<VecDeque<T>>,
    monitor: RwLock<Arc<dyn RateMonitor>>,
    paused: AtomicBool,
    // Held while a batch is handed to `send`; never taken blocking
    sending: Mutex<()>,
    // Set by a pass that found another pass sending
    missed: AtomicBool,
}

impl<T> RateQueue<T> {
    pub fn new(monitor: Arc<dyn RateMonitor>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            monitor: RwLock::new(monitor),
            paused: AtomicBool::new(false),
            sending: Mutex::new(()),
            missed: AtomicBool::new(false),
        }
    }

    pub fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_monitor(&self, monitor: Arc<dyn RateMonitor>) {
        *self.monitor.write() = monitor;
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Removes everything still queued.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Sends as many of the oldest items as the monitor allows right now.
    ///
    /// Items are removed under the queue lock and handed to `send` after it
    /// is released, so `send` may enqueue or start another pass on this
    /// queue. Only one pass sends at a time. A pass that finds another one
    /// sending returns 0 and the sending pass runs once more on its behalf,
    /// which keeps items in queue order. Returns the number sent.
    pub fn send_and_dequeue_ready_if_possible(&self, mut send: impl FnMut(T)) -> usize {
        let mut sent = 0;
        loop {
            let Some(sending) = self.sending.try_lock() else {
                self.missed.store(true, Ordering::SeqCst);
                return sent;
            };
            self.missed.store(false, Ordering::SeqCst);
            let batch = self.take_ready();
            sent += batch.len();
            for item in batch {
                send(item);
            }
            drop(sending);
            if !self.missed.load(Ordering::SeqCst) {
                return sent;
            }
        }
    }

    fn take_ready(&self) -> Vec<T> {
        let mut items = self.items.lock();
        if self.is_paused() || items.is_empty() {
            return Vec::new();
        }
        let monitor = self.monitor.read().clone();
        let allowed = monitor.acquire(items.len()).min(items.len());
        items.drain(..allowed).collect()
    }
}

/// A command waiting to be sent.
pub struct OutboundRequest {
    pub command: Command,
    pub listener: Option<Arc<dyn ResponseListener>>,
    /// At most one pending request per uniqueness class survives.
    pub uniqueness_class: Option<String>,
}

impl OutboundRequest {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            listener: None,
            uniqueness_class: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ResponseListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_uniqueness_class(mut self, class: impl Into<String>) -> Self {
        self.uniqueness_class = Some(class.into());
        self
    }

    pub fn family(&self) -> u16 {
        self.command.family
    }

    /// Tells the listener, if any, that this request will not be sent.
    pub fn fail(self, error: &ClientError) {
        if let Some(listener) = self.listener {
            listener.request_failed(error);
        }
    }
}

impl std::fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("family", &self.command.family)
            .field("subtype", &self.command.subtype)
            .field("has_listener", &self.listener.is_some())
            .field("uniqueness_class", &self.uniqueness_class)
            .finish()
    }
}

struct SchedulerInner {
    mux: CommandMultiplexer,
    config: RateConfig,
    queues: DashMap<u16, Arc<RateQueue<OutboundRequest>>>,
    classes: DashMap<u16, Arc<RateClassMonitor>>,
    family_class: DashMap<u16, u16>,
    default_class: Mutex<Option<u16>>,
    paused: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Per-connection outbound scheduler. Cheap to clone.
#[derive(Clone)]
pub struct OutboundScheduler {
    inner: Arc<SchedulerInner>,
}

impl OutboundScheduler {
    /// Creates a scheduler sending through `mux` and following its rate-change
    /// notifications.
    pub fn new(mux: CommandMultiplexer, config: RateConfig) -> Self {
        let inner = Arc::new(SchedulerInner {
            mux: mux.clone(),
            config,
            queues: DashMap::new(),
            classes: DashMap::new(),
            family_class: DashMap::new(),
            default_class: Mutex::new(None),
            paused: AtomicBool::new(false),
            pump: Mutex::new(None),
        });
        let hook = Arc::new(RateChangeHook(Arc::downgrade(&inner)));
        mux.add_family_listener(family::SERVICE, hook.clone());
        mux.transport().add_connection_listener(hook);
        Self { inner }
    }

    /// Installs the classes of a rate information reply.
    pub fn install_rate_info(&self, info: &RateInfo) {
        for class in &info.classes {
            let margin = self.inner.config.error_margin(class.class_id);
            self.inner
                .classes
                .insert(class.class_id, Arc::new(RateClassMonitor::new(*class, margin)));
        }
        for group in &info.members {
            for (family, _) in &group.commands {
                self.inner.family_class.entry(*family).or_insert(group.class_id);
            }
        }
        *self.inner.default_class.lock() = info.classes.iter().map(|c| c.class_id).min();

        for entry in self.inner.queues.iter() {
            entry.value().set_monitor(self.monitor_for(*entry.key()));
        }
        tracing::debug!(
            classes = info.classes.len(),
            families = self.inner.family_class.len(),
            "Rate classes installed"
        );
    }

    pub fn class_monitor(&self, class_id: u16) -> Option<Arc<RateClassMonitor>> {
        self.inner.classes.get(&class_id).map(|m| m.clone())
    }

    /// Class governing `family`, if rate information has been installed.
    pub fn class_of(&self, family: u16) -> Option<u16> {
        self.inner
            .family_class
            .get(&family)
            .map(|c| *c)
            .or(*self.inner.default_class.lock())
    }

    fn monitor_for(&self, family: u16) -> Arc<dyn RateMonitor> {
        match self.class_of(family).and_then(|c| self.class_monitor(c)) {
            Some(monitor) => monitor,
            None => Arc::new(Unlimited),
        }
    }

    fn queue(&self, family: u16) -> Arc<RateQueue<OutboundRequest>> {
        self.inner
            .queues
            .entry(family)
            .or_insert_with(|| {
                let queue = RateQueue::new(self.monitor_for(family));
                if self.inner.paused.load(Ordering::SeqCst) {
                    queue.pause();
                }
                Arc::new(queue)
            })
            .clone()
    }

    /// Queues a request and sends whatever the budget allows.
    pub fn enqueue(&self, request: OutboundRequest) {
        let family = request.family();
        self.queue(family).enqueue(request);
        self.send_ready(family);
    }

    /// Runs one dequeue pass on `family`'s queue.
    pub fn send_ready(&self, family: u16) -> usize {
        let queue = self.queue(family);
        let mut failed = Vec::new();
        let sent = queue.send_and_dequeue_ready_if_possible(|request| {
            let result = match request.listener {
                Some(ref listener) => self.inner.mux.send_request(request.command.clone(), listener.clone()),
                None => self.inner.mux.send(request.command.clone()),
            };
            if let Err(e) = result {
                failed.push((request, e));
            }
        });
        // Listeners run outside the queue lock
        for (request, error) in failed {
            tracing::warn!(family, "Dequeued command not sent: {}", error);
            request.fail(&error);
        }
        sent
    }

    /// Runs one dequeue pass on every queue.
    pub fn send_all_ready(&self) -> usize {
        let families: Vec<u16> = self.inner.queues.iter().map(|e| *e.key()).collect();
        families.into_iter().map(|f| self.send_ready(f)).sum()
    }

    pub fn queued(&self, family: u16) -> usize {
        self.inner.queues.get(&family).map_or(0, |q| q.len())
    }

    /// Stops all dequeuing regardless of budget.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        for queue in self.inner.queues.iter() {
            queue.pause();
        }
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        for queue in self.inner.queues.iter() {
            queue.resume();
        }
        self.send_all_ready();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Fails everything still queued, e.g. after the connection dropped.
    pub fn fail_all(&self, error: &ClientError) {
        let queues: Vec<_> = self.inner.queues.iter().map(|e| e.value().clone()).collect();
        for queue in queues {
            for request in queue.drain() {
                request.fail(error);
            }
        }
    }

    /// Starts the task that periodically re-runs dequeue so budget regained
    /// over time is used. Stops when the connection closes.
    pub fn start_pump(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.pump_interval();
        let mut closed = self.inner.mux.transport().subscribe_state();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                let stopped = tokio::select! {
                    _ = ticker.tick() => false,
                    changed = closed.changed() => changed.is_err(),
                };
                if stopped || *closed.borrow() == TransportState::Disconnected {
                    break;
                }
                let Some(inner) = weak.upgrade() else { break };
                OutboundScheduler { inner }.send_all_ready();
            }
        });
        if let Some(previous) = self.inner.pump.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn stop_pump(&self) {
        if let Some(task) = self.inner.pump.lock().take() {
            task.abort();
        }
    }
}

impl RequestHandler for OutboundScheduler {
    fn handle_request(&self, request: OutboundRequest) {
        self.enqueue(request);
    }
}

struct RateChangeHook(Weak<SchedulerInner>);

impl CommandListener for RateChangeHook {
    fn handle_command(
        &self,
        _: &CommandMultiplexer,
        command: &ReceivedCommand,
    ) -> Result<(), ListenerError> {
        let CommandBody::RateChange(change) = &command.body else {
            return Ok(());
        };
        let Some(inner) = self.0.upgrade() else {
            return Ok(());
        };
        let scheduler = OutboundScheduler { inner };
        let class_id = change.class.class_id;
        match scheduler.class_monitor(class_id) {
            Some(monitor) => monitor.update(change),
            None => {
                let margin = scheduler.inner.config.error_margin(class_id);
                let monitor = Arc::new(RateClassMonitor::new(change.class, margin));
                monitor.update(change);
                scheduler.inner.classes.insert(class_id, monitor);
            }
        }
        if change.code == RateChangeCode::Warning || change.code == RateChangeCode::Limited {
            tracing::warn!(class = class_id, code = ?change.code, "Server rate warning");
        }
        scheduler.send_all_ready();
        Ok(())
    }
}

impl ConnectionListener for RateChangeHook {
    fn connection_event(&self, _: &FrameTransport, event: &ConnectionEvent) {
        if let (ConnectionEvent::Disconnected { .. }, Some(inner)) = (event, self.0.upgrade()) {
            let scheduler = OutboundScheduler { inner };
            scheduler.stop_pump();
            scheduler.fail_all(&ClientError::ConnectionClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    /// Grants a scripted number of sends per call.
    struct Scripted(Mutex<VecDeque<usize>>);

    impl RateMonitor for Scripted {
        fn acquire(&self, wanted: usize) -> usize {
            self.0.lock().pop_front().unwrap_or(0).min(wanted)
        }
    }

    fn class(current: u32) -> RateClassInfo {
        RateClassInfo {
            class_id: 1,
            window_size: 10,
            clear_avg: 500,
            alert_avg: 400,
            limited_avg: 300,
            disconnect_avg: 100,
            current_avg: current,
            max_avg: 1000,
            last_time: 0,
            state: 0,
        }
    }

    #[test]
    fn test_dequeue_follows_monitor_counts() {
        let monitor = Arc::new(Scripted(Mutex::new(VecDeque::from(vec![2, 1, 6]))));
        let queue = RateQueue::new(monitor);
        for i in 0..8 {
            queue.enqueue(i);
        }

        let mut sent = Vec::new();
        queue.send_and_dequeue_ready_if_possible(|i| sent.push(i));
        assert_eq!((sent.len(), queue.len()), (2, 6));
        queue.send_and_dequeue_ready_if_possible(|i| sent.push(i));
        assert_eq!((sent.len(), queue.len()), (3, 5));
        queue.send_and_dequeue_ready_if_possible(|i| sent.push(i));
        assert_eq!((sent.len(), queue.len()), (8, 0));
        assert_eq!(sent, (0..8).collect::<Vec<_>>());

        assert_eq!(queue.send_and_dequeue_ready_if_possible(|i| sent.push(i)), 0);
        assert_eq!(sent.len(), 8);
    }

    #[test]
    fn test_paused_queue_sends_nothing() {
        let queue = RateQueue::new(Arc::new(Unlimited));
        queue.enqueue("a");
        queue.pause();
        assert_eq!(queue.send_and_dequeue_ready_if_possible(|_| {}), 0);
        queue.resume();
        assert_eq!(queue.send_and_dequeue_ready_if_possible(|_| {}), 1);
    }

    #[test]
    fn test_concurrent_dequeue_never_exceeds_budget() {
        let monitor = Arc::new(Scripted(Mutex::new(VecDeque::from(vec![3, 0, 0, 0]))));
        let queue = Arc::new(RateQueue::new(monitor));
        for i in 0..10 {
            queue.enqueue(i);
        }
        let sent = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let sent = sent.clone();
                std::thread::spawn(move || queue.send_and_dequeue_ready_if_possible(|i| sent.lock().push(i)))
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 3);
        assert_eq!(sent.lock().as_slice(), &[0, 1, 2]);
        assert_eq!(queue.len(), 7);
    }

    #[test]
    fn test_send_may_reenter_queue() {
        let queue = Arc::new(RateQueue::new(Arc::new(Unlimited)));
        queue.enqueue(0);
        queue.enqueue(1);

        let mut sent = Vec::new();
        let mut nested = 0;
        let total = queue.send_and_dequeue_ready_if_possible(|i| {
            if i == 0 {
                // An error path putting a request back on its own family
                queue.enqueue(99);
                nested = queue.send_and_dequeue_ready_if_possible(|_| {});
            }
            sent.push(i);
        });
        assert_eq!(nested, 0);
        assert_eq!(total, 3);
        assert_eq!(sent, vec![0, 1, 99]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_class_monitor_average() {
        let now = Instant::now();
        let monitor = RateClassMonitor::starting_at(class(1000), 0, now);
        // 900, 810, 729, 656, 590, 531, 477, 429 stay above 400; 386 would not
        assert_eq!(monitor.acquire_at(20, now), 8);
        assert_eq!(monitor.current_average(), 429);
        assert_eq!(monitor.acquire_at(1, now), 0);

        // Waiting raises the average again, capped at max
        let later = now + Duration::from_secs(60);
        assert_eq!(monitor.acquire_at(1, later), 1);
        assert_eq!(monitor.current_average(), 1000);
    }

    #[test]
    fn test_error_margin_reduces_budget() {
        let now = Instant::now();
        let strict = RateClassMonitor::starting_at(class(1000), 200, now);
        // limit 600: 900, 810, 729, 656 pass; 590 does not
        assert_eq!(strict.acquire_at(20, now), 4);
    }

    #[test]
    fn test_limited_class_waits_for_clear_average() {
        let now = Instant::now();
        let monitor = RateClassMonitor::starting_at(class(1000), 0, now);
        monitor.update(&RateChange {
            code: RateChangeCode::Limited,
            class: class(350),
        });
        assert!(monitor.is_limited());
        assert_eq!(monitor.limit(), 500);
        assert_eq!(monitor.acquire_at(1, now), 0);

        let later = now + Duration::from_secs(5);
        // (9 * 350 + 5000) / 10 = 815 clears the limit
        assert_eq!(monitor.acquire_at(1, later), 1);
        assert!(!monitor.is_limited());
        assert_eq!(monitor.limit(), 400);
    }

    #[tokio::test]
    async fn test_scheduler_holds_back_over_budget() {
        use crate::transport::{FrameTransport, TransportOptions};
        use flapwire_protocol::message::RateClassMembers;

        let (client, _server) = tokio::io::duplex(64 * 1024);
        let transport = FrameTransport::new("rate-test", TransportOptions::default());
        let mux = CommandMultiplexer::new(transport.clone());
        transport.attach(client).unwrap();

        let config = RateConfig {
            error_margin_ms: 0,
            ..RateConfig::default()
        };
        let scheduler = OutboundScheduler::new(mux, config);
        scheduler.install_rate_info(&RateInfo {
            classes: vec![class(1000)],
            members: vec![RateClassMembers {
                class_id: 1,
                commands: vec![(family::ICBM, 0x0006)],
            }],
        });
        assert_eq!(scheduler.class_of(family::ICBM), Some(1));
        // Unlisted families fall back to the lowest class
        assert_eq!(scheduler.class_of(family::BUDDY), Some(1));

        scheduler.pause();
        for _ in 0..10 {
            scheduler.enqueue(OutboundRequest::new(Command::new(family::ICBM, 0x0006, Bytes::new())));
        }
        assert_eq!(scheduler.queued(family::ICBM), 10);

        scheduler.resume();
        assert_eq!(scheduler.queued(family::ICBM), 2);
        assert_eq!(scheduler.send_ready(family::ICBM), 0);
    }

    #[test]
    fn test_unknown_class_is_unlimited() {
        let monitor = RateClassMonitor::new(RateClassInfo::default(), 100);
        assert_eq!(monitor.acquire(50), 50);
    }
}
