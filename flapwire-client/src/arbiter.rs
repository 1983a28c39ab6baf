//! Service arbitration.
//!
//! Every family is served by at most one ready [`Service`] at a time. Requests
//! for a family with no ready service wait in that family's queue while the
//! [`ServiceOpener`] brings one up; once it reports ready, the queue drains in
//! order.

use crate::error::ClientError;
use crate::listeners::Registry;
use crate::rate::OutboundRequest;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Accepts requests on behalf of a service.
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, request: OutboundRequest);
}

/// Asked to bring up a service for a family.
pub trait ServiceOpener: Send + Sync {
    /// Must eventually call [`ServiceArbiter::service_ready`] or
    /// [`ServiceArbiter::service_failed`] for `family`.
    fn open_service(&self, arbiter: &ServiceArbiter, family: u16);
}

/// Observes the arbiter.
pub trait ArbiterListener: Send + Sync {
    /// Queued requests for `family` were handed to a newly ready service.
    fn requests_dequeued(&self, family: u16, count: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Ready,
    Finished,
}

/// Handler bound to one family on one connection.
pub struct Service {
    family: u16,
    name: String,
    state: Mutex<ServiceState>,
    handler: Arc<dyn RequestHandler>,
}

impl Service {
    pub fn new(family: u16, name: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        Arc::new(Self {
            family,
            name: name.into(),
            state: Mutex::new(ServiceState::Created),
            handler,
        })
    }

    pub fn family(&self) -> u16 {
        self.family
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    /// Created → Ready. Returns false if the service already finished.
    fn mark_ready(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ServiceState::Finished => false,
            _ => {
                *state = ServiceState::Ready;
                true
            }
        }
    }

    /// Any state → Finished. Returns false if it already was.
    fn mark_finished(&self) -> bool {
        let mut state = self.state.lock();
        let was = *state;
        *state = ServiceState::Finished;
        was != ServiceState::Finished
    }

    fn process(&self, request: OutboundRequest) {
        self.handler.handle_request(request);
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("family", &self.family)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Default)]
struct FamilyQueue {
    pending: VecDeque<OutboundRequest>,
    current: Option<Arc<Service>>,
    opening: bool,
    // Some caller is handing `pending` to the current service
    draining: bool,
}

/// Routes requests to the ready service of their family.
pub struct ServiceArbiter {
    opener: Arc<dyn ServiceOpener>,
    families: Mutex<HashMap<u16, FamilyQueue>>,
    listeners: Registry<dyn ArbiterListener>,
}

impl ServiceArbiter {
    pub fn new(opener: Arc<dyn ServiceOpener>) -> Self {
        Self {
            opener,
            families: Mutex::new(HashMap::new()),
            listeners: Registry::new(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ArbiterListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ArbiterListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Processes `request` now if its family has a ready service, otherwise
    /// queues it and asks the opener for a service.
    ///
    /// A request with a uniqueness class first evicts any queued request of
    /// the same class. Requests are handed to the service with no lock held,
    /// so a service or listener may add requests from inside that call.
    pub fn add_request(&self, request: OutboundRequest) {
        let family = request.family();
        let mut evicted = Vec::new();
        let (should_drain, should_open) = {
            let mut families = self.families.lock();
            let queue = families.entry(family).or_default();

            if queue.current.as_ref().map_or(false, |s| s.is_ready()) {
                // Goes behind anything another caller is still draining
                queue.pending.push_back(request);
                let should_drain = !queue.draining;
                queue.draining = true;
                (should_drain, false)
            } else {
                if let Some(class) = request.uniqueness_class.as_deref() {
                    let mut kept = VecDeque::with_capacity(queue.pending.len());
                    for queued in queue.pending.drain(..) {
                        if queued.uniqueness_class.as_deref() == Some(class) {
                            evicted.push(queued);
                        } else {
                            kept.push_back(queued);
                        }
                    }
                    queue.pending = kept;
                }
                queue.pending.push_back(request);

                let should_open = !queue.opening;
                queue.opening = true;
                (false, should_open)
            }
        };

        if !evicted.is_empty() {
            tracing::debug!(family, count = evicted.len(), "Replaced queued unique requests");
        }
        for request in evicted {
            request.fail(&ClientError::Listener("superseded by a newer request".to_string()));
        }

        if should_drain {
            self.drain(family);
        }
        if should_open {
            self.open(family);
        }
    }

    fn open(&self, family: u16) {
        tracing::debug!(
            "Opening service for family {}",
            flapwire_protocol::family::name(family)
        );
        self.opener.open_service(self, family);
    }

    /// Hands queued requests to the current service one at a time, oldest
    /// first, until the queue is empty or the service is gone. Only the
    /// caller that set `draining` runs this.
    fn drain(&self, family: u16) {
        let mut should_open = false;
        loop {
            let next = {
                let mut families = self.families.lock();
                let Some(queue) = families.get_mut(&family) else {
                    return;
                };
                let service = queue.current.clone().filter(|s| s.is_ready());
                match service {
                    Some(service) if !queue.pending.is_empty() => {
                        queue.pending.pop_front().map(|request| (service, request))
                    }
                    service => {
                        queue.draining = false;
                        if service.is_none() && !queue.pending.is_empty() && !queue.opening {
                            queue.opening = true;
                            should_open = true;
                        }
                        None
                    }
                }
            };
            match next {
                Some((service, request)) => service.process(request),
                None => break,
            }
        }
        if should_open {
            self.open(family);
        }
    }

    /// Number of requests waiting for `family`.
    pub fn pending(&self, family: u16) -> usize {
        self.families
            .lock()
            .get(&family)
            .map_or(0, |q| q.pending.len())
    }

    /// Ready service currently serving `family`.
    pub fn current_service(&self, family: u16) -> Option<Arc<Service>> {
        self.families
            .lock()
            .get(&family)
            .and_then(|q| q.current.clone())
    }

    /// Makes `service` current for its family and hands it every queued
    /// request, oldest first.
    pub fn service_ready(&self, service: Arc<Service>) {
        let family = service.family();
        let (count, should_drain) = {
            let mut families = self.families.lock();
            if !service.mark_ready() {
                tracing::debug!("Ignoring ready signal from finished service {}", service.name());
                return;
            }
            let queue = families.entry(family).or_default();
            queue.current = Some(service.clone());
            queue.opening = false;

            let should_drain = !queue.draining && !queue.pending.is_empty();
            if should_drain {
                queue.draining = true;
            }
            (queue.pending.len(), should_drain)
        };
        if should_drain {
            self.drain(family);
        }

        tracing::debug!(
            family,
            service = service.name(),
            dequeued = count,
            "Service ready"
        );
        for listener in self.listeners.snapshot().iter() {
            listener.requests_dequeued(family, count);
        }
    }

    /// Marks `service` finished. If it was current, the next request for its
    /// family opens a new one.
    pub fn service_finished(&self, service: &Arc<Service>) {
        if !service.mark_finished() {
            return;
        }
        let mut families = self.families.lock();
        if let Some(queue) = families.get_mut(&service.family()) {
            if queue
                .current
                .as_ref()
                .map_or(false, |current| Arc::ptr_eq(current, service))
            {
                queue.current = None;
                tracing::debug!(family = service.family(), service = service.name(), "Service finished");
            }
        }
    }

    /// The opener gave up on `family`; everything queued for it fails.
    pub fn service_failed(&self, family: u16, error: &ClientError) {
        let requests: Vec<_> = {
            let mut families = self.families.lock();
            match families.get_mut(&family) {
                Some(queue) => {
                    queue.opening = false;
                    queue.pending.drain(..).collect()
                }
                None => Vec::new(),
            }
        };
        tracing::warn!(family, failed = requests.len(), "Could not open service: {}", error);
        for request in requests {
            request.fail(&ClientError::NoService(family));
        }
    }

    /// Finishes every service, e.g. on sign-off.
    pub fn finish_all(&self) {
        let services: Vec<_> = {
            let mut families = self.families.lock();
            families.values_mut().filter_map(|q| q.current.take()).collect()
        };
        for service in services {
            service.mark_finished();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{CommandMultiplexer, ReceivedCommand, ResponseListener};
    use crate::error::ListenerError;
    use bytes::Bytes;
    use flapwire_protocol::{family, Command};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Sink(Mutex<Vec<(u16, u16)>>);

    impl RequestHandler for Sink {
        fn handle_request(&self, request: OutboundRequest) {
            self.0.lock().push(request.command.code());
        }
    }

    #[derive(Default)]
    struct CountingOpener(Mutex<Vec<u16>>);

    impl ServiceOpener for CountingOpener {
        fn open_service(&self, _: &ServiceArbiter, family: u16) {
            self.0.lock().push(family);
        }
    }

    #[derive(Default)]
    struct Dequeued(AtomicUsize);

    impl ArbiterListener for Dequeued {
        fn requests_dequeued(&self, _: u16, count: usize) {
            self.0.fetch_add(count, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Failures(AtomicUsize);

    impl ResponseListener for Failures {
        fn handle_response(&self, _: &CommandMultiplexer, _: &ReceivedCommand) -> Result<(), ListenerError> {
            Ok(())
        }

        fn request_failed(&self, _: &ClientError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(family: u16, subtype: u16) -> OutboundRequest {
        OutboundRequest::new(Command::new(family, subtype, Bytes::new()))
    }

    #[test]
    fn test_queue_until_ready_then_drain_in_order() {
        let opener = Arc::new(CountingOpener::default());
        let arbiter = ServiceArbiter::new(opener.clone());
        let dequeued = Arc::new(Dequeued::default());
        arbiter.add_listener(dequeued.clone());

        arbiter.add_request(request(family::ICON, 2));
        arbiter.add_request(request(family::ICON, 4));
        arbiter.add_request(request(family::ICON, 6));
        // One open request per family while opening
        assert_eq!(opener.0.lock().as_slice(), &[family::ICON]);
        assert_eq!(arbiter.pending(family::ICON), 3);

        let sink = Arc::new(Sink::default());
        let service = Service::new(family::ICON, "icon", sink.clone());
        assert_eq!(service.state(), ServiceState::Created);
        arbiter.service_ready(service.clone());

        assert_eq!(
            sink.0.lock().as_slice(),
            &[(family::ICON, 2), (family::ICON, 4), (family::ICON, 6)]
        );
        assert_eq!(arbiter.pending(family::ICON), 0);
        assert_eq!(dequeued.0.load(Ordering::SeqCst), 3);

        // Later requests go straight through
        arbiter.add_request(request(family::ICON, 8));
        assert_eq!(sink.0.lock().len(), 4);
        assert_eq!(opener.0.lock().len(), 1);
    }

    #[test]
    fn test_uniqueness_class_keeps_newest() {
        let arbiter = ServiceArbiter::new(Arc::new(CountingOpener::default()));
        let failures = Arc::new(Failures::default());

        arbiter.add_request(
            request(family::ICON, 2)
                .with_listener(failures.clone())
                .with_uniqueness_class("icon upload"),
        );
        arbiter.add_request(request(family::ICON, 4));
        arbiter.add_request(request(family::ICON, 3).with_uniqueness_class("icon upload"));
        assert_eq!(arbiter.pending(family::ICON), 2);
        assert_eq!(failures.0.load(Ordering::SeqCst), 1);

        let sink = Arc::new(Sink::default());
        arbiter.service_ready(Service::new(family::ICON, "icon", sink.clone()));
        assert_eq!(sink.0.lock().as_slice(), &[(family::ICON, 4), (family::ICON, 3)]);
    }

    #[test]
    fn test_finished_service_triggers_reopen() {
        let opener = Arc::new(CountingOpener::default());
        let arbiter = ServiceArbiter::new(opener.clone());
        let first = Service::new(family::CHAT, "chat-1", Arc::new(Sink::default()));
        arbiter.service_ready(first.clone());
        assert!(arbiter.current_service(family::CHAT).is_some());

        arbiter.service_finished(&first);
        assert_eq!(first.state(), ServiceState::Finished);
        assert!(arbiter.current_service(family::CHAT).is_none());

        arbiter.add_request(request(family::CHAT, 5));
        assert_eq!(opener.0.lock().as_slice(), &[family::CHAT]);

        // A finished service is never reused
        arbiter.service_ready(first.clone());
        assert_eq!(arbiter.pending(family::CHAT), 1);
    }

    #[test]
    fn test_finishing_stale_service_keeps_current() {
        let arbiter = ServiceArbiter::new(Arc::new(CountingOpener::default()));
        let old = Service::new(family::CHAT, "old", Arc::new(Sink::default()));
        let new = Service::new(family::CHAT, "new", Arc::new(Sink::default()));
        arbiter.service_ready(old.clone());
        arbiter.service_ready(new.clone());
        arbiter.service_finished(&old);
        assert_eq!(arbiter.current_service(family::CHAT).unwrap().name(), "new");
    }

    #[test]
    fn test_open_failure_fails_queued() {
        let arbiter = ServiceArbiter::new(Arc::new(CountingOpener::default()));
        let failures = Arc::new(Failures::default());
        arbiter.add_request(request(family::SEARCH, 2).with_listener(failures.clone()));
        arbiter.add_request(request(family::SEARCH, 2).with_listener(failures.clone()));
        arbiter.service_failed(family::SEARCH, &ClientError::Timeout);
        assert_eq!(failures.0.load(Ordering::SeqCst), 2);
        assert_eq!(arbiter.pending(family::SEARCH), 0);
    }

    /// Records each request and, for one subtype, adds another request to
    /// the arbiter from inside the handler.
    struct Resubmitting {
        arbiter: Mutex<Option<Arc<ServiceArbiter>>>,
        seen: Mutex<Vec<u16>>,
    }

    impl RequestHandler for Resubmitting {
        fn handle_request(&self, incoming: OutboundRequest) {
            let subtype = incoming.command.subtype;
            self.seen.lock().push(subtype);
            if subtype == 2 {
                let arbiter = self.arbiter.lock().clone();
                if let Some(arbiter) = arbiter {
                    arbiter.add_request(request(family::ICBM, 9));
                }
            }
        }
    }

    #[test]
    fn test_handler_may_add_requests_while_draining() {
        let arbiter = Arc::new(ServiceArbiter::new(Arc::new(CountingOpener::default())));
        let handler = Arc::new(Resubmitting {
            arbiter: Mutex::new(Some(arbiter.clone())),
            seen: Mutex::new(Vec::new()),
        });
        arbiter.add_request(request(family::ICBM, 2));
        arbiter.add_request(request(family::ICBM, 4));
        arbiter.add_request(request(family::ICBM, 6));

        arbiter.service_ready(Service::new(family::ICBM, "icbm", handler.clone()));
        // The nested request waits for the ones already queued
        assert_eq!(handler.seen.lock().as_slice(), &[2, 4, 6, 9]);
        assert_eq!(arbiter.pending(family::ICBM), 0);

        arbiter.add_request(request(family::ICBM, 2));
        assert_eq!(handler.seen.lock().as_slice(), &[2, 4, 6, 9, 2, 9]);
        handler.arbiter.lock().take();
    }

    /// Retries a failed request through the arbiter once.
    struct RetryOnce {
        arbiter: Arc<ServiceArbiter>,
        failures: AtomicUsize,
    }

    impl ResponseListener for RetryOnce {
        fn handle_response(&self, _: &CommandMultiplexer, _: &ReceivedCommand) -> Result<(), ListenerError> {
            Ok(())
        }

        fn request_failed(&self, _: &ClientError) {
            if self.failures.fetch_add(1, Ordering::SeqCst) == 0 {
                self.arbiter.add_request(request(family::ICBM, 7));
            }
        }
    }

    #[test]
    fn test_failure_listener_may_resubmit() {
        use crate::config::RateConfig;
        use crate::rate::OutboundScheduler;
        use crate::transport::{FrameTransport, TransportOptions};
        use std::sync::mpsc;
        use std::time::Duration;

        // Never attached, so every send fails inside the handler
        let transport = FrameTransport::new("arbiter-test", TransportOptions::default());
        let scheduler = OutboundScheduler::new(CommandMultiplexer::new(transport), RateConfig::default());
        let arbiter = Arc::new(ServiceArbiter::new(Arc::new(CountingOpener::default())));
        arbiter.service_ready(Service::new(family::ICBM, "icbm", Arc::new(scheduler)));

        let retry = Arc::new(RetryOnce {
            arbiter: arbiter.clone(),
            failures: AtomicUsize::new(0),
        });
        let (done_tx, done_rx) = mpsc::channel();
        let submit = {
            let arbiter = arbiter.clone();
            let retry = retry.clone();
            move || {
                arbiter.add_request(request(family::ICBM, 6).with_listener(retry));
                let _ = done_tx.send(());
            }
        };
        std::thread::spawn(submit);

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        // The resubmitted request carries no listener
        assert_eq!(retry.failures.load(Ordering::SeqCst), 1);
        assert_eq!(arbiter.pending(family::ICBM), 0);
    }
}
