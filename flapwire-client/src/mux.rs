//! Command multiplexer.
//!
//! Decodes commands out of data-channel frames and routes them. A command whose
//! request id matches an outstanding request goes to that request's listener
//! only; everything else goes to the listeners registered for its family and
//! then to the catch-all listeners.

use crate::error::{ClientError, FaultKind, ListenerError};
use crate::listeners::Registry;
use crate::transport::{ConnectionEvent, ConnectionListener, FrameListener, FrameTransport};
use dashmap::DashMap;
use flapwire_protocol::{Channel, Command, CommandBody, Frame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

/// Client request ids use the low 31 bits.
pub const REQUEST_ID_MASK: u32 = 0x7fff_ffff;

/// A command as it arrived, with its typed body.
#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    /// Sequence number of the carrying frame.
    pub sequence: u16,
    pub command: Command,
    pub body: CommandBody,
}

impl ReceivedCommand {
    /// Whether more responses to the same request follow this one.
    pub fn has_more_replies(&self) -> bool {
        self.command.flags.has_more_replies()
    }
}

/// Receives unsolicited commands.
pub trait CommandListener: Send + Sync {
    fn handle_command(
        &self,
        mux: &CommandMultiplexer,
        command: &ReceivedCommand,
    ) -> Result<(), ListenerError>;
}

/// Receives the responses to one request.
pub trait ResponseListener: Send + Sync {
    fn handle_response(
        &self,
        mux: &CommandMultiplexer,
        response: &ReceivedCommand,
    ) -> Result<(), ListenerError>;

    /// The request will never be answered.
    fn request_failed(&self, _error: &ClientError) {}
}

struct MuxInner {
    transport: FrameTransport,
    next_id: AtomicU32,
    pending: DashMap<u32, Arc<dyn ResponseListener>>,
    family_listeners: DashMap<u16, Arc<Registry<dyn CommandListener>>>,
    catch_all: Registry<dyn CommandListener>,
}

/// Typed command layer over a [`FrameTransport`]. Cheap to clone.
#[derive(Clone)]
pub struct CommandMultiplexer {
    inner: Arc<MuxInner>,
}

impl CommandMultiplexer {
    /// Wraps `transport` and starts listening to its data channel.
    pub fn new(transport: FrameTransport) -> Self {
        let inner = Arc::new(MuxInner {
            transport: transport.clone(),
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
            family_listeners: DashMap::new(),
            catch_all: Registry::new(),
        });
        let hook = Arc::new(MuxHook(Arc::downgrade(&inner)));
        transport.add_listener(hook.clone());
        transport.add_connection_listener(hook);
        Self { inner }
    }

    pub fn transport(&self) -> &FrameTransport {
        &self.inner.transport
    }

    pub fn add_family_listener(&self, family: u16, listener: Arc<dyn CommandListener>) {
        self.inner
            .family_listeners
            .entry(family)
            .or_insert_with(|| Arc::new(Registry::new()))
            .add(listener);
    }

    pub fn remove_family_listener(&self, family: u16, listener: &Arc<dyn CommandListener>) -> bool {
        // Clone the registry out so no map shard stays locked
        let registry = self.inner.family_listeners.get(&family).map(|r| r.clone());
        registry.map_or(false, |r| r.remove(listener))
    }

    /// Listener for unsolicited commands of every family.
    pub fn add_listener(&self, listener: Arc<dyn CommandListener>) {
        self.inner.catch_all.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CommandListener>) -> bool {
        self.inner.catch_all.remove(listener)
    }

    /// Number of requests still waiting for their final response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Next request id: increasing, 31 bits, never zero.
    pub fn next_request_id(&self) -> u32 {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) & REQUEST_ID_MASK;
            if id != 0 {
                return id;
            }
        }
    }

    /// Sends a command that expects no reply. Returns its request id.
    pub fn send(&self, command: Command) -> Result<u32, ClientError> {
        let command = self.numbered(command);
        let id = command.request_id;
        self.write(&command)?;
        Ok(id)
    }

    /// Sends a command and routes its responses to `listener`.
    pub fn send_request(
        &self,
        command: Command,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<u32, ClientError> {
        let command = self.numbered(command);
        let id = command.request_id;
        self.inner.pending.insert(id, listener);
        if let Err(e) = self.write(&command) {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Sends a command and waits for every part of its response.
    ///
    /// An error reply (subtype 1) resolves to [`ClientError::ServerError`].
    pub async fn request(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Vec<ReceivedCommand>, ClientError> {
        let (collector, rx) = response_channel();
        let id = self.send_request(command, collector)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::debug!("Request id={} timed out", id);
                self.inner.pending.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Assigns a request id unless the caller already set one.
    fn numbered(&self, mut command: Command) -> Command {
        if command.request_id == 0 {
            command.request_id = self.next_request_id();
        }
        command
    }

    fn write(&self, command: &Command) -> Result<(), ClientError> {
        let payload = match command.encode() {
            Ok(payload) => payload,
            Err(e) => {
                let err = ClientError::Protocol(e);
                self.inner
                    .transport
                    .report_error(FaultKind::CommandGeneration, &err);
                return Err(err);
            }
        };
        self.inner.transport.send_frame(Channel::DATA, &payload)?;
        tracing::trace!(
            family = command.family,
            subtype = command.subtype,
            request_id = command.request_id,
            "Command sent"
        );
        Ok(())
    }

    fn route(&self, received: ReceivedCommand) {
        let id = received.command.request_id;

        // A final reply removes the entry atomically, so it is delivered once
        let listener = if received.has_more_replies() {
            self.inner.pending.get(&id).map(|l| l.clone())
        } else {
            self.inner.pending.remove(&id).map(|(_, l)| l)
        };

        if let Some(listener) = listener {
            if let Err(e) = listener.handle_response(self, &received) {
                self.listener_failed(e);
            }
            return;
        }

        let family = received.command.family;
        let registry = self.inner.family_listeners.get(&family).map(|r| r.clone());
        let family_listeners = registry.map(|r| r.snapshot()).unwrap_or_default();
        let catch_all = self.inner.catch_all.snapshot();

        if family_listeners.is_empty() && catch_all.is_empty() {
            tracing::debug!(
                "Dropping unhandled command {}/{:#06x} (request id {})",
                flapwire_protocol::family::name(family),
                received.command.subtype,
                id
            );
            return;
        }

        for listener in family_listeners.iter().chain(catch_all.iter()) {
            if let Err(e) = listener.handle_command(self, &received) {
                self.listener_failed(e);
            }
        }
    }

    fn listener_failed(&self, error: ListenerError) {
        self.inner
            .transport
            .report_error(FaultKind::Listener, &ClientError::Listener(error.to_string()));
    }

    fn fail_pending(&self) {
        let ids: Vec<u32> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, listener)) = self.inner.pending.remove(&id) {
                listener.request_failed(&ClientError::ConnectionClosed);
            }
        }
    }
}

/// Frame-side hook; holds the multiplexer weakly so the transport does not
/// keep it alive.
struct MuxHook(Weak<MuxInner>);

impl MuxHook {
    fn mux(&self) -> Option<CommandMultiplexer> {
        self.0.upgrade().map(|inner| CommandMultiplexer { inner })
    }
}

impl FrameListener for MuxHook {
    fn handle_frame(&self, transport: &FrameTransport, frame: &Frame) -> Result<(), ListenerError> {
        if frame.channel != Channel::DATA {
            return Ok(());
        }
        let Some(mux) = self.mux() else {
            return Ok(());
        };

        let command = match Command::decode(&frame.payload) {
            Ok(command) => command,
            Err(e) => {
                transport.report_error(FaultKind::Connection, &ClientError::Protocol(e));
                return Ok(());
            }
        };
        let body = match CommandBody::from_command(&command) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(
                    "Malformed {}/{:#06x} body: {}",
                    flapwire_protocol::family::name(command.family),
                    command.subtype,
                    e
                );
                CommandBody::Unrecognized {
                    family: command.family,
                    subtype: command.subtype,
                    raw: command.body.clone(),
                }
            }
        };

        mux.route(ReceivedCommand {
            sequence: frame.sequence,
            command,
            body,
        });
        Ok(())
    }
}

impl ConnectionListener for MuxHook {
    fn connection_event(&self, _: &FrameTransport, event: &ConnectionEvent) {
        if let (ConnectionEvent::Disconnected { .. }, Some(mux)) = (event, self.mux()) {
            mux.fail_pending();
        }
    }
}

/// Every part of a response, or why there is none.
pub type CollectedResult = Result<Vec<ReceivedCommand>, ClientError>;

/// A response listener that gathers every part of a response and resolves
/// the receiver once the final part (or an error reply) arrives.
pub fn response_channel() -> (Arc<dyn ResponseListener>, oneshot::Receiver<CollectedResult>) {
    let (tx, rx) = oneshot::channel();
    let collector = Arc::new(Collector {
        parts: Mutex::new(Vec::new()),
        done: Mutex::new(Some(tx)),
    });
    (collector, rx)
}

struct Collector {
    parts: Mutex<Vec<ReceivedCommand>>,
    done: Mutex<Option<oneshot::Sender<CollectedResult>>>,
}

impl Collector {
    fn finish(&self, result: CollectedResult) {
        if let Some(tx) = self.done.lock().take() {
            let _ = tx.send(result);
        }
    }
}

impl ResponseListener for Collector {
    fn handle_response(
        &self,
        _: &CommandMultiplexer,
        response: &ReceivedCommand,
    ) -> Result<(), ListenerError> {
        if let CommandBody::Error(reply) = &response.body {
            self.finish(Err(ClientError::ServerError {
                family: reply.family,
                code: reply.code,
            }));
            return Ok(());
        }

        let mut parts = self.parts.lock();
        parts.push(response.clone());
        if !response.has_more_replies() {
            let parts = std::mem::take(&mut *parts);
            self.finish(Ok(parts));
        }
        Ok(())
    }

    fn request_failed(&self, error: &ClientError) {
        let error = match error {
            ClientError::Timeout => ClientError::Timeout,
            _ => ClientError::ConnectionClosed,
        };
        self.finish(Err(error));
    }
}
