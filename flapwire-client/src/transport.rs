//! Frame transport: one reader task, one writer task, and listener dispatch.
//!
//! Decoded frames go either straight to listeners on the reader task
//! ([`DispatchMode::Inline`]) or through a bounded FIFO drained by a worker
//! task ([`DispatchMode::Queued`]) so a slow listener never stalls the reader.
//! Outgoing frames are numbered under one lock and handed to the writer task in
//! the same order, so sequence numbers on the wire are strictly increasing
//! (mod 65536).

use crate::config::{DispatchMode, TransportConfig};
use crate::error::{ClientError, FaultKind, ListenerError};
use crate::listeners::Registry;
use bytes::Bytes;
use flapwire_protocol::{Channel, Decoder, Frame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What a vetoable listener wants done with the rest of the dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VetoResult {
    /// Keep going.
    Continue,
    /// Skip the remaining vetoable listeners; plain listeners still run.
    StopListeners,
    /// Drop the frame: no further listener of any kind sees it.
    StopAll,
}

/// Receives every frame not suppressed by a vetoable listener.
pub trait FrameListener: Send + Sync {
    fn handle_frame(&self, transport: &FrameTransport, frame: &Frame) -> Result<(), ListenerError>;
}

/// Receives frames first and may stop further dispatch.
pub trait VetoableFrameListener: Send + Sync {
    fn handle_frame(
        &self,
        transport: &FrameTransport,
        frame: &Frame,
    ) -> Result<VetoResult, ListenerError>;
}

/// Connection lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { error: Option<String> },
}

pub trait ConnectionListener: Send + Sync {
    fn connection_event(&self, transport: &FrameTransport, event: &ConnectionEvent);
}

/// Receives classified connection faults.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, kind: FaultKind, error: &ClientError) -> Result<(), ListenerError>;
}

/// Transport state as seen by [`FrameTransport::subscribe_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    NotConnected,
    Connected,
    Disconnected,
}

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub dispatch: DispatchMode,
    pub queue_capacity: usize,
    pub keep_alive: Option<Duration>,
    /// First outgoing sequence number; random when unset.
    pub initial_sequence: Option<u16>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for TransportOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            dispatch: config.dispatch,
            queue_capacity: config.queue_capacity.max(1),
            keep_alive: config.keep_alive(),
            initial_sequence: None,
        }
    }
}

enum Dispatch {
    Frame(Frame),
    Closed(Option<String>),
}

struct Outgoing {
    sequence: u16,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

struct Inner {
    name: String,
    options: TransportOptions,
    outgoing: Mutex<Outgoing>,
    vetoable: Registry<dyn VetoableFrameListener>,
    listeners: Registry<dyn FrameListener>,
    connection_listeners: Registry<dyn ConnectionListener>,
    error_handlers: Registry<dyn ErrorHandler>,
    attached: AtomicBool,
    disconnected: AtomicBool,
    state: watch::Sender<TransportState>,
    /// Reader and keep-alive tasks, aborted on disconnect. The writer and
    /// dispatch worker end on their own once their channels close.
    abortable: Mutex<Vec<JoinHandle<()>>>,
}

/// A framed duplex connection. Cloning yields another handle to the same
/// connection.
#[derive(Clone)]
pub struct FrameTransport {
    inner: Arc<Inner>,
}

impl FrameTransport {
    pub fn new(name: impl Into<String>, options: TransportOptions) -> Self {
        let sequence = options.initial_sequence.unwrap_or_else(random_sequence);
        let (state, _) = watch::channel(TransportState::NotConnected);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                outgoing: Mutex::new(Outgoing { sequence, tx: None }),
                vetoable: Registry::new(),
                listeners: Registry::new(),
                connection_listeners: Registry::new(),
                error_handlers: Registry::new(),
                attached: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
                state,
                abortable: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_vetoable_listener(&self, listener: Arc<dyn VetoableFrameListener>) {
        self.inner.vetoable.add(listener);
    }

    pub fn remove_vetoable_listener(&self, listener: &Arc<dyn VetoableFrameListener>) -> bool {
        self.inner.vetoable.remove(listener)
    }

    pub fn add_listener(&self, listener: Arc<dyn FrameListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn FrameListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.connection_listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.inner.connection_listeners.remove(listener)
    }

    pub fn add_error_handler(&self, handler: Arc<dyn ErrorHandler>) {
        self.inner.error_handlers.add(handler);
    }

    pub fn remove_error_handler(&self, handler: &Arc<dyn ErrorHandler>) -> bool {
        self.inner.error_handlers.remove(handler)
    }

    /// Starts the reader and writer tasks on `stream`.
    pub fn attach<S>(&self, stream: S) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.attached.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "transport already attached",
            )));
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.inner.outgoing.lock().tx = Some(out_tx);

        tokio::spawn(write_loop(self.clone(), write_half, out_rx));

        let queue = match self.inner.options.dispatch {
            DispatchMode::Inline => None,
            DispatchMode::Queued => {
                let (tx, rx) = mpsc::channel(self.inner.options.queue_capacity);
                tokio::spawn(dispatch_loop(self.clone(), rx));
                Some(tx)
            }
        };

        if let Some(interval) = self.inner.options.keep_alive {
            let task = tokio::spawn(keep_alive_loop(self.clone(), interval));
            self.inner.abortable.lock().push(task);
        }

        self.inner.state.send_replace(TransportState::Connected);
        tracing::debug!(transport = %self.inner.name, "Transport attached");
        self.fire_connection_event(&ConnectionEvent::Connected);

        // Reader last so no frame can be dispatched before the connected event
        let reader = tokio::spawn(read_loop(self.clone(), read_half, queue));
        if self.inner.disconnected.load(Ordering::SeqCst) {
            reader.abort();
        } else {
            self.inner.abortable.lock().push(reader);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == TransportState::Connected
    }

    /// Watches the transport state.
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the transport has disconnected.
    pub async fn closed(&self) {
        let mut state = self.subscribe_state();
        // Sender lives in `inner`, which `self` keeps alive
        let _ = state
            .wait_for(|s| *s == TransportState::Disconnected)
            .await;
    }

    /// Numbers and queues one frame. Returns the sequence number used.
    pub fn send_frame(&self, channel: Channel, payload: &[u8]) -> Result<u16, ClientError> {
        let mut outgoing = self.inner.outgoing.lock();
        let sequence = outgoing.sequence;
        let tx = outgoing.tx.as_ref().ok_or(ClientError::NotConnected)?;

        let encoded = match flapwire_protocol::Encoder::encode_frame(channel, sequence, payload) {
            Ok(encoded) => encoded,
            Err(e) => {
                drop(outgoing);
                let err = ClientError::Protocol(e);
                self.report_error(FaultKind::CommandGeneration, &err);
                return Err(err);
            }
        };

        tx.send(encoded.freeze())
            .map_err(|_| ClientError::ConnectionClosed)?;
        outgoing.sequence = sequence.wrapping_add(1);
        tracing::trace!(
            transport = %self.inner.name,
            channel = ?channel,
            sequence,
            len = payload.len(),
            "Frame queued"
        );
        Ok(sequence)
    }

    /// Closes the connection; queued outgoing frames are still flushed.
    pub fn close(&self) {
        self.handle_disconnect(None);
    }

    /// Delivers a fault to every error handler.
    pub fn report_error(&self, kind: FaultKind, error: &ClientError) {
        let handlers = self.inner.error_handlers.snapshot();
        if handlers.is_empty() {
            tracing::warn!(transport = %self.inner.name, %kind, "Unhandled fault: {}", error);
            return;
        }
        for handler in handlers.iter() {
            if let Err(e) = handler.handle_error(kind, error) {
                tracing::error!(
                    transport = %self.inner.name,
                    "Error handler failed while handling {} fault: {}",
                    kind,
                    e
                );
            }
        }
    }

    fn dispatch(&self, frame: &Frame) {
        if self.inner.disconnected.load(Ordering::SeqCst) {
            return;
        }
        for listener in self.inner.vetoable.snapshot().iter() {
            match listener.handle_frame(self, frame) {
                Ok(VetoResult::Continue) => {}
                Ok(VetoResult::StopListeners) => break,
                Ok(VetoResult::StopAll) => return,
                Err(e) => self.report_error(FaultKind::Listener, &ClientError::Listener(e.to_string())),
            }
        }
        for listener in self.inner.listeners.snapshot().iter() {
            if let Err(e) = listener.handle_frame(self, frame) {
                self.report_error(FaultKind::Listener, &ClientError::Listener(e.to_string()));
            }
        }
    }

    fn fire_connection_event(&self, event: &ConnectionEvent) {
        for listener in self.inner.connection_listeners.snapshot().iter() {
            listener.connection_event(self, event);
        }
    }

    fn handle_disconnect(&self, error: Option<String>) {
        if !self.inner.attached.load(Ordering::SeqCst)
            || self.inner.disconnected.swap(true, Ordering::SeqCst)
        {
            return;
        }
        // Dropping the sender lets the writer drain and shut down
        self.inner.outgoing.lock().tx = None;

        let tasks = std::mem::take(&mut *self.inner.abortable.lock());
        for task in tasks {
            task.abort();
        }

        match &error {
            Some(e) => tracing::info!(transport = %self.inner.name, "Disconnected: {}", e),
            None => tracing::info!(transport = %self.inner.name, "Disconnected"),
        }
        self.fire_connection_event(&ConnectionEvent::Disconnected { error });
        // Watchers wake only after listeners have seen the event
        self.inner.state.send_replace(TransportState::Disconnected);
    }
}

fn random_sequence() -> u16 {
    rand::random()
}

async fn read_loop<R>(
    transport: FrameTransport,
    mut reader: R,
    queue: Option<mpsc::Sender<Dispatch>>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = Decoder::new();
    let reason = 'read: loop {
        decoder.buffer_mut().reserve(4096);
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => break None,
            Ok(n) => tracing::trace!(transport = %transport.name(), "Read {} bytes", n),
            Err(e) => {
                let message = e.to_string();
                transport.report_error(FaultKind::Connection, &ClientError::Io(e));
                break Some(message);
            }
        }

        loop {
            match decoder.decode_frame() {
                Ok(Some(frame)) => match &queue {
                    Some(tx) => {
                        if tx.send(Dispatch::Frame(frame)).await.is_err() {
                            break 'read None;
                        }
                    }
                    None => transport.dispatch(&frame),
                },
                Ok(None) => break,
                Err(e) => {
                    let message = e.to_string();
                    transport.report_error(FaultKind::Connection, &ClientError::Protocol(e));
                    break 'read Some(message);
                }
            }
        }
    };

    match queue {
        // The worker reports the disconnect after the frames ahead of it
        Some(tx) => {
            if let Err(mpsc::error::SendError(Dispatch::Closed(reason))) =
                tx.send(Dispatch::Closed(reason)).await
            {
                transport.handle_disconnect(reason);
            }
        }
        None => transport.handle_disconnect(reason),
    }
}

async fn dispatch_loop(transport: FrameTransport, mut rx: mpsc::Receiver<Dispatch>) {
    while let Some(item) = rx.recv().await {
        match item {
            Dispatch::Frame(frame) => transport.dispatch(&frame),
            Dispatch::Closed(reason) => {
                transport.handle_disconnect(reason);
                break;
            }
        }
    }
}

async fn write_loop<W>(transport: FrameTransport, mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            let message = e.to_string();
            transport.report_error(FaultKind::Write, &ClientError::Io(e));
            transport.handle_disconnect(Some(message));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn keep_alive_loop(transport: FrameTransport, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if transport.send_frame(Channel::KEEP_ALIVE, &[]).is_err() {
            break;
        }
    }
}
