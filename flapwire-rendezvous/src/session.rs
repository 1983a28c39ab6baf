//! Session driver: runs the controller for the current state and feeds the
//! results through [`transition`].

use crate::connect::{accept_peer, connect_direct, relay_initiate, relay_join};
use crate::error::{AttemptFailure, FailureReason, RendezvousError};
use crate::path::SourceFile;
use crate::state::{initial, transition, Controller, Input, Plan, RendezvousEvent, State};
use crate::timeout::{ConnectionType, Initiator, TimeoutPolicy};
use crate::transfer::{receive_files, send_files, PeerChannel, Progress, TransferControl, TransferOptions};
use flapwire_client::config::{ProxyConfig, RendezvousConfig};
use flapwire_client::Config;
use flapwire_protocol::rendezvous::{ConnectionInfo, FileSendInfo, CAP_SEND_FILE};
use flapwire_protocol::{Charset, Cookie, RendezvousBlock, RendezvousKind};
use serde::Serialize;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Carries rendezvous blocks to the peer, normally inside ICBMs.
pub trait Signaling: Send + Sync {
    fn send_block(&self, peer: &str, block: RendezvousBlock) -> Result<(), RendezvousError>;
}

/// Input to a running session from the application or the peer.
#[derive(Debug, Clone)]
pub enum Signal {
    Peer(RendezvousBlock),
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone)]
pub enum Direction {
    Send(Vec<SourceFile>),
    /// Destination directory.
    Receive(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Rendezvous(RendezvousEvent),
    Progress(Progress),
}

/// Who and what a session is about.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub peer: String,
    /// Our own screen name, presented to relays.
    pub screen_name: String,
    pub cookie: Cookie,
    pub direction: Direction,
    pub initiator: Initiator,
    /// Address advertised for direct connections.
    pub local_ip: Ipv4Addr,
    /// Our address as seen by the server, if known.
    pub verified_ip: Option<Ipv4Addr>,
    /// The peer's proposal, for sessions the buddy started.
    pub peer_info: ConnectionInfo,
}

struct StepOutcome {
    input: Input,
    stream: Option<TcpStream>,
}

impl StepOutcome {
    fn input(input: Input) -> Self {
        Self { input, stream: None }
    }

    fn connected(stream: TcpStream) -> Self {
        Self {
            input: Input::Connected,
            stream: Some(stream),
        }
    }

    fn failed(error: &RendezvousError) -> Self {
        Self::input(Input::AttemptFailed(error.attempt_failure()))
    }
}

type Step = Pin<Box<dyn Future<Output = StepOutcome> + Send>>;

struct Session {
    params: SessionParams,
    plan: Plan,
    policy: TimeoutPolicy,
    rendezvous: RendezvousConfig,
    proxy: ProxyConfig,
    options: TransferOptions,
    state: State,
    controller: Controller,
    deadline: Option<Instant>,
    peer_info: ConnectionInfo,
    request_index: u16,
    listener: Option<Arc<TcpListener>>,
    stream: Option<TcpStream>,
    signaling: Arc<dyn Signaling>,
    control: Arc<TransferControl>,
    signals: mpsc::UnboundedReceiver<Signal>,
    signals_open: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<State>,
}

/// Application handle to a running session.
pub struct SessionHandle {
    cookie: Cookie,
    peer: String,
    signals: mpsc::UnboundedSender<Signal>,
    state: watch::Receiver<State>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<State>,
}

impl SessionHandle {
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> State {
        self.state.borrow().clone()
    }

    /// Sender for routing peer blocks into the session.
    pub fn signals(&self) -> mpsc::UnboundedSender<Signal> {
        self.signals.clone()
    }

    pub fn pause(&self) {
        let _ = self.signals.send(Signal::Pause);
    }

    pub fn resume(&self) {
        let _ = self.signals.send(Signal::Resume);
    }

    pub fn cancel(&self) {
        let _ = self.signals.send(Signal::Cancel);
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Waits for the terminal state.
    pub async fn wait(self) -> State {
        match self.task.await {
            Ok(state) => state,
            Err(e) => State::Failed(FailureReason::Transfer(e.to_string())),
        }
    }
}

/// Starts a session on the current runtime.
pub async fn start(
    params: SessionParams,
    config: &Config,
    signaling: Arc<dyn Signaling>,
) -> Result<SessionHandle, RendezvousError> {
    let plan = Plan {
        initiator: params.initiator,
        connection_type: ConnectionType::for_peer(params.verified_ip, params.peer_info.verified_ip),
        allow_proxy: config.rendezvous.allow_proxy,
    };
    let listener = match plan.initiator {
        Initiator::Local => Some(Arc::new(TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?)),
        Initiator::Buddy => None,
    };

    let (state, controller) = initial(&plan);
    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(state.clone());

    let session = Session {
        peer_info: params.peer_info.clone(),
        request_index: params.peer_info.request_index.max(1),
        params: params.clone(),
        plan,
        policy: TimeoutPolicy::from_config(&config.rendezvous),
        rendezvous: config.rendezvous.clone(),
        proxy: config.proxy.clone(),
        options: TransferOptions::from_config(&config.rendezvous),
        state,
        controller,
        deadline: None,
        listener,
        stream: None,
        signaling,
        control: Arc::new(TransferControl::new()),
        signals: signals_rx,
        signals_open: true,
        events: events_tx,
        state_tx,
    };
    let task = tokio::spawn(session.run());

    Ok(SessionHandle {
        cookie: params.cookie,
        peer: params.peer,
        signals: signals_tx,
        state: state_rx,
        events: events_rx,
        task,
    })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(mut self) -> State {
        tracing::info!(
            peer = %self.params.peer,
            cookie = %self.params.cookie,
            initiator = ?self.plan.initiator,
            "Rendezvous session started"
        );
        if self.plan.initiator == Initiator::Buddy {
            let use_proxy = self.peer_info.use_proxy;
            self.apply(Input::PeerProposed { use_proxy });
        }

        while !self.state.is_terminal() {
            if self.control.is_cancelled() {
                self.apply(Input::Cancel);
                break;
            }

            let mut step = self.step();
            let outcome = loop {
                let deadline = self.deadline;
                tokio::select! {
                    outcome = &mut step => break Some(outcome),
                    _ = sleep_until(deadline) => {
                        break Some(StepOutcome::input(Input::AttemptFailed(AttemptFailure::TimedOut)))
                    }
                    signal = self.signals.recv(), if self.signals_open => match signal {
                        Some(signal) => {
                            if self.on_signal(signal) {
                                break None;
                            }
                        }
                        None => self.signals_open = false,
                    },
                }
            };

            if let Some(outcome) = outcome {
                if outcome.stream.is_some() {
                    self.stream = outcome.stream;
                }
                self.apply(outcome.input);
            }
        }

        self.release();
        tracing::info!(peer = %self.params.peer, state = self.state.name(), "Rendezvous session finished");
        self.state
    }

    /// Applies one input. Returns whether the controller changed, in which
    /// case the running step is abandoned.
    fn apply(&mut self, input: Input) -> bool {
        let t = transition(&self.plan, &self.state, self.controller, input);
        let restart = t.next_controller.is_some();
        let moved = t.next_state.is_some();
        if let Some(controller) = t.next_controller {
            self.controller = controller;
        }
        if let Some(state) = t.next_state {
            tracing::debug!(peer = %self.params.peer, "{} -> {}", self.state.name(), state.name());
            self.state = state;
            self.state_tx.send_replace(self.state.clone());
        }
        if restart || moved {
            self.deadline = self.deadline_for().map(|d| Instant::now() + d);
        }
        if let Some(event) = t.event {
            if matches!(event, RendezvousEvent::Cancelled { by_peer: false } | RendezvousEvent::Failed(_)) {
                self.notify_peer(RendezvousKind::Cancel);
            }
            let _ = self.events.send(SessionEvent::Rendezvous(event));
        }
        restart
    }

    fn deadline_for(&self) -> Option<std::time::Duration> {
        let initiator = self.plan.initiator;
        match (&self.state, self.controller) {
            (State::AwaitingPeerAck, _) => Some(self.policy.ack()),
            (State::AttemptingDirect(kind), Controller::Listen | Controller::ConnectOut) => {
                Some(self.policy.connect(*kind, initiator))
            }
            (State::AttemptingProxy, _) => Some(self.policy.connect(ConnectionType::Proxy, initiator)),
            _ => None,
        }
    }

    fn on_signal(&mut self, signal: Signal) -> bool {
        match signal {
            Signal::Pause => {
                let restart = self.apply(Input::Pause);
                if self.state == State::Paused {
                    self.control.pause();
                }
                restart
            }
            Signal::Resume => {
                let restart = self.apply(Input::Resume);
                if self.state == State::Transferring {
                    self.control.resume();
                }
                restart
            }
            Signal::Cancel => {
                self.control.cancel();
                self.apply(Input::Cancel)
            }
            Signal::Peer(block) => {
                if block.cookie != self.params.cookie {
                    tracing::debug!(peer = %self.params.peer, "Ignoring block for cookie {}", block.cookie);
                    return false;
                }
                match block.kind {
                    RendezvousKind::Accept => self.apply(Input::PeerAccepted),
                    RendezvousKind::Cancel => {
                        self.control.cancel();
                        self.apply(Input::PeerCancelled)
                    }
                    RendezvousKind::Propose => {
                        let info = block.connection_info();
                        let use_proxy = info.use_proxy;
                        self.request_index = self.request_index.max(info.request_index);
                        self.peer_info = info;
                        self.apply(Input::PeerProposed { use_proxy })
                    }
                }
            }
        }
    }

    fn notify_peer(&self, kind: RendezvousKind) {
        let block = RendezvousBlock::new(kind, self.params.cookie, CAP_SEND_FILE);
        if let Err(e) = self.signaling.send_block(&self.params.peer, block) {
            tracing::warn!(peer = %self.params.peer, "Could not signal peer: {}", e);
        }
    }

    fn proposal(&self) -> Result<RendezvousBlock, RendezvousError> {
        let port = match &self.listener {
            Some(listener) => listener.local_addr()?.port(),
            None => 0,
        };
        let info = ConnectionInfo {
            request_index: 1,
            client_ip: Some(self.params.local_ip),
            verified_ip: self.params.verified_ip,
            proxy_ip: None,
            port: Some(port),
            use_proxy: false,
        };
        let mut block = RendezvousBlock::propose(self.params.cookie, CAP_SEND_FILE, &info);
        if let Direction::Send(files) = &self.params.direction {
            let info = FileSendInfo {
                multiple: files.len() > 1,
                file_count: files.len() as u16,
                total_size: files.iter().map(|f| f.size).sum::<u64>().min(u32::MAX as u64) as u32,
                filename: files.first().map(|f| f.name.clone()).unwrap_or_default(),
            };
            block = block.with_file_info(&info, Charset::Utf8);
        }
        Ok(block)
    }

    /// Builds the future for the current controller. It owns everything it
    /// touches so it can run while signals are handled.
    fn step(&mut self) -> Step {
        let peer = self.params.peer.clone();
        let screen_name = self.params.screen_name.clone();
        let cookie = self.params.cookie;
        let signaling = self.signaling.clone();
        let proxy = self.proxy.clone();
        let timeout = self.deadline_for().unwrap_or(self.policy.proxy);

        match self.controller {
            Controller::Propose => {
                let proposal = self.proposal();
                Box::pin(async move {
                    match proposal.and_then(|block| signaling.send_block(&peer, block)) {
                        Ok(()) => StepOutcome::input(Input::ProposalSent),
                        Err(e) => StepOutcome::failed(&e),
                    }
                })
            }
            Controller::Listen => match self.listener.clone() {
                Some(listener) => Box::pin(async move {
                    match accept_peer(&listener).await {
                        Ok(stream) => StepOutcome::connected(stream),
                        Err(e) => StepOutcome::failed(&e),
                    }
                }),
                None => Box::pin(async { StepOutcome::failed(&RendezvousError::SessionClosed) }),
            },
            Controller::ConnectOut => {
                let info = self.peer_info.clone();
                Box::pin(async move {
                    let result = async {
                        let stream = connect_direct(&proxy, &info, timeout).await?;
                        signaling.send_block(&peer, RendezvousBlock::new(RendezvousKind::Accept, cookie, CAP_SEND_FILE))?;
                        Ok::<_, RendezvousError>(stream)
                    }
                    .await;
                    match result {
                        Ok(stream) => StepOutcome::connected(stream),
                        Err(e) => StepOutcome::failed(&e),
                    }
                })
            }
            Controller::ProxyInitiate => {
                self.request_index = self.request_index.saturating_add(1);
                let request_index = self.request_index;
                let relay_host = self.rendezvous.relay_host.clone();
                let relay_port = self.rendezvous.relay_port;
                Box::pin(async move {
                    let result = async {
                        let relay =
                            relay_initiate(&proxy, &relay_host, relay_port, &screen_name, cookie, CAP_SEND_FILE, timeout)
                                .await?;
                        let info = ConnectionInfo {
                            request_index,
                            proxy_ip: Some(relay.ip),
                            port: Some(relay.port),
                            use_proxy: true,
                            ..Default::default()
                        };
                        signaling.send_block(&peer, RendezvousBlock::propose(cookie, CAP_SEND_FILE, &info))?;
                        let stream = relay.ready().await?;
                        Ok::<_, RendezvousError>(stream)
                    }
                    .await;
                    match result {
                        Ok(stream) => StepOutcome::connected(stream),
                        Err(e) => StepOutcome::failed(&e),
                    }
                })
            }
            Controller::ProxyJoin => {
                let info = self.peer_info.clone();
                let relay_port = self.rendezvous.relay_port;
                Box::pin(async move {
                    let result = async {
                        let relay_ip = info
                            .proxy_ip
                            .or(info.verified_ip)
                            .ok_or(flapwire_protocol::ProtocolError::MissingField("relay address"))?;
                        let session_port = info
                            .port
                            .ok_or(flapwire_protocol::ProtocolError::MissingField("relay port"))?;
                        let stream = relay_join(
                            &proxy,
                            relay_ip,
                            relay_port,
                            session_port,
                            &screen_name,
                            cookie,
                            CAP_SEND_FILE,
                            timeout,
                        )
                        .await?;
                        signaling.send_block(&peer, RendezvousBlock::new(RendezvousKind::Accept, cookie, CAP_SEND_FILE))?;
                        Ok::<_, RendezvousError>(stream)
                    }
                    .await;
                    match result {
                        Ok(stream) => StepOutcome::connected(stream),
                        Err(e) => StepOutcome::failed(&e),
                    }
                })
            }
            Controller::Transfer => match self.stream.take() {
                Some(stream) => {
                    let direction = self.params.direction.clone();
                    let control = self.control.clone();
                    let options = self.options;
                    let events = self.events.clone();
                    Box::pin(async move {
                        let mut channel = PeerChannel::new(stream, options.stall_timeout, control);
                        let report = |p: &Progress| {
                            let _ = events.send(SessionEvent::Progress(p.clone()));
                        };
                        let result = match direction {
                            Direction::Send(files) => {
                                send_files(&mut channel, cookie, &files, options.chunk_size, report)
                                    .await
                                    .map(|_| ())
                            }
                            Direction::Receive(dest) => {
                                receive_files(&mut channel, &dest, options.chunk_size, report)
                                    .await
                                    .map(|_| ())
                            }
                        };
                        match result {
                            Ok(()) => StepOutcome::input(Input::TransferFinished),
                            Err(RendezvousError::Cancelled) => StepOutcome::input(Input::Cancel),
                            Err(e) => {
                                tracing::warn!("Transfer failed: {}", e);
                                StepOutcome::input(Input::TransferFailed(e.failure_reason()))
                            }
                        }
                    })
                }
                None => Box::pin(async {
                    StepOutcome::input(Input::TransferFailed(FailureReason::Transfer(
                        "no peer stream".to_string(),
                    )))
                }),
            },
            Controller::Idle => Box::pin(std::future::pending::<StepOutcome>()),
        }
    }

    fn release(&mut self) {
        self.control.cancel();
        self.stream = None;
        self.listener = None;
        self.deadline = None;
    }
}
