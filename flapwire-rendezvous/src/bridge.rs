//! Glue between a signed-on [`Client`] and rendezvous sessions.
//!
//! Outgoing blocks ride in ICBMs on the rendezvous channel. Incoming blocks
//! are routed to the session owning their cookie; proposals with an unknown
//! cookie are surfaced to the application as [`IncomingProposal`]s.

use crate::error::RendezvousError;
use crate::path::collect_files;
use crate::session::{start, Direction, SessionHandle, SessionParams, Signal, Signaling};
use crate::timeout::Initiator;
use dashmap::DashMap;
use flapwire_client::mux::{CommandListener, CommandMultiplexer, ReceivedCommand};
use flapwire_client::{Client, Config, ListenerError};
use flapwire_protocol::rendezvous::{FileSendInfo, IncomingIcbm, OutgoingIcbm, CAP_SEND_FILE, RENDEZVOUS_CHANNEL};
use flapwire_protocol::{family, CommandBody, Cookie, RendezvousBlock, RendezvousKind};
use parking_lot::RwLock;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Sends rendezvous blocks as ICBMs through the client.
pub struct IcbmSignaling {
    client: Arc<Client>,
}

impl IcbmSignaling {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

impl Signaling for IcbmSignaling {
    fn send_block(&self, peer: &str, block: RendezvousBlock) -> Result<(), RendezvousError> {
        if !self.client.is_connected() {
            return Err(RendezvousError::SessionClosed);
        }
        let icbm = OutgoingIcbm::rendezvous(peer, &block)?;
        let command = CommandBody::OutgoingIcbm(icbm).into_command()?;
        self.client.send_command(command);
        Ok(())
    }
}

/// A transfer a buddy offered us.
#[derive(Debug, Clone)]
pub struct IncomingProposal {
    pub sender: String,
    pub block: RendezvousBlock,
}

impl IncomingProposal {
    pub fn cookie(&self) -> Cookie {
        self.block.cookie
    }

    pub fn file_info(&self) -> Option<FileSendInfo> {
        self.block.file_info()
    }
}

pub struct RendezvousBridge {
    screen_name: String,
    config: Arc<Config>,
    signaling: Arc<dyn Signaling>,
    sessions: DashMap<Cookie, mpsc::UnboundedSender<Signal>>,
    proposals: mpsc::UnboundedSender<IncomingProposal>,
    local_ip: RwLock<Option<Ipv4Addr>>,
    verified_ip: RwLock<Option<Ipv4Addr>>,
}

struct BridgeHook(Weak<RendezvousBridge>);

impl CommandListener for BridgeHook {
    fn handle_command(&self, _mux: &CommandMultiplexer, command: &ReceivedCommand) -> Result<(), ListenerError> {
        if let (Some(bridge), CommandBody::IncomingIcbm(icbm)) = (self.0.upgrade(), &command.body) {
            bridge.handle_icbm(icbm);
        }
        Ok(())
    }
}

impl RendezvousBridge {
    pub fn new(
        screen_name: impl Into<String>,
        config: Arc<Config>,
        signaling: Arc<dyn Signaling>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<IncomingProposal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(Self {
            screen_name: screen_name.into(),
            config,
            signaling,
            sessions: DashMap::new(),
            proposals: tx,
            local_ip: RwLock::new(None),
            verified_ip: RwLock::new(None),
        });
        (bridge, rx)
    }

    /// Creates a bridge that signals through `client` and listens to its
    /// incoming messages.
    pub fn attach(client: Arc<Client>) -> (Arc<Self>, mpsc::UnboundedReceiver<IncomingProposal>) {
        let (bridge, rx) = Self::new(
            client.screen_name(),
            Arc::new(client.config().clone()),
            Arc::new(IcbmSignaling::new(client.clone())),
        );
        client.add_family_listener(family::ICBM, Arc::new(BridgeHook(Arc::downgrade(&bridge))));
        (bridge, rx)
    }

    /// Overrides the address advertised for direct connections.
    pub fn set_local_ip(&self, ip: Ipv4Addr) {
        *self.local_ip.write() = Some(ip);
    }

    /// Records our address as the server sees it.
    pub fn set_verified_ip(&self, ip: Option<Ipv4Addr>) {
        *self.verified_ip.write() = ip;
    }

    pub fn verified_ip(&self) -> Option<Ipv4Addr> {
        *self.verified_ip.read()
    }

    pub fn active_sessions(&self) -> usize {
        self.prune();
        self.sessions.len()
    }

    /// Offers `path` (a file or a folder) to `peer`.
    pub async fn send_files(
        &self,
        peer: &str,
        path: &Path,
        folder_name: Option<&str>,
    ) -> Result<SessionHandle, RendezvousError> {
        let files = collect_files(path, folder_name)?;
        if files.is_empty() {
            return Err(RendezvousError::invalid_path(path, "contains no files"));
        }
        tracing::info!("Offering {} file(s) to {}", files.len(), peer);
        self.launch(peer, Cookie::random(), Direction::Send(files), Initiator::Local, Default::default())
            .await
    }

    /// Accepts a proposal, receiving into `dest`.
    pub async fn accept(&self, proposal: IncomingProposal, dest: PathBuf) -> Result<SessionHandle, RendezvousError> {
        std::fs::create_dir_all(&dest)?;
        let info = proposal.block.connection_info();
        self.launch(
            &proposal.sender,
            proposal.block.cookie,
            Direction::Receive(dest),
            Initiator::Buddy,
            info,
        )
        .await
    }

    pub fn decline(&self, proposal: &IncomingProposal) -> Result<(), RendezvousError> {
        tracing::info!("Declining transfer {} from {}", proposal.block.cookie, proposal.sender);
        let block = RendezvousBlock::new(RendezvousKind::Cancel, proposal.block.cookie, CAP_SEND_FILE);
        self.signaling.send_block(&proposal.sender, block)
    }

    async fn launch(
        &self,
        peer: &str,
        cookie: Cookie,
        direction: Direction,
        initiator: Initiator,
        peer_info: flapwire_protocol::rendezvous::ConnectionInfo,
    ) -> Result<SessionHandle, RendezvousError> {
        let params = SessionParams {
            peer: peer.to_string(),
            screen_name: self.screen_name.clone(),
            cookie,
            direction,
            initiator,
            local_ip: self.local_ip().await,
            verified_ip: self.verified_ip(),
            peer_info,
        };
        let handle = start(params, &self.config, self.signaling.clone()).await?;
        self.prune();
        self.sessions.insert(cookie, handle.signals());
        Ok(handle)
    }

    async fn local_ip(&self) -> Ipv4Addr {
        let cached = *self.local_ip.read();
        if let Some(ip) = cached {
            return ip;
        }
        let rendezvous = &self.config.rendezvous;
        match probe_local_ip(&rendezvous.relay_host, rendezvous.relay_port).await {
            Ok(ip) => {
                *self.local_ip.write() = Some(ip);
                ip
            }
            Err(e) => {
                tracing::warn!("Could not determine local address: {}", e);
                Ipv4Addr::LOCALHOST
            }
        }
    }

    fn prune(&self) {
        self.sessions.retain(|_, tx| !tx.is_closed());
    }

    /// Routes a block received from `sender`.
    pub fn route(&self, sender: &str, block: RendezvousBlock) {
        let cookie = block.cookie;
        let session = self.sessions.get(&cookie).map(|tx| tx.clone());
        match session {
            Some(tx) if !tx.is_closed() => {
                let _ = tx.send(Signal::Peer(block));
                return;
            }
            Some(_) => {
                self.sessions.remove(&cookie);
            }
            None => {}
        }

        match block.kind {
            RendezvousKind::Propose if block.capability == CAP_SEND_FILE => {
                tracing::info!("Transfer {} proposed by {}", cookie, sender);
                let _ = self.proposals.send(IncomingProposal {
                    sender: sender.to_string(),
                    block,
                });
            }
            kind => tracing::debug!("Dropping {:?} for unknown session {} from {}", kind, cookie, sender),
        }
    }

    /// Extracts and routes the rendezvous block an ICBM carries, if any.
    pub fn handle_icbm(&self, icbm: &IncomingIcbm) {
        if icbm.channel != RENDEZVOUS_CHANNEL {
            return;
        }
        match icbm.rendezvous_block() {
            Some(Ok(block)) => self.route(&icbm.sender, block),
            Some(Err(e)) => tracing::warn!("Malformed rendezvous block from {}: {}", icbm.sender, e),
            None => {}
        }
    }
}

/// Finds the address the OS would use to reach `host`. Nothing is sent.
async fn probe_local_ip(host: &str, port: u16) -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((host, port)).await?;
    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no IPv4 route ({})", other),
        )),
    }
}
