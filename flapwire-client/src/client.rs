//! High-level client API.

use crate::arbiter::{Service, ServiceArbiter, ServiceOpener};
use crate::config::Config;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::login::{self, parse_address};
use crate::mux::{response_channel, CommandListener, ReceivedCommand};
use crate::rate::OutboundRequest;
use crate::tls::TrustProvider;
use flapwire_protocol::{Command, CommandBody};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Default wait for a request's final response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Family listeners installed on every connection serving their family.
#[derive(Default)]
struct FamilyListeners {
    by_family: Mutex<HashMap<u16, Vec<Arc<dyn CommandListener>>>>,
    connections: Mutex<Vec<Connection>>,
}

impl FamilyListeners {
    fn add(&self, family: u16, listener: Arc<dyn CommandListener>) {
        self.by_family
            .lock()
            .entry(family)
            .or_default()
            .push(listener.clone());
        for connection in self.connections.lock().iter() {
            if connection.serves(family) {
                connection.mux().add_family_listener(family, listener.clone());
            }
        }
    }

    fn attach(&self, connection: &Connection) {
        for (family, listeners) in self.by_family.lock().iter() {
            if connection.serves(*family) {
                for listener in listeners {
                    connection.mux().add_family_listener(*family, listener.clone());
                }
            }
        }
        let mut connections = self.connections.lock();
        connections.retain(|c| c.is_connected());
        connections.push(connection.clone());
    }

    fn connections(&self) -> Vec<Connection> {
        self.connections.lock().clone()
    }
}

/// Opens services through BOS redirects.
struct RedirectOpener {
    arbiter: Weak<ServiceArbiter>,
    bos: Connection,
    config: Arc<Config>,
    trust: Option<Arc<dyn TrustProvider>>,
    listeners: Arc<FamilyListeners>,
}

impl RedirectOpener {
    async fn open(&self, family: u16) -> Result<Connection, ClientError> {
        let request = CommandBody::ServiceRequest { family }.into_command()?;
        let parts = self.bos.mux().request(request, self.config.login.timeout()).await?;
        let redirect = parts
            .iter()
            .find_map(|part| match &part.body {
                CommandBody::ServiceRedirect(redirect) => Some(redirect.clone()),
                _ => None,
            })
            .ok_or(ClientError::UnexpectedCommand {
                family: flapwire_protocol::family::SERVICE,
                subtype: parts.last().map_or(0, |p| p.command.subtype),
                context: "waiting for a service redirect",
            })?;

        let (host, port) = parse_address(&redirect.server, self.config.login.port);
        tracing::debug!(
            "Family {} redirected to {}:{}",
            flapwire_protocol::family::name(family),
            host,
            port
        );
        Connection::open(&self.config, &host, port, &redirect.cookie, self.trust.clone()).await
    }
}

impl ServiceOpener for RedirectOpener {
    fn open_service(&self, arbiter: &ServiceArbiter, family: u16) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                arbiter.service_failed(family, &ClientError::Listener(e.to_string()));
                return;
            }
        };
        let opener = RedirectOpener {
            arbiter: self.arbiter.clone(),
            bos: self.bos.clone(),
            config: self.config.clone(),
            trust: self.trust.clone(),
            listeners: self.listeners.clone(),
        };
        handle.spawn(async move {
            let result = opener.open(family).await;
            let Some(arbiter) = opener.arbiter.upgrade() else {
                return;
            };
            match result {
                Ok(connection) => {
                    opener.listeners.attach(&connection);
                    register_services(&arbiter, &connection, &[family]);
                }
                Err(e) => arbiter.service_failed(family, &e),
            }
        });
    }
}

/// Marks `families` ready on `connection` and finishes them when it closes.
fn register_services(arbiter: &Arc<ServiceArbiter>, connection: &Connection, families: &[u16]) {
    let services: Vec<Arc<Service>> = families
        .iter()
        .map(|&family| {
            Service::new(
                family,
                connection.name(),
                Arc::new(connection.scheduler().clone()),
            )
        })
        .collect();
    for service in &services {
        arbiter.service_ready(service.clone());
    }

    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let weak = Arc::downgrade(arbiter);
        let connection = connection.clone();
        handle.spawn(async move {
            connection.closed().await;
            if let Some(arbiter) = weak.upgrade() {
                for service in &services {
                    arbiter.service_finished(service);
                }
            }
        });
    }
}

/// A signed-on client.
pub struct Client {
    config: Arc<Config>,
    screen_name: String,
    bos: Connection,
    arbiter: Arc<ServiceArbiter>,
    listeners: Arc<FamilyListeners>,
}

impl Client {
    /// Signs on, connects to the BOS host and negotiates.
    pub async fn sign_on(
        config: Config,
        screen_name: &str,
        password: &str,
        trust: Option<Arc<dyn TrustProvider>>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let success = login::sign_on(&config, screen_name, password, trust.clone()).await?;
        let bos = Connection::open(
            &config,
            &success.bos_host,
            success.bos_port,
            &success.cookie,
            trust.clone(),
        )
        .await?;
        Ok(Self::with_connection(config, success.screen_name, bos, trust))
    }

    /// Builds a client around an already negotiated BOS connection.
    pub fn with_connection(
        config: Config,
        screen_name: impl Into<String>,
        bos: Connection,
        trust: Option<Arc<dyn TrustProvider>>,
    ) -> Self {
        let config = Arc::new(config);
        let listeners = Arc::new(FamilyListeners::default());
        let arbiter = Arc::new_cyclic(|weak| {
            ServiceArbiter::new(Arc::new(RedirectOpener {
                arbiter: weak.clone(),
                bos: bos.clone(),
                config: config.clone(),
                trust,
                listeners: listeners.clone(),
            }))
        });

        listeners.attach(&bos);
        let families = bos.negotiated().families.clone();
        register_services(&arbiter, &bos, &families);

        Self {
            config,
            screen_name: screen_name.into(),
            bos,
            arbiter,
            listeners,
        }
    }

    pub fn screen_name(&self) -> &str {
        &self.screen_name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The BOS connection.
    pub fn bos(&self) -> &Connection {
        &self.bos
    }

    pub fn arbiter(&self) -> &Arc<ServiceArbiter> {
        &self.arbiter
    }

    /// Returns whether the BOS connection is up.
    pub fn is_connected(&self) -> bool {
        self.bos.is_connected()
    }

    /// Registers a listener for unsolicited commands of `family` on every
    /// connection serving it, including ones opened later.
    pub fn add_family_listener(&self, family: u16, listener: Arc<dyn CommandListener>) {
        self.listeners.add(family, listener);
    }

    /// Queues a request with the service for its family, opening one if
    /// needed.
    pub fn send(&self, request: OutboundRequest) {
        self.arbiter.add_request(request);
    }

    /// Queues a command that expects no reply.
    pub fn send_command(&self, command: Command) {
        self.send(OutboundRequest::new(command));
    }

    /// Queues a command and waits for its full response.
    pub async fn request(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Vec<ReceivedCommand>, ClientError> {
        let (listener, rx) = response_channel();
        self.send(OutboundRequest::new(command).with_listener(listener));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Closes every connection and finishes every service.
    pub fn sign_off(&self) {
        tracing::info!("Signing off {}", self.screen_name);
        self.arbiter.finish_all();
        for connection in self.listeners.connections() {
            connection.close();
        }
        self.bos.close();
    }

    /// Resolves once the BOS connection has closed.
    pub async fn closed(&self) {
        self.bos.closed().await
    }
}
