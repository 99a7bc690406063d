//! Per-role wiring of one control connection.
//!
//! A [`RoleSession`] owns everything one role needs during a case: the
//! command client, the mirrored device state, its PIXIT store and the
//! prompt dispatcher, plus a background pump that reflects unsolicited
//! events into the state model. A [`SessionFactory`] opens one session per
//! role; what roles share (the rendezvous registry, client tunables) lives
//! in the factory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::client::fake::{FakeIutConfig, spawn_fake_iut};
use crate::client::{ClientConfig, ClientError, CommandClient, EventStream, transport};
use crate::pixit::{PixitStore, Profile, SharedPixit};
use crate::proto::{CoreEvent, GapEvent, GapEventId, ReadControllerInfo, RegisterService, Service};
use crate::stack::{ControllerIdentity, SharedStack};
use crate::synch::{Rendezvous, Role};
use crate::wid::gap::gap_table;
use crate::wid::{WidContext, WidError, WidgetDispatcher, WidgetId, WidgetRegistry, WidgetReply};

/// How long to wait for the IUT's ready announcement before proceeding
/// without it.
const READY_GRACE: Duration = Duration::from_secs(5);

/// Errors opening or bootstrapping a role's session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The factory has no IUT address to connect to.
    #[error("no IUT address configured")]
    NoAddress,
    /// The IUT control socket could not be reached.
    #[error("could not reach the IUT at {address}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Wid(#[from] WidError),
}

/// One role's live connection and state for the duration of a case.
pub struct RoleSession {
    role: Role,
    client: CommandClient,
    stack: SharedStack,
    pixit: SharedPixit,
    synch: Rendezvous,
    dispatcher: WidgetDispatcher,
    ready: Option<EventStream>,
    pump: Option<JoinHandle<()>>,
}

impl RoleSession {
    /// Wires a session over an already-connected client.
    ///
    /// Subscriptions for the ready announcement and the event pump are
    /// taken out immediately so no early event is lost.
    #[must_use]
    pub fn new(
        role: Role,
        client: CommandClient,
        registry: WidgetRegistry,
        pixit: PixitStore,
        synch: Rendezvous,
    ) -> Self {
        let stack = SharedStack::new();
        let pixit = SharedPixit::new(pixit);
        let ready = client.subscribe(CoreEvent::IutReady);
        let pump = spawn_event_pump(&client, stack.clone());
        let context = WidContext {
            role: role.clone(),
            client: client.clone(),
            stack: stack.clone(),
            pixit: pixit.clone(),
            synch: synch.clone(),
        };
        Self {
            role,
            client,
            stack,
            pixit,
            synch,
            dispatcher: WidgetDispatcher::new(registry, context),
            ready: Some(ready),
            pump: Some(pump),
        }
    }

    #[must_use]
    pub fn role(&self) -> &Role {
        &self.role
    }

    #[must_use]
    pub fn client(&self) -> &CommandClient {
        &self.client
    }

    #[must_use]
    pub fn stack(&self) -> &SharedStack {
        &self.stack
    }

    #[must_use]
    pub fn pixit(&self) -> &SharedPixit {
        &self.pixit
    }

    #[must_use]
    pub fn rendezvous(&self) -> &Rendezvous {
        &self.synch
    }

    /// Brings the connection to a case-ready state.
    ///
    /// Waits for the ready announcement, registers the profile's services,
    /// reads the controller identity into the state model and writes the
    /// address back into the PIXIT set.
    #[instrument(skip(self), fields(role = %self.role))]
    pub async fn bootstrap(&mut self, profile: Profile) -> Result<(), SessionError> {
        self.wait_ready().await;

        self.client
            .send(&RegisterService {
                service: Service::Gap,
            })
            .await?;
        if profile == Profile::Mesh {
            self.client
                .send(&RegisterService {
                    service: Service::Mesh,
                })
                .await?;
        }

        let info = self.client.send(&ReadControllerInfo).await?;
        info!(addr = %info.addr, name = %info.name, "controller identified");
        let addr_hex = info.addr.to_string();
        self.stack.with(|stack| {
            stack.gap.identity = Some(ControllerIdentity {
                addr: info.addr,
                name: info.name.clone(),
                supported_settings: info.supported_settings,
                current_settings: info.current_settings,
            });
        });
        self.pixit
            .with(|pixit| pixit.set("TSPX_bd_addr_iut", addr_hex));
        Ok(())
    }

    /// Answers one tester prompt.
    pub async fn answer(&self, wid: WidgetId, description: &str) -> WidgetReply {
        self.dispatcher.dispatch(wid, description).await
    }

    /// Returns the mirrored device state to power-on defaults.
    pub fn reset(&self) {
        self.stack.reset();
    }

    /// Stops the connection reader and drains the event pump.
    pub async fn close(mut self) {
        self.client.close().await;
        if let Some(pump) = self.pump.take()
            && pump.await.is_err()
        {
            warn!(role = %self.role, "event pump ended by panic");
        }
    }

    async fn wait_ready(&mut self) {
        let Some(mut ready) = self.ready.take() else {
            return;
        };
        match timeout(READY_GRACE, ready.next()).await {
            Ok(Some(_announcement)) => debug!("IUT ready"),
            Ok(None) => warn!("connection closed before the ready announcement"),
            Err(_elapsed) => warn!("no ready announcement; proceeding"),
        }
    }
}

/// Mirrors unsolicited GAP events into the shared state model.
fn spawn_event_pump(client: &CommandClient, stack: SharedStack) -> JoinHandle<()> {
    let mut found = client.subscribe(GapEventId::DeviceFound);
    let mut connected = client.subscribe(GapEventId::Connected);
    let mut disconnected = client.subscribe(GapEventId::Disconnected);
    let mut passkey = client.subscribe(GapEventId::PasskeyDisplay);
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = found.next() => frame,
                Some(frame) = connected.next() => frame,
                Some(frame) = disconnected.next() => frame,
                Some(frame) = passkey.next() => frame,
                else => break,
            };
            match GapEvent::decode(frame.opcode, &frame.payload) {
                Ok(Some(event)) => stack.with(|stack| stack.gap.apply_event(&event)),
                Ok(None) => {}
                Err(error) => warn!(%error, "unparseable event left unmirrored"),
            }
        }
        debug!("event pump drained");
    })
}

/// Opens one session per role of a case.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Opens and wires an independent session for `role`.
    async fn open(&self, role: &Role) -> Result<RoleSession, SessionError>;

    /// The rendezvous registry shared by every session this factory opens.
    fn rendezvous(&self) -> Rendezvous;
}

/// Connects sessions to real IUT control sockets, cycling through the
/// configured addresses one per opened role.
pub struct TcpSessionFactory {
    addresses: Vec<String>,
    profile: Profile,
    client_config: ClientConfig,
    synch: Rendezvous,
    next: AtomicUsize,
}

impl TcpSessionFactory {
    #[must_use]
    pub fn new(
        addresses: Vec<String>,
        profile: Profile,
        client_config: ClientConfig,
        synch: Rendezvous,
    ) -> Self {
        Self {
            addresses,
            profile,
            client_config,
            synch,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    async fn open(&self, role: &Role) -> Result<RoleSession, SessionError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        let Some(address) = self
            .addresses
            .get(index % self.addresses.len().max(1))
            .cloned()
        else {
            return Err(SessionError::NoAddress);
        };

        let stream = transport::connect_tcp(address.as_str())
            .await
            .map_err(|source| SessionError::Connect {
                address: address.clone(),
                source,
            })?;
        info!(%role, %address, "control connection open");
        let client = CommandClient::spawn(stream, self.client_config.clone());
        Ok(RoleSession::new(
            role.clone(),
            client,
            gap_table()?,
            PixitStore::for_profile(self.profile),
            self.synch.clone(),
        ))
    }

    fn rendezvous(&self) -> Rendezvous {
        self.synch.clone()
    }
}

/// Spawns an in-process scripted IUT for every opened role.
pub struct FakeSessionFactory {
    config: FakeIutConfig,
    profile: Profile,
    client_config: ClientConfig,
    synch: Rendezvous,
}

impl FakeSessionFactory {
    #[must_use]
    pub fn new(
        config: FakeIutConfig,
        profile: Profile,
        client_config: ClientConfig,
        synch: Rendezvous,
    ) -> Self {
        Self {
            config,
            profile,
            client_config,
            synch,
        }
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn open(&self, role: &Role) -> Result<RoleSession, SessionError> {
        debug!(%role, "scripted IUT attached");
        let transport = spawn_fake_iut(self.config.clone());
        let client = CommandClient::spawn(transport, self.client_config.clone());
        Ok(RoleSession::new(
            role.clone(),
            client,
            gap_table()?,
            PixitStore::for_profile(self.profile),
            self.synch.clone(),
        ))
    }

    fn rendezvous(&self) -> Rendezvous {
        self.synch.clone()
    }
}
