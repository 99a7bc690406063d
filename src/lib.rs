mod addr;
mod app;
mod cli;
mod client;
mod error;
mod executor;
mod pixit;
mod proto;
mod session;
mod stack;
mod synch;
mod telemetry;
mod wid;

pub use addr::{AddrError, AddrType, DeviceAddr, PeerAddr};
pub use app::run;
pub use cli::{
    Args, Backend, CatalogArgs, Command, FakeArgs, LogLevel, OutputFormat, PixitArgs, RunArgs,
    RunOptions,
};
pub use client::fake::{FakeIutConfig, FixtureError, FoundFixture, FoundRecord, spawn_fake_iut};
pub use client::transport::{Transport, connect_tcp, duplex_pair};
pub use client::{ClientConfig, ClientError, CommandClient, DEFAULT_COMMAND_DEADLINE, EventStream};
pub use error::BridgeError;
pub use executor::{
    Action, ActionFuture, Barrier, CaseReport, Executor, ExecutorError, Phase, RolePlan, RoleRun,
    RunReport, RunSummary, TestCase, Verdict, catalog, interaction, quiesce_radio, rendezvous_at,
    target_peer_from_pixit,
};
pub use pixit::{PixitError, PixitStore, Profile, SharedPixit};
pub use proto::{
    CONTROLLER_INDEX, Connect, ControllerInfo, CoreEvent, CoreOp, DeviceConnected,
    DeviceDisconnected, DeviceFound, Disconnect, DiscoverableMode, DiscoveryFlags, EVENT_BIT,
    Frame, FrameCodec, FrameReadError, GapEvent, GapEventId, GapOp, GattOp, MeshInit, MeshOp, Pair,
    PasskeyDisplay, PasskeyEntry, ReadCharacteristic, ReadControllerInfo, ReadValue,
    RegisterService, STATUS_OPCODE, Service, SetConnectable, SetDiscoverable, Settings,
    SignedWrite, StartAdvertising, StartDiscovery, Status, StopAdvertising, StopDiscovery, Unpair,
    UnregisterService, WireError,
};
pub use session::{FakeSessionFactory, RoleSession, SessionError, SessionFactory, TcpSessionFactory};
pub use stack::{
    AD_PAYLOAD_BUDGET, AdStore, AdType, Connection, ControllerIdentity, DeviceStack, DiscoveryLog,
    FoundDevice, GapState, MeshState, PairingState, SharedStack, StackError,
};
pub use synch::{DEFAULT_ARRIVAL_DEADLINE, Rendezvous, Role, SynchError};
pub use wid::gap::gap_table;
pub use wid::{WidContext, WidError, WidgetDispatcher, WidgetId, WidgetRegistry, WidgetReply};
