use derive_more::From;
use thiserror::Error;

use crate::addr::AddrError;
use crate::client::ClientError;
use crate::client::fake::FixtureError;
use crate::executor::ExecutorError;
use crate::pixit::PixitError;
use crate::proto::WireError;
use crate::session::SessionError;
use crate::stack::StackError;
use crate::synch::SynchError;
use crate::wid::WidError;

/// Errors returned when validating CLI backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("no IUT control address; pass --address or use --fake")]
    MissingAddress,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Top-level bridge error wrapping module-specific error types.
#[derive(Debug, Error, From)]
pub enum BridgeError {
    #[error(transparent)]
    #[from(AddrError, Box<AddrError>)]
    Addr(Box<AddrError>),
    #[error(transparent)]
    #[from(WireError, Box<WireError>)]
    Wire(Box<WireError>),
    #[error(transparent)]
    #[from(ClientError, Box<ClientError>)]
    Client(Box<ClientError>),
    #[error(transparent)]
    #[from(FixtureError, Box<FixtureError>)]
    Fixture(Box<FixtureError>),
    #[error(transparent)]
    #[from(StackError, Box<StackError>)]
    Stack(Box<StackError>),
    #[error(transparent)]
    #[from(SynchError, Box<SynchError>)]
    Synch(Box<SynchError>),
    #[error(transparent)]
    #[from(PixitError, Box<PixitError>)]
    Pixit(Box<PixitError>),
    #[error(transparent)]
    #[from(WidError, Box<WidError>)]
    Wid(Box<WidError>),
    #[error(transparent)]
    #[from(SessionError, Box<SessionError>)]
    Session(Box<SessionError>),
    #[error(transparent)]
    #[from(ExecutorError, Box<ExecutorError>)]
    Executor(Box<ExecutorError>),
}
