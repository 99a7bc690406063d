pub(crate) mod describe;
pub(crate) mod gap;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::addr::AddrError;
use crate::client::{ClientError, CommandClient};
use crate::pixit::{PixitError, SharedPixit};
use crate::proto::WireError;
use crate::stack::{SharedStack, StackError};
use crate::synch::{Rendezvous, Role, SynchError};

/// Numeric identifier of one tester interaction request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::From,
)]
pub struct WidgetId(u16);

impl WidgetId {
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u16 {
        self.0
    }
}

/// Reply shapes the tester accepts.
///
/// Every internal failure collapses to [`WidgetReply::Deny`] at the
/// dispatch boundary; the tester always receives a well-typed answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetReply {
    /// Positive confirmation.
    Confirm,
    /// Negative confirmation, also the failure shape.
    Deny,
    /// Numeric answer, e.g. a displayed passkey.
    Number(u64),
    /// Textual answer, e.g. a hex-formatted attribute handle.
    Text(String),
    /// The prompt needs no answer; the tester proceeds on its own.
    NoReply,
}

impl WidgetReply {
    #[must_use]
    pub fn is_positive(&self) -> bool {
        !matches!(self, Self::Deny)
    }
}

/// Errors raised inside widget handlers and at registration.
#[derive(Debug, Error)]
pub enum WidError {
    /// No handler is bound to the requested wid.
    #[error("no handler registered for wid {wid}")]
    UnknownWidget { wid: WidgetId },
    /// A handler table bound the same wid twice; a configuration error
    /// caught at build time.
    #[error("wid {wid} is already registered")]
    DuplicateWidget { wid: WidgetId },
    /// The prompt description did not carry what the handler needs.
    #[error("description did not contain {expected}")]
    Description { expected: &'static str },
    /// The awaited event never arrived inside the window.
    #[error("no {what} event within {waited}", waited = humantime::format_duration(*window))]
    EventWindowElapsed {
        what: &'static str,
        window: std::time::Duration,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error(transparent)]
    Synch(#[from] SynchError),
    #[error(transparent)]
    Pixit(#[from] PixitError),
    #[error(transparent)]
    Addr(#[from] AddrError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Everything a handler may touch. Cheap to clone; one per dispatch.
#[derive(Clone)]
pub struct WidContext {
    pub role: Role,
    pub client: CommandClient,
    pub stack: SharedStack,
    pub pixit: SharedPixit,
    pub synch: Rendezvous,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<WidgetReply, WidError>> + Send>>;
type Handler = Arc<dyn Fn(WidContext, String) -> HandlerFuture + Send + Sync>;

/// Immutable wid-to-handler table, built once per profile.
#[derive(Clone, Default)]
pub struct WidgetRegistry {
    handlers: HashMap<WidgetId, Handler>,
}

impl WidgetRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a handler to a wid.
    ///
    /// # Errors
    ///
    /// Returns [`WidError::DuplicateWidget`] when the wid is already bound.
    pub fn register<F, Fut>(&mut self, wid: impl Into<WidgetId>, handler: F) -> Result<(), WidError>
    where
        F: Fn(WidContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WidgetReply, WidError>> + Send + 'static,
    {
        let wid = wid.into();
        if self.handlers.contains_key(&wid) {
            return Err(WidError::DuplicateWidget { wid });
        }
        self.handlers
            .insert(wid, Arc::new(move |context, description| {
                Box::pin(handler(context, description))
            }));
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, wid: WidgetId) -> bool {
        self.handlers.contains_key(&wid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered wids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<WidgetId> {
        let mut ids: Vec<WidgetId> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Routes interaction requests to handlers.
///
/// Failures never cross the dispatch boundary: an unknown wid or a handler
/// error is logged and answered with [`WidgetReply::Deny`]. No lock is held
/// across a handler invocation, so a second dispatch may run while one
/// handler is blocked on a send or a rendezvous.
#[derive(Clone)]
pub struct WidgetDispatcher {
    registry: Arc<WidgetRegistry>,
    context: WidContext,
}

impl WidgetDispatcher {
    #[must_use]
    pub fn new(registry: WidgetRegistry, context: WidContext) -> Self {
        Self {
            registry: Arc::new(registry),
            context,
        }
    }

    #[must_use]
    pub fn context(&self) -> &WidContext {
        &self.context
    }

    /// Resolves and runs the handler for one interaction request.
    #[instrument(
        skip(self, description),
        level = "debug",
        fields(role = %self.context.role, wid = %wid)
    )]
    pub async fn dispatch(&self, wid: WidgetId, description: &str) -> WidgetReply {
        debug!(description, "interaction request");
        let outcome = match self.registry.handlers.get(&wid).map(Arc::clone) {
            Some(handler) => handler(self.context.clone(), description.to_owned()).await,
            None => Err(WidError::UnknownWidget { wid }),
        };

        match outcome {
            Ok(reply) => {
                debug!(?reply, "wid handled");
                reply
            }
            Err(error) => {
                warn!(%error, "wid not handled; answering negatively");
                WidgetReply::Deny
            }
        }
    }
}
