pub(crate) mod fake;
pub(crate) mod transport;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bon::Builder;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::proto::{
    Command, EventKind, Frame, FrameCodec, FrameReadError, Reply, Service, Status, WireError,
};

/// Deadline applied to `send` when the configuration does not override it.
///
/// Conformance testers allow generous think time, so this leans long rather
/// than tight.
pub const DEFAULT_COMMAND_DEADLINE: Duration = Duration::from_secs(20);

/// Errors surfaced by [`CommandClient::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The IUT did not answer within the configured deadline. The pending
    /// entry has been withdrawn; a late response is logged and dropped.
    #[error("no response from the IUT within {waited}", waited = humantime::format_duration(*deadline))]
    Timeout { deadline: Duration },
    /// The control connection closed. Every pending and future send on this
    /// client reports the same.
    #[error("control connection is closed")]
    Disconnected,
    /// The IUT answered with a status frame carrying a non-zero code.
    #[error("IUT rejected the command with status `{status}`", status = status_name(*code))]
    Rejected { code: u8 },
    /// The response frame did not echo the command opcode.
    #[error("response opcode 0x{actual:02X} does not echo command opcode 0x{expected:02X}")]
    ResponseMismatch { expected: u8, actual: u8 },
    /// A frame or payload violated the wire format.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The run was cancelled while the command was in flight.
    #[error("cancelled while awaiting a response")]
    Cancelled,
}

fn status_name(code: u8) -> String {
    Status::from_repr(code).map_or_else(|| format!("0x{code:02X}"), |status| status.to_string())
}

/// Tunables for one control connection.
#[derive(Debug, Clone, Builder)]
pub struct ClientConfig {
    /// Deadline applied to every [`CommandClient::send`].
    #[builder(default = DEFAULT_COMMAND_DEADLINE)]
    command_deadline: Duration,
    /// Cancelling this token unblocks in-flight sends and stops the reader.
    #[builder(default)]
    cancel: CancellationToken,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Typed handle to one IUT control connection.
///
/// Owns the transport through a background reader task. Commands are
/// serialised first-come-first-served with at most one outstanding on the
/// wire; unsolicited events fan out to [`CommandClient::subscribe`] streams
/// without ever blocking the reader. Clones share the connection.
#[derive(Clone)]
pub struct CommandClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    lane: Mutex<SendLane>,
    pending: Arc<StdMutex<Option<PendingExchange>>>,
    router: Arc<EventRouter>,
    health: Arc<StdMutex<Health>>,
    cancel: CancellationToken,
    command_deadline: Duration,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

struct SendLane {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

struct PendingExchange {
    service: Service,
    opcode: u8,
    tx: oneshot::Sender<Result<Vec<u8>, ClientError>>,
}

enum Health {
    Up,
    Poisoned(ClientError),
}

impl CommandClient {
    /// Takes ownership of the transport and spawns the connection reader.
    #[must_use]
    pub fn spawn(transport: impl transport::Transport, config: ClientConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let pending = Arc::new(StdMutex::new(None));
        let router = Arc::new(EventRouter::default());
        let health = Arc::new(StdMutex::new(Health::Up));
        let cancel = config.cancel.child_token();
        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&router),
            Arc::clone(&health),
            cancel.clone(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                lane: Mutex::new(SendLane {
                    writer: Box::new(write_half),
                }),
                pending,
                router,
                health,
                cancel,
                command_deadline: config.command_deadline,
                reader: StdMutex::new(Some(reader)),
            }),
        }
    }

    /// Sends one command and decodes its typed reply.
    ///
    /// Competing sends are served in arrival order.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] when the deadline elapses, the connection is
    /// down, the IUT rejects the command, or the response is malformed.
    #[instrument(
        skip(self, command),
        level = "debug",
        fields(service = %C::SERVICE, opcode = command.opcode())
    )]
    pub async fn send<C: Command>(&self, command: &C) -> Result<C::Reply, ClientError> {
        let payload = self
            .exchange(C::SERVICE, command.opcode(), command.payload())
            .await?;
        Ok(C::Reply::decode(&payload)?)
    }

    async fn exchange(
        &self,
        service: Service,
        opcode: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ClientError> {
        let deadline = self.inner.command_deadline;
        let mut lane = self.inner.lane.lock().await;
        self.check_health()?;

        let (tx, rx) = oneshot::channel();
        *lock(&self.inner.pending) = Some(PendingExchange {
            service,
            opcode,
            tx,
        });

        let frame = Frame::new(service, opcode, payload);
        if let Err(error) = FrameCodec::write_frame(&mut lane.writer, &frame).await {
            lock(&self.inner.pending).take();
            return Err(match error {
                FrameReadError::Wire(wire) => ClientError::Wire(wire),
                FrameReadError::Io(io) => {
                    debug!(error = %io, "control connection write failed");
                    self.poison(ClientError::Disconnected);
                    ClientError::Disconnected
                }
            });
        }

        tokio::select! {
            result = rx => match result {
                Ok(outcome) => outcome,
                // Reader dropped the pending entry without answering.
                Err(_) => Err(ClientError::Disconnected),
            },
            () = tokio::time::sleep(deadline) => {
                lock(&self.inner.pending).take();
                Err(ClientError::Timeout { deadline })
            }
            () = self.inner.cancel.cancelled() => {
                lock(&self.inner.pending).take();
                Err(ClientError::Cancelled)
            }
        }
    }

    /// Opens a buffered stream of events for one opcode.
    ///
    /// A slow consumer queues; it never back-pressures the connection
    /// reader. The stream ends once the reader stops.
    #[must_use]
    pub fn subscribe<E: EventKind>(&self, event: E) -> EventStream {
        self.inner.router.subscribe(E::SERVICE, event.opcode())
    }

    /// Whether the connection reader is still serving this client.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(*lock(&self.inner.health), Health::Up)
    }

    /// Stops the reader and releases the transport.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let handle = lock(&self.inner.reader).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn check_health(&self) -> Result<(), ClientError> {
        match &*lock(&self.inner.health) {
            Health::Up => Ok(()),
            Health::Poisoned(error) => Err(error.clone()),
        }
    }

    fn poison(&self, error: ClientError) {
        *lock(&self.inner.health) = Health::Poisoned(error);
    }
}

async fn read_loop<R>(
    mut reader: R,
    pending: Arc<StdMutex<Option<PendingExchange>>>,
    router: Arc<EventRouter>,
    health: Arc<StdMutex<Health>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => {
                stop_reader(&pending, &health, ClientError::Cancelled, ClientError::Disconnected);
                break;
            }
            result = FrameCodec::read_frame(&mut reader) => match result {
                Ok(frame) => frame,
                Err(FrameReadError::Wire(wire)) => {
                    warn!(error = %wire, "control connection sent a malformed frame");
                    stop_reader(
                        &pending,
                        &health,
                        ClientError::Wire(wire),
                        ClientError::Disconnected,
                    );
                    break;
                }
                Err(FrameReadError::Io(io)) => {
                    debug!(error = %io, "control connection read ended");
                    stop_reader(
                        &pending,
                        &health,
                        ClientError::Disconnected,
                        ClientError::Disconnected,
                    );
                    break;
                }
            }
        };

        if frame.is_event() {
            router.route(frame);
        } else {
            complete_pending(&pending, frame);
        }
    }

    router.shutdown();
}

/// Fails the in-flight exchange and poisons every later one.
fn stop_reader(
    pending: &StdMutex<Option<PendingExchange>>,
    health: &StdMutex<Health>,
    in_flight: ClientError,
    from_now_on: ClientError,
) {
    *lock(health) = Health::Poisoned(from_now_on);
    if let Some(exchange) = lock(pending).take() {
        let _ = exchange.tx.send(Err(in_flight));
    }
}

fn complete_pending(pending: &StdMutex<Option<PendingExchange>>, frame: Frame) {
    let Some(exchange) = lock(pending).take() else {
        warn!(
            service = %frame.service,
            opcode = frame.opcode,
            "dropping late or unsolicited response frame"
        );
        return;
    };

    let outcome = if frame.is_status() {
        match frame.payload.first() {
            Some(&code) => Err(ClientError::Rejected { code }),
            None => Err(ClientError::Wire(WireError::Truncated { field: "status" })),
        }
    } else if frame.service == exchange.service && frame.opcode == exchange.opcode {
        Ok(frame.payload)
    } else {
        Err(ClientError::ResponseMismatch {
            expected: exchange.opcode,
            actual: frame.opcode,
        })
    };

    // The sender only fails when the caller already gave up on the exchange.
    let _ = exchange.tx.send(outcome);
}

#[derive(Default)]
struct EventRouter {
    routes: StdMutex<RouteTable>,
}

#[derive(Default)]
struct RouteTable {
    by_key: HashMap<(u8, u8), Vec<mpsc::UnboundedSender<Frame>>>,
    closed: bool,
}

impl EventRouter {
    fn subscribe(&self, service: Service, opcode: u8) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = lock(&self.routes);
        if !table.closed {
            table.by_key.entry((service.id(), opcode)).or_default().push(tx);
        }
        EventStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    fn route(&self, frame: Frame) {
        let mut table = lock(&self.routes);
        let Some(senders) = table.by_key.get_mut(&(frame.service.id(), frame.opcode)) else {
            trace!(service = %frame.service, opcode = frame.opcode, "event has no subscriber");
            return;
        };
        senders.retain(|tx| tx.send(frame.clone()).is_ok());
    }

    fn shutdown(&self) {
        let mut table = lock(&self.routes);
        table.closed = true;
        table.by_key.clear();
    }
}

/// Buffered stream of event frames for one `(service, opcode)` key.
#[derive(Debug)]
pub struct EventStream {
    inner: UnboundedReceiverStream<Frame>,
}

impl EventStream {
    /// Next matching event, or `None` once the connection reader has
    /// stopped.
    pub async fn next(&mut self) -> Option<Frame> {
        use tokio_stream::StreamExt;

        self.inner.next().await
    }
}

impl tokio_stream::Stream for EventStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Locks a mutex, recovering the guard if a panicking thread poisoned it.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
