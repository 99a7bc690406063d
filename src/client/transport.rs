use std::io;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Capacity of one in-memory pipe direction. Generous next to the 64 KiB
/// frame-payload ceiling so a scripted IUT never deadlocks on its own writes.
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// A byte stream that can carry control frames.
///
/// Production runs use a TCP socket to the IUT; tests and the fake IUT use an
/// in-memory duplex pipe. Anything readable, writable and sendable qualifies.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Connects to an IUT control socket.
///
/// Frames are small and latency-bound, so Nagle's algorithm is disabled.
///
/// # Errors
///
/// Returns the underlying I/O error when the connection cannot be
/// established.
pub async fn connect_tcp(address: impl ToSocketAddrs) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Creates a connected in-memory transport pair.
///
/// One end goes to a [`CommandClient`](crate::client::CommandClient), the
/// other to a fake IUT or a test harness.
#[must_use]
pub fn duplex_pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(DUPLEX_CAPACITY)
}
