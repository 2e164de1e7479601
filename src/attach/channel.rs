//! The dial-back channel.
//!
//! The controller listens on an ephemeral port before attaching and accepts exactly one
//! connection, the one made by the target once the entry point has been invoked. Right after
//! the connection is made, each side writes its preamble and only then reads the peer's.

use std::{net::SocketAddr, pin::pin, time::Duration};

use async_io::Timer;
use async_net::{TcpListener, TcpStream};
use futures::{executor::block_on, AsyncReadExt, AsyncWriteExt, FutureExt};
use log::debug;

use super::AttachError;
use crate::{
    cancellation::CancellationToken,
    contract::{HandshakeArgument, PROTOCOL_VERSION},
};

const MAGIC: &[u8; 4] = b"TSHL";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected preamble {0:02x?}")]
    Preamble([u8; 6]),
    #[error("aborted")]
    Aborted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ChannelError> for AttachError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Timeout(_) => AttachError::ChannelTimeout,
            ChannelError::Preamble(_) => AttachError::ProtocolViolation(e.to_string()),
            ChannelError::Aborted => AttachError::AttachFailure(e.to_string()),
            ChannelError::Io(e) => AttachError::Io(e),
        }
    }
}

fn preamble() -> [u8; 6] {
    let mut preamble = [0; 6];
    preamble[..4].copy_from_slice(MAGIC);
    preamble[4..].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    preamble
}

async fn exchange_preamble(stream: &mut TcpStream) -> Result<(), ChannelError> {
    let ours = preamble();
    stream.write_all(&ours).await?;
    stream.flush().await?;
    let mut theirs = [0; 6];
    stream.read_exact(&mut theirs).await?;
    if theirs != ours {
        return Err(ChannelError::Preamble(theirs));
    }
    Ok(())
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, ChannelError>>,
) -> Result<T, ChannelError> {
    let mut fut = Box::pin(fut.fuse());
    let mut timer = Timer::after(timeout).fuse();
    futures::select! {
        res = fut => res,
        _ = timer => Err(ChannelError::Timeout(timeout)),
    }
}

/// Listening side, held by the controller for the duration of one handshake.
pub struct ChannelListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ChannelListener {
    /// Listens on an ephemeral port of every interface.
    pub fn bind() -> Result<Self, ChannelError> {
        let listener = block_on(TcpListener::bind(("0.0.0.0", 0)))?;
        let local_addr = listener.local_addr()?;
        debug!(target: "teleshell::attach", "listening for the target on {local_addr}");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accepts one connection and exchanges preambles, all within `timeout`.
    ///
    /// The listener is consumed, later connection attempts are refused.
    pub fn accept(self, timeout: Duration) -> Result<TcpStream, ChannelError> {
        self.accept_unless(timeout, &CancellationToken::new())
    }

    /// Like [`accept`](Self::accept), giving up with [`ChannelError::Aborted`] once `abort` is
    /// cancelled.
    pub fn accept_unless(
        self,
        timeout: Duration,
        abort: &CancellationToken,
    ) -> Result<TcpStream, ChannelError> {
        block_on(async {
            let mut accepted = pin!(with_timeout(timeout, async {
                let (mut stream, peer) = self.listener.accept().await?;
                debug!(target: "teleshell::attach", "target connected from {peer}");
                stream.set_nodelay(true)?;
                exchange_preamble(&mut stream).await?;
                Ok(stream)
            })
            .fuse());
            let mut aborted = abort.cancelled().fuse();
            futures::select! {
                res = accepted => res,
                () = aborted => Err(ChannelError::Aborted),
            }
        })
    }
}

/// Target side: dials the controller back and exchanges preambles, all within `timeout`.
pub fn connect(to: &HandshakeArgument, timeout: Duration) -> Result<TcpStream, ChannelError> {
    block_on(with_timeout(timeout, async {
        let mut stream = TcpStream::connect((to.host.as_str(), to.port)).await?;
        stream.set_nodelay(true)?;
        exchange_preamble(&mut stream).await?;
        Ok(stream)
    }))
}

/// The host name the target should dial back.
///
/// A loopback target is reached through the configured name, anything else through this host's
/// name.
pub fn advertised_host(hostname: &str) -> String {
    if is_loopback(hostname) {
        return hostname.to_owned();
    }
    local_host_name().unwrap_or_else(|| hostname.to_owned())
}

fn is_loopback(hostname: &str) -> bool {
    use std::net::ToSocketAddrs;

    hostname == "localhost"
        || (hostname, 0)
            .to_socket_addrs()
            .map(|mut addrs| addrs.all(|addr| addr.ip().is_loopback()))
            .unwrap_or(false)
}

#[cfg(unix)]
fn local_host_name() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
}

#[cfg(not(unix))]
fn local_host_name() -> Option<String> {
    None
}
