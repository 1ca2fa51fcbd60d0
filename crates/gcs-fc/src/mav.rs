use std::fmt;
use std::io::Cursor;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use mavlink::common::MavMessage;
use mavlink::error::MessageReadError;
use mavlink::MavlinkVersion;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::{DecodeError, LinkError};
use crate::message::{Heartbeat, RawMessage};
use crate::{shutdown_requested, LinkConfig};

/// One received item: a message, or the error that replaced it.
pub type Inbound = Result<RawMessage, LinkError>;

pub type HeartbeatInfo = Heartbeat;

const DATAGRAM_MAX: usize = 65_536;
const READ_CHUNK: usize = 1024;
/// MAVLink v2 frame with signature.
const MAX_FRAME: usize = 280;
const STREAM_BUF_MAX: usize = 16 * MAX_FRAME;

/// Receive side of an open link. The transport lives inside, so dropping the
/// link closes it.
pub struct Link {
    address: String,
    source: Source,
}

enum Source {
    Channel(mpsc::Receiver<Inbound>),
    Transport(Transport),
}

#[derive(Debug)]
pub struct Connected {
    pub link: Link,
    pub heartbeat: HeartbeatInfo,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("address", &self.address).finish_non_exhaustive()
    }
}

impl Link {
    /// Wraps an existing message channel. Used for non-mavlink sources and
    /// in tests.
    pub fn from_channel(address: impl Into<String>, rx: mpsc::Receiver<Inbound>) -> Self {
        Self { address: address.into(), source: Source::Channel(rx) }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// `Ok(None)` when nothing arrived within `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<RawMessage>, LinkError> {
        match tokio::time::timeout(timeout, self.next()).await {
            Err(_) => Ok(None),
            Ok(item) => item.map(Some),
        }
    }

    // Cancel safe: a partly read frame stays buffered for the next call.
    async fn next(&mut self) -> Inbound {
        match &mut self.source {
            Source::Channel(rx) => match rx.recv().await {
                Some(item) => item,
                None => Err(LinkError::Closed { address: self.address.clone() }),
            },
            Source::Transport(t) => t.next().await,
        }
    }
}

/// Opens the transport and waits for the first HEARTBEAT.
/// Never retries; that is the caller's call.
pub async fn connect(cfg: &LinkConfig, shutdown: &mut watch::Receiver<bool>) -> Result<Connected, LinkError> {
    let address = cfg.address.clone();
    info!("fc: connecting to {}", address);

    let state = tokio::select! {
        _ = shutdown_requested(shutdown) => return Err(LinkError::Cancelled),
        res = open(&address) => res?,
    };
    let mut link = Link {
        address: address.clone(),
        source: Source::Transport(Transport {
            address: address.clone(),
            state,
            buf: Vec::new(),
            autoreconnect: cfg.autoreconnect(),
            backoff: cfg.reconnect_backoff(),
        }),
    };

    let timeout = cfg.heartbeat_timeout();
    info!("fc: waiting for heartbeat (timeout {:?})", timeout);
    let hb = tokio::select! {
        _ = shutdown_requested(shutdown) => return Err(LinkError::Cancelled),
        res = wait_heartbeat(&mut link, timeout) => res?,
    };

    info!("fc: connected to {} (system {}, component {})", address, hb.system_id, hb.component_id);
    info!(
        "fc: vehicle {:?}, autopilot {:?}, base_mode {:#04x}, custom_mode {}",
        hb.mavtype, hb.autopilot, hb.base_mode, hb.custom_mode
    );
    Ok(Connected { link, heartbeat: hb })
}

/// Waits until a HEARTBEAT arrives or `timeout` elapses. Anything else
/// received in the meantime is dropped.
pub async fn wait_heartbeat(link: &mut Link, timeout: Duration) -> Result<HeartbeatInfo, LinkError> {
    let deadline = Instant::now() + timeout;
    loop {
        let item = match tokio::time::timeout_at(deadline, link.next()).await {
            Err(_) => {
                return Err(LinkError::Timeout { address: link.address.clone(), waited: timeout });
            }
            Ok(item) => item,
        };
        match item {
            Ok(RawMessage::Heartbeat(hb)) => return Ok(hb),
            Ok(other) => debug!("fc: discarding {} before heartbeat", other.type_name()),
            Err(LinkError::Transport(reason)) => return Err(connect_err(&link.address, reason)),
            Err(LinkError::Closed { .. }) => {
                return Err(connect_err(&link.address, "transport closed before heartbeat"));
            }
            Err(e) => debug!("fc: ignoring error before heartbeat: {}", e),
        }
    }
}

enum State {
    Datagram(UdpSocket),
    /// `tcpin`, before the peer shows up.
    Listening(TcpListener),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
    Reopening(BoxFuture<'static, Result<State, LinkError>>),
    Closed,
}

enum Step {
    Data,
    Accepted(TcpStream, std::net::SocketAddr),
    Reopened(State),
    ReopenFailed(LinkError),
    Failed(String),
}

struct Transport {
    address: String,
    state: State,
    /// Datagram mode: the rest of the current datagram.
    /// Stream mode: bytes not yet framed.
    buf: Vec<u8>,
    autoreconnect: bool,
    backoff: Duration,
}

impl Transport {
    async fn next(&mut self) -> Inbound {
        loop {
            if let Some(item) = self.take_frame() {
                return item;
            }

            let step = match &mut self.state {
                State::Datagram(sock) => {
                    self.buf.resize(DATAGRAM_MAX, 0);
                    match sock.recv_from(&mut self.buf).await {
                        Ok((n, _)) => {
                            self.buf.truncate(n);
                            Step::Data
                        }
                        Err(e) => Step::Failed(e.to_string()),
                    }
                }
                State::Listening(listener) => match listener.accept().await {
                    Ok((stream, peer)) => Step::Accepted(stream, peer),
                    Err(e) => Step::Failed(e.to_string()),
                },
                State::Stream(stream) => {
                    let mut chunk = [0u8; READ_CHUNK];
                    match stream.read(&mut chunk).await {
                        Ok(0) => Step::Failed("connection closed by peer".into()),
                        Ok(n) => {
                            self.buf.extend_from_slice(&chunk[..n]);
                            Step::Data
                        }
                        Err(e) => Step::Failed(e.to_string()),
                    }
                }
                State::Reopening(pending) => match pending.await {
                    Ok(state) => Step::Reopened(state),
                    Err(e) => Step::ReopenFailed(e),
                },
                State::Closed => return Err(LinkError::Closed { address: self.address.clone() }),
            };

            match step {
                Step::Data => {}
                Step::Accepted(stream, peer) => {
                    info!("fc: {} accepted {}", self.address, peer);
                    self.state = State::Stream(Box::new(stream));
                }
                Step::Reopened(state) => {
                    info!("fc: reconnected to {}", self.address);
                    self.buf.clear();
                    self.state = state;
                }
                Step::ReopenFailed(e) => {
                    warn!("fc: reconnect failed: {}", e);
                    self.state = State::Reopening(reopen(self.address.clone(), self.backoff));
                }
                Step::Failed(reason) => {
                    self.buf.clear();
                    // old transport is dropped here, before the reopen runs
                    self.state = if self.autoreconnect {
                        warn!("fc: transport error on {}: {}; reconnecting", self.address, reason);
                        State::Reopening(reopen(self.address.clone(), self.backoff))
                    } else {
                        warn!("fc: transport error on {}, autoreconnect off: {}", self.address, reason);
                        State::Closed
                    };
                    return Err(LinkError::Transport(reason));
                }
            }
        }
    }

    /// Next complete frame in `buf`, if any.
    fn take_frame(&mut self) -> Option<Inbound> {
        if self.buf.is_empty() {
            return None;
        }
        let mut cursor = Cursor::new(&self.buf[..]);
        let res = mavlink::read_versioned_msg::<MavMessage, _>(&mut cursor, MavlinkVersion::V2);
        let used = cursor.position() as usize;
        match res {
            Ok((hdr, msg)) => {
                self.buf.drain(..used);
                Some(Ok(RawMessage::from_mav(&hdr, &msg)))
            }
            Err(MessageReadError::Parse(e)) => {
                self.buf.drain(..used);
                Some(Err(DecodeError::Malformed(e.to_string()).into()))
            }
            // ran out of bytes
            Err(MessageReadError::Io(_)) => {
                if matches!(self.state, State::Datagram(_)) {
                    self.buf.clear();
                } else if self.buf.len() > STREAM_BUF_MAX {
                    let excess = self.buf.len() - MAX_FRAME;
                    self.buf.drain(..excess);
                }
                None
            }
        }
    }
}

fn reopen(address: String, backoff: Duration) -> BoxFuture<'static, Result<State, LinkError>> {
    async move {
        tokio::time::sleep(backoff).await;
        open(&address).await
    }
    .boxed()
}

async fn open(address: &str) -> Result<State, LinkError> {
    let io_err = |e: std::io::Error| connect_err(address, e.to_string());
    let (scheme, target) = address
        .split_once(':')
        .ok_or_else(|| connect_err(address, "expected <scheme>:<target>"))?;

    match scheme {
        "udpin" => Ok(State::Datagram(UdpSocket::bind(target).await.map_err(io_err)?)),
        "udpout" | "udpbcast" => {
            tokio::net::lookup_host(target).await.map_err(io_err)?;
            let sock = UdpSocket::bind("0.0.0.0:0").await.map_err(io_err)?;
            if scheme == "udpbcast" {
                sock.set_broadcast(true).map_err(io_err)?;
            }
            Ok(State::Datagram(sock))
        }
        "tcpin" => Ok(State::Listening(TcpListener::bind(target).await.map_err(io_err)?)),
        "tcpout" => Ok(State::Stream(Box::new(TcpStream::connect(target).await.map_err(io_err)?))),
        "serial" => {
            let (dev, baud) =
                parse_serial(target).ok_or_else(|| connect_err(address, "expected serial:<device>:<baud>"))?;
            let port = tokio_serial::new(dev, baud)
                .open_native_async()
                .map_err(|e| connect_err(address, format!("open serial device {dev}: {e}")))?;
            Ok(State::Stream(Box::new(port)))
        }
        other => Err(connect_err(address, format!("unsupported scheme {other:?}"))),
    }
}

pub(crate) fn parse_serial(rest: &str) -> Option<(&str, u32)> {
    let (dev, baud) = rest.rsplit_once(':')?;
    if dev.is_empty() {
        return None;
    }
    Some((dev, baud.parse().ok()?))
}

fn connect_err(address: &str, reason: impl Into<String>) -> LinkError {
    LinkError::Connect { address: address.to_string(), reason: reason.into() }
}
