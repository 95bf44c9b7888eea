//! TCP messaging session with the host
//!
//! Connects, registers, then runs a single task that multiplexes socket
//! reads, outbound messages and the heartbeat timer. Inbound events are
//! reported to the owner; nothing here touches the handler table.
//!
//! Hosts deliver events either on the session connection or on a second
//! connection they open back to the port advertised in `register`. A
//! listener is bound to that port before registering, and both connections
//! feed the same frame decoding path.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::{Identity, LemmaConfig};
use crate::error::{Error, Result};
use crate::frame::{write_frame, FrameBuffer};
use crate::protocol::{EventValue, Message, RegisterOptions};

/// Progress reported by a running session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connected and registration written
    Registered { local_port: u16 },
    /// The host delivered an event
    Event {
        sender_name: String,
        event_name: String,
        value: EventValue,
    },
    /// The session is gone: host close, socket error or connect failure
    Closed { reason: String },
}

/// Handle to a running session. Dropping it closes the connection.
pub struct Session {
    host: SocketAddr,
    outbound_tx: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
}

/// Everything the session task needs, captured at connect time
struct SessionContext {
    host: SocketAddr,
    guest_name: String,
    hears: Vec<String>,
    dialect: String,
    version: String,
    heartbeat_interval: Duration,
    heartbeat_seconds: u64,
    read_buffer_size: usize,
}

impl Session {
    /// Open a session to `host`, advertising `hears` in the registration
    pub fn connect(
        host: SocketAddr,
        identity: &Identity,
        hears: Vec<String>,
        config: &LemmaConfig,
    ) -> Self {
        let ctx = SessionContext {
            host,
            guest_name: identity.guest_name().to_string(),
            hears,
            dialect: config.dialect.clone(),
            version: config.version.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_seconds: config.heartbeat_seconds(),
            read_buffer_size: config.read_buffer_size.max(64),
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(session_task(ctx, outbound_rx, events_tx));

        Self {
            host,
            outbound_tx,
            events,
            task,
        }
    }

    pub fn host(&self) -> SocketAddr {
        self.host
    }

    /// Queue a message for the host
    pub fn send(&self, msg: Message) -> Result<()> {
        self.outbound_tx.send(msg).map_err(|_| Error::NotConnected)
    }

    /// Next progress report, or `None` once the task has finished
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Close the connection and stop the heartbeat
    pub fn close(self) {
        debug!(host = %self.host, "Closing session");
        self.task.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Main session task
async fn session_task(
    ctx: SessionContext,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    let reason = match run_session(&ctx, outbound_rx, &events_tx).await {
        Ok(reason) => reason,
        Err(e) => e.to_string(),
    };
    info!(host = %ctx.host, reason = %reason, "Session ended");
    let _ = events_tx.send(SessionEvent::Closed { reason });
}

async fn run_session(
    ctx: &SessionContext,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<String> {
    info!(host = %ctx.host, "Connecting to host");
    let stream = reusable_socket(ctx.host)?.connect(ctx.host).await?;
    let local_addr = stream.local_addr()?;
    let local_port = local_addr.port();
    info!(host = %ctx.host, local_port = local_port, "Session connected");

    let listener = match listen_on(local_addr) {
        Ok(listener) => {
            info!(port = local_port, "Listening for host connection");
            Some(listener)
        }
        Err(e) => {
            warn!(port = local_port, error = %e, "Host connection listener failed, reading session only");
            None
        }
    };

    let (mut reader, mut writer) = stream.into_split();

    let registration = Message::Register {
        guest_name: ctx.guest_name.clone(),
        local_port,
        hears: ctx.hears.clone(),
        speaks: Vec::new(),
        dialect: ctx.dialect.clone(),
        version: ctx.version.clone(),
        options: RegisterOptions {
            heartbeat: ctx.heartbeat_seconds,
        },
    };
    send_message(&mut writer, &registration).await?;
    let _ = events_tx.send(SessionEvent::Registered { local_port });

    // First tick fires immediately, so a heartbeat follows registration
    let mut heartbeat = tokio::time::interval(ctx.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let heartbeat_msg = Message::Heartbeat {
        guest_name: ctx.guest_name.clone(),
    };

    let mut inbound = FrameBuffer::new();
    let mut buf = vec![0u8; ctx.read_buffer_size];

    let mut back: Option<TcpStream> = None;
    let mut back_inbound = FrameBuffer::new();
    let mut back_buf = vec![0u8; ctx.read_buffer_size];

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                let n = result?;
                if n == 0 {
                    return Ok("host closed the connection".into());
                }
                for event in ingest(&mut inbound, &buf[..n]) {
                    let _ = events_tx.send(event);
                }
            }

            result = accept_on(listener.as_ref()) => {
                match result {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "Host connected back");
                        if back.replace(stream).is_some() {
                            debug!("Replacing previous host connection");
                        }
                        back_inbound = FrameBuffer::new();
                    }
                    Err(e) => warn!(error = %e, "Accepting host connection failed"),
                }
            }

            result = read_on(back.as_mut(), &mut back_buf) => {
                let n = result?;
                if n == 0 {
                    return Ok("host closed the event connection".into());
                }
                for event in ingest(&mut back_inbound, &back_buf[..n]) {
                    let _ = events_tx.send(event);
                }
            }

            msg = outbound_rx.recv() => {
                match msg {
                    Some(msg) => send_message(&mut writer, &msg).await?,
                    None => return Ok("session closed locally".into()),
                }
            }

            _ = heartbeat.tick() => {
                send_message(&mut writer, &heartbeat_msg).await?;
            }
        }
    }
}

/// TCP socket that may share its port with the connect-back listener
fn reusable_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuseport(true)?;
    Ok(socket)
}

fn listen_on(local: SocketAddr) -> io::Result<TcpListener> {
    let any: IpAddr = if local.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let socket = reusable_socket(local)?;
    socket.bind(SocketAddr::new(any, local.port()))?;
    socket.listen(8)
}

async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn read_on(stream: Option<&mut TcpStream>, buf: &mut [u8]) -> io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn send_message(writer: &mut OwnedWriteHalf, msg: &Message) -> Result<()> {
    let written = write_frame(writer, &msg.encode()).await?;
    debug!(header = msg.header(), bytes = written, "Session wrote");
    Ok(())
}

/// Feed raw bytes through the frame buffer and decode what completes
pub(crate) fn ingest(inbound: &mut FrameBuffer, bytes: &[u8]) -> Vec<SessionEvent> {
    let (frames, error) = inbound.push(bytes);
    if let Some(e) = error {
        warn!(error = %e, "Discarding unframeable bytes");
    }
    if let Some(e) = inbound.incomplete() {
        warn!(error = %e, "Frame split across reads, buffering");
    }

    frames
        .iter()
        .filter_map(|payload| handle_frame(payload))
        .collect()
}

/// Decode one inbound frame. Anything but an event yields nothing.
pub(crate) fn handle_frame(payload: &[u8]) -> Option<SessionEvent> {
    match Message::decode(payload) {
        Ok(Message::HeartbeatAck) => {
            trace!("Heartbeat acknowledged");
            None
        }
        Ok(Message::Event {
            sender_name,
            event_name,
            value,
        }) => Some(SessionEvent::Event {
            sender_name,
            event_name,
            value,
        }),
        Ok(other) => {
            warn!(header = other.header(), "Unexpected message from host");
            None
        }
        Err(e) => {
            warn!(error = %e, "Dropping bad frame");
            None
        }
    }
}
