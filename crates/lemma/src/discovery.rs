//! UDP host discovery
//!
//! Broadcasts a `marco` announcement on a fixed interval and waits for a
//! unicast `polo` naming the host's messaging port. The host replies to the
//! port the announcement came from, so a listener is bound to that same
//! port with address reuse. Replies are read from both sockets.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Identity, LemmaConfig};
use crate::envelope::Envelope;
use crate::frame::unwrap_frames;
use crate::protocol::{Message, POLO};

const MAX_DATAGRAM: usize = 2048;

/// Progress reported by a running discovery client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// The first announcement went out
    Announced,
    /// A host replied. `host` carries the responder's IP and messaging port.
    HostFound { host: SocketAddr, room_name: String },
}

/// Handle to a running discovery task. Dropping it stops discovery.
pub struct DiscoveryClient {
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl DiscoveryClient {
    /// Start announcing this guest
    pub fn start(identity: &Identity, config: &LemmaConfig) -> Self {
        let announcement = Message::Marco {
            guest_name: identity.guest_name().to_string(),
            room_name: identity.room_name().to_string(),
            dialect: config.dialect.clone(),
            version: config.version.clone(),
        }
        .encode();

        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(discovery_task(
            announcement,
            config.discovery_target(),
            config.broadcast_interval(),
            events_tx,
            shutdown_rx,
        ));

        Self {
            events,
            shutdown_tx,
            task,
        }
    }

    /// Next progress report, or `None` once the task has finished
    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        self.events.recv().await
    }

    /// Stop announcing and close both sockets
    pub fn stop(self) {
        debug!("Stopping discovery");
        let _ = self.shutdown_tx.send(());
        self.task.abort();
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.task.abort();
    }
}

struct DiscoverySockets {
    outbound: UdpSocket,
    listener: Option<UdpSocket>,
}

impl DiscoverySockets {
    fn open(target: SocketAddr) -> io::Result<Self> {
        let outbound = bind_udp(target, 0, true)?;
        let port = outbound.local_addr()?.port();
        info!(port = port, "Discovery sending from port");

        let listener = match bind_udp(target, port, false) {
            Ok(socket) => {
                info!(port = port, "Discovery listening on port");
                Some(socket)
            }
            Err(e) => {
                warn!(port = port, error = %e, "Discovery listener bind failed, replies read from sender only");
                None
            }
        };

        Ok(Self { outbound, listener })
    }
}

fn bind_udp(target: SocketAddr, port: u16, broadcast: bool) -> io::Result<UdpSocket> {
    let domain = Domain::for_address(target);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_reuse_address(true) {
        error!(error = %e, "Failed to enable address reuse");
    }
    if broadcast && target.is_ipv4() {
        socket.set_broadcast(true)?;
    }

    let any: IpAddr = if target.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    socket.bind(&SocketAddr::new(any, port).into())?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket.into())
}

async fn recv_on(socket: Option<&UdpSocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Main discovery task
async fn discovery_task(
    announcement: Vec<u8>,
    target: SocketAddr,
    interval: Duration,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    // Bind failures are retried on the broadcast interval
    let sockets = loop {
        match DiscoverySockets::open(target) {
            Ok(sockets) => break sockets,
            Err(e) => {
                error!(error = %e, "Failed to open discovery socket");
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.recv() => return,
                }
            }
        }
    };

    let mut ticker = tokio::time::interval(interval);
    let mut outbound_buf = vec![0u8; MAX_DATAGRAM];
    let mut listener_buf = vec![0u8; MAX_DATAGRAM];
    let mut announced = false;

    loop {
        let received = tokio::select! {
            _ = ticker.tick() => {
                match sockets.outbound.send_to(&announcement, target).await {
                    Ok(n) => {
                        debug!(target = %target, bytes = n, "Sent availability announcement");
                        if !announced {
                            announced = true;
                            let _ = events_tx.send(DiscoveryEvent::Announced);
                        }
                    }
                    Err(e) => {
                        warn!(target = %target, error = %e, "Availability announcement failed");
                    }
                }
                continue;
            }
            result = sockets.outbound.recv_from(&mut outbound_buf) => {
                result.map(|(n, from)| (outbound_buf[..n].to_vec(), from))
            }
            result = recv_on(sockets.listener.as_ref(), &mut listener_buf) => {
                result.map(|(n, from)| (listener_buf[..n].to_vec(), from))
            }
            _ = shutdown_rx.recv() => {
                debug!("Discovery task shutting down");
                return;
            }
        };

        match received {
            Ok((datagram, from)) => {
                if let Some(found) = parse_reply(&datagram, from) {
                    let _ = events_tx.send(found);
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Discovery receive failed");
            }
        }
    }
}

/// Interpret a datagram as a host reply
pub(crate) fn parse_reply(datagram: &[u8], from: SocketAddr) -> Option<DiscoveryEvent> {
    let payload = strip_length_prefix(datagram);

    let envelope = match Envelope::decode(payload) {
        Ok(env) => env,
        Err(e) => {
            warn!(from = %from, error = %e, "Ignoring unparseable host reply");
            return None;
        }
    };
    if envelope.len() != 3 {
        warn!(from = %from, fields = envelope.len(), "Host reply has an invalid number of fields");
        return None;
    }
    if envelope.header() != POLO {
        warn!(from = %from, header = %envelope.header(), "Host reply has an unknown header");
        return None;
    }

    match Message::from_envelope(&envelope) {
        Ok(Message::Polo {
            room_name,
            tcp_port,
        }) => {
            let host = SocketAddr::new(from.ip(), tcp_port);
            info!(host = %host, room = %room_name, "Host replied");
            Some(DiscoveryEvent::HostFound { host, room_name })
        }
        Ok(_) => None,
        Err(e) => {
            warn!(from = %from, error = %e, "Ignoring malformed host reply");
            None
        }
    }
}

/// Accept replies sent either bare or as a single 6-digit frame
fn strip_length_prefix(datagram: &[u8]) -> &[u8] {
    let unwrapped = unwrap_frames(datagram);
    match unwrapped.frames.as_slice() {
        [only] if unwrapped.rest.is_empty() && unwrapped.error.is_none() => only,
        _ => datagram,
    }
}
