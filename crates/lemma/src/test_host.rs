//! Loopback stand-in for a host, used by the engine tests

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};

use crate::config::LemmaConfig;
use crate::frame::{wrap_frame, FrameBuffer};
use crate::protocol::Message;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// UDP responder plus TCP listener on 127.0.0.1
pub struct FakeHost {
    udp: UdpSocket,
    tcp: TcpListener,
    room: String,
}

impl FakeHost {
    pub async fn start() -> Self {
        Self {
            udp: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            tcp: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            room: "lab".to_string(),
        }
    }

    /// Guest config pointed at this host, with short timers
    pub fn config(&self) -> LemmaConfig {
        LemmaConfig {
            discovery_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port: self.udp.local_addr().unwrap().port(),
            broadcast_interval_ms: 50,
            heartbeat_interval_ms: 100,
            ..LemmaConfig::default()
        }
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp.local_addr().unwrap().port()
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Wait for the next announcement
    pub async fn recv_marco(&self) -> (Message, SocketAddr) {
        let mut buf = [0u8; 2048];
        loop {
            let (n, from) = timeout(TEST_TIMEOUT, self.udp.recv_from(&mut buf))
                .await
                .expect("timed out waiting for marco")
                .unwrap();
            if let Ok(msg @ Message::Marco { .. }) = Message::decode(&buf[..n]) {
                return (msg, from);
            }
        }
    }

    /// Throw away announcements already queued
    pub fn drain_marcos(&self) {
        let mut buf = [0u8; 2048];
        while self.udp.try_recv_from(&mut buf).is_ok() {}
    }

    /// Source addresses of every announcement seen during `window`
    pub async fn marco_sources_within(&self, window: Duration) -> HashSet<SocketAddr> {
        let deadline = Instant::now() + window;
        let mut sources = HashSet::new();
        let mut buf = [0u8; 2048];
        while let Ok(Ok((_, from))) =
            tokio::time::timeout_at(deadline, self.udp.recv_from(&mut buf)).await
        {
            sources.insert(from);
        }
        sources
    }

    pub async fn reply_polo(&self, to: SocketAddr) {
        let polo = Message::Polo {
            room_name: self.room.clone(),
            tcp_port: self.tcp_port(),
        };
        self.send_raw(&polo.encode(), to).await;
    }

    pub async fn send_raw(&self, bytes: &[u8], to: SocketAddr) {
        self.udp.send_to(bytes, to).await.unwrap();
    }

    pub async fn accept(&self) -> HostConn {
        let (stream, _) = timeout(TEST_TIMEOUT, self.tcp.accept())
            .await
            .expect("timed out waiting for guest connection")
            .unwrap();
        HostConn::new(stream)
    }

    /// Whether a guest connects within `window`
    pub async fn accepts_within(&self, window: Duration) -> bool {
        timeout(window, self.tcp.accept()).await.is_ok()
    }
}

/// Host side of one messaging session
pub struct HostConn {
    stream: TcpStream,
    inbound: FrameBuffer,
    queue: VecDeque<Vec<u8>>,
}

impl HostConn {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            inbound: FrameBuffer::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn peer_port(&self) -> u16 {
        self.stream.peer_addr().unwrap().port()
    }

    /// Open the host's event connection to the port the guest registered from
    pub async fn connect_back(&self) -> HostConn {
        let stream = timeout(
            TEST_TIMEOUT,
            TcpStream::connect((Ipv4Addr::LOCALHOST, self.peer_port())),
        )
        .await
        .expect("timed out connecting back to guest")
        .unwrap();
        HostConn::new(stream)
    }

    /// Next frame payload, or `None` once the guest closed
    async fn next_payload(&mut self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(payload) = self.queue.pop_front() {
                return Some(payload);
            }
            let n = timeout(TEST_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for guest")
                .ok()?;
            if n == 0 {
                return None;
            }
            let (frames, error) = self.inbound.push(&buf[..n]);
            assert!(error.is_none(), "guest sent a bad frame header");
            self.queue.extend(frames);
        }
    }

    pub async fn next_message(&mut self) -> Option<Message> {
        let payload = self.next_payload().await?;
        Some(Message::decode(&payload).unwrap())
    }

    /// Next message that is not a heartbeat
    pub async fn next_non_heartbeat(&mut self) -> Option<Message> {
        loop {
            match self.next_message().await? {
                Message::Heartbeat { .. } => continue,
                other => return Some(other),
            }
        }
    }

    /// Re-framed bytes of the next payload containing `needle`
    pub async fn next_raw_matching(&mut self, needle: &str) -> Vec<u8> {
        loop {
            let payload = self.next_payload().await.expect("guest closed");
            if String::from_utf8_lossy(&payload).contains(needle) {
                return wrap_frame(&payload).unwrap();
            }
        }
    }

    /// Heartbeats received during `window`, in order
    pub async fn heartbeats_within(&mut self, window: Duration) -> Vec<Instant> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, self.next_message()).await {
            if matches!(msg, Message::Heartbeat { .. }) {
                seen.push(Instant::now());
            }
        }
        seen
    }

    pub async fn send(&mut self, msg: &Message) {
        self.send_raw(&wrap_frame(&msg.encode()).unwrap()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Close the host's sending side, as a host does when it drops a guest
    pub async fn shutdown(&mut self) {
        self.stream.shutdown().await.unwrap();
    }
}
