//! In-process everterm server for client tests.
//!
//! Speaks the client's resume handshake and frame codec over real TCP.
//! Captures every received packet, optionally echoes keepalives, and lets
//! tests inject outbound packets or drop the live connection to exercise
//! resume behavior. The reply watermark is always the number of frames
//! fully received, so a reconnecting client prunes and replays exactly as
//! it would against the production server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

use evt_core::protocol::{Codec, Packet, PacketType};

enum Command {
    Send(Packet),
    SendRaw(Vec<u8>),
    Drop,
}

#[derive(Default)]
struct State {
    received: Vec<Packet>,
    connections: u32,
}

/// Handle to a running mock server.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    /// Start a server on an ephemeral localhost port.
    ///
    /// With `auto_keepalive`, every received keepalive is echoed back;
    /// without it the server goes silent, which is how tests starve the
    /// client's liveness tracking.
    pub async fn start(auto_keepalive: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(serve(listener, Arc::clone(&state), cmd_rx, auto_keepalive));

        Self {
            addr,
            state,
            cmd_tx,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Snapshot of every packet received so far, across all connections.
    pub fn received(&self) -> Vec<Packet> {
        self.state.lock().unwrap().received.clone()
    }

    /// Packets of one type received so far.
    pub fn received_of(&self, ty: PacketType) -> Vec<Packet> {
        self.state
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|p| p.packet_type == ty)
            .cloned()
            .collect()
    }

    /// Number of transport connections accepted so far.
    pub fn connection_count(&self) -> u32 {
        self.state.lock().unwrap().connections
    }

    /// Send a packet to the client on the live connection.
    pub fn send(&self, pkt: Packet) {
        self.cmd_tx.send(Command::Send(pkt)).unwrap();
    }

    /// Send raw bytes to the client, bypassing the codec.
    pub fn send_raw(&self, bytes: Vec<u8>) {
        self.cmd_tx.send(Command::SendRaw(bytes)).unwrap();
    }

    /// Drop the live connection, simulating a transport failure.
    pub fn drop_connection(&self) {
        self.cmd_tx.send(Command::Drop).unwrap();
    }

    /// Wait until at least `count` packets have been received.
    ///
    /// Panics after ~5 seconds to keep hung tests diagnosable.
    pub async fn wait_for_packets(&self, count: usize) {
        for _ in 0..500 {
            if self.state.lock().unwrap().received.len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {count} packets; got {:?}",
            self.received()
        );
    }

    /// Wait until at least `count` connections have been accepted.
    pub async fn wait_for_connections(&self, count: u32) {
        for _ in 0..500 {
            if self.connection_count() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for connection {count}");
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    listener: TcpListener,
    state: Arc<Mutex<State>>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    auto_keepalive: bool,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        state.lock().unwrap().connections += 1;
        debug!("mock server accepted connection");

        match serve_connection(stream, &state, &mut cmd_rx, auto_keepalive).await {
            ConnectionEnd::PeerGone => continue,
            ConnectionEnd::Shutdown => return,
        }
    }
}

enum ConnectionEnd {
    PeerGone,
    Shutdown,
}

async fn serve_connection(
    mut stream: TcpStream,
    state: &Arc<Mutex<State>>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    auto_keepalive: bool,
) -> ConnectionEnd {
    // Resume handshake: id length, id, client watermark; reply with ours.
    let mut len_buf = [0u8; 2];
    if stream.read_exact(&mut len_buf).await.is_err() {
        return ConnectionEnd::PeerGone;
    }
    let id_len = u16::from_be_bytes(len_buf) as usize;
    let mut id = vec![0u8; id_len];
    if stream.read_exact(&mut id).await.is_err() {
        return ConnectionEnd::PeerGone;
    }
    let mut wm_buf = [0u8; 8];
    if stream.read_exact(&mut wm_buf).await.is_err() {
        return ConnectionEnd::PeerGone;
    }

    let our_watermark = state.lock().unwrap().received.len() as u64;
    if stream
        .write_all(&our_watermark.to_be_bytes())
        .await
        .is_err()
    {
        return ConnectionEnd::PeerGone;
    }
    debug!(
        id = %String::from_utf8_lossy(&id),
        client_watermark = u64::from_be_bytes(wm_buf),
        our_watermark,
        "mock server handshake complete"
    );

    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(pkt)) => {
                    let frame = Codec::encode(&pkt).unwrap();
                    if stream.write_all(&frame).await.is_err() {
                        return ConnectionEnd::PeerGone;
                    }
                }
                Some(Command::SendRaw(bytes)) => {
                    if stream.write_all(&bytes).await.is_err() {
                        return ConnectionEnd::PeerGone;
                    }
                }
                Some(Command::Drop) => {
                    debug!("mock server dropping connection on command");
                    return ConnectionEnd::PeerGone;
                }
                None => return ConnectionEnd::Shutdown,
            },
            res = stream.read_buf(&mut buf) => match res {
                Ok(0) | Err(_) => return ConnectionEnd::PeerGone,
                Ok(_) => loop {
                    match Codec::decode(&mut buf) {
                        Ok(Some(pkt)) => {
                            let echo = auto_keepalive
                                && pkt.packet_type == PacketType::KeepAlive;
                            state.lock().unwrap().received.push(pkt);
                            if echo {
                                let frame = Codec::encode(&Packet::keep_alive()).unwrap();
                                if stream.write_all(&frame).await.is_err() {
                                    return ConnectionEnd::PeerGone;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(_) => return ConnectionEnd::PeerGone,
                    }
                },
            },
        }
    }
}
