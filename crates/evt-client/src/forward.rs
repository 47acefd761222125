//! Port-forward handler.
//!
//! Owns every forwarded TCP connection for the session:
//!
//! - Source tunnels (`-t`): a local listener per pair. Accepted connections
//!   are paired with a server-side destination via a destination-request,
//!   and bytes are pumped as `PortForwardData` frames once the server's
//!   response binds the peer id.
//! - Reverse tunnels (`-rt`): the server listens remotely; each remote
//!   accept arrives as a destination-request prompting a loopback dial here.
//!
//! Listener accept loops are the only spawned tasks; they hand sockets to
//! the handler over an mpsc queue, and all state mutation happens in
//! `update`/`handle_packet` on the engine's loop. Data frames are tagged
//! with the receiver's conn id: we send with `peer_id` and look up inbound
//! frames by our local id.

use std::collections::HashMap;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use evt_core::constants::{DIAL_TIMEOUT, FORWARD_BUFFER_SIZE};
use evt_core::error::{Error, Result};
use evt_core::protocol::{
    Packet, PacketType, PortForwardData, PortForwardDestinationRequest,
    PortForwardDestinationResponse, PortForwardSourceRequest, PortForwardSourceResponse,
};

use crate::channel::ReliableChannel;

/// Which side initiated a forwarded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDirection {
    /// Accepted by one of our local listeners (`-t`).
    LocalSource,
    /// Dialed on behalf of a remote listener (`-rt`).
    RemoteDestination,
}

/// One forwarded TCP connection.
struct ForwardConn {
    id: u64,
    stream: TcpStream,
    direction: ForwardDirection,
    /// The peer's id for this connection; assigned by the destination
    /// response (source) or taken from the request (destination).
    peer_id: Option<u64>,
    /// Bytes from the peer awaiting a writable local socket.
    pending_write: Vec<u8>,
}

impl ForwardConn {
    fn new(id: u64, stream: TcpStream, direction: ForwardDirection, peer_id: Option<u64>) -> Self {
        Self {
            id,
            stream,
            direction,
            peer_id,
            pending_write: Vec::new(),
        }
    }
}

/// A local listening socket created for one `-t` pair.
struct SourceTunnel {
    listen_port: u16,
    target_port: u16,
    task: tokio::task::JoinHandle<()>,
}

struct AcceptedConn {
    target_port: u16,
    stream: TcpStream,
    peer_addr: std::net::SocketAddr,
}

/// Owns source listeners and all live forwarded connections.
pub struct PortForwardHandler {
    sources: Vec<SourceTunnel>,
    conns: HashMap<u64, ForwardConn>,
    next_conn_id: u64,
    accept_tx: mpsc::UnboundedSender<AcceptedConn>,
    accept_rx: mpsc::UnboundedReceiver<AcceptedConn>,
}

impl PortForwardHandler {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            sources: Vec::new(),
            conns: HashMap::new(),
            next_conn_id: 0,
            accept_tx,
            accept_rx,
        }
    }

    /// Number of live forwarded connections.
    pub fn conn_count(&self) -> usize {
        self.conns.len()
    }

    /// Open a local listener for a source tunnel.
    ///
    /// Bind failures are reported in the response's `error`; the engine
    /// treats them as fatal during setup.
    pub async fn create_source(
        &mut self,
        req: PortForwardSourceRequest,
    ) -> PortForwardSourceResponse {
        let listener = match TcpListener::bind(("127.0.0.1", req.source_port)).await {
            Ok(l) => l,
            Err(e) => {
                return PortForwardSourceResponse {
                    source_port: req.source_port,
                    error: Some(format!("bind 127.0.0.1:{} failed: {e}", req.source_port)),
                };
            }
        };

        info!(
            listen_port = req.source_port,
            target_port = req.destination_port,
            "source tunnel listening"
        );

        let accept_tx = self.accept_tx.clone();
        let target_port = req.destination_port;
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if accept_tx
                            .send(AcceptedConn {
                                target_port,
                                stream,
                                peer_addr,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed on source tunnel");
                    }
                }
            }
        });

        self.sources.push(SourceTunnel {
            listen_port: req.source_port,
            target_port,
            task,
        });

        PortForwardSourceResponse {
            source_port: req.source_port,
            error: None,
        }
    }

    /// Dispatch one port-forward packet from the server.
    pub async fn handle_packet(
        &mut self,
        pkt: &Packet,
        channel: &mut ReliableChannel,
    ) -> Result<()> {
        match pkt.packet_type {
            PacketType::PortForwardSourceResponse => {
                let resp: PortForwardSourceResponse = pkt.record()?;
                match resp.error {
                    Some(err) => warn!(
                        source_port = resp.source_port,
                        error = %err,
                        "remote source tunnel failed"
                    ),
                    None => debug!(source_port = resp.source_port, "remote source tunnel ready"),
                }
                Ok(())
            }
            PacketType::PortForwardDestinationRequest => {
                let req: PortForwardDestinationRequest = pkt.record()?;
                self.handle_destination_request(req, channel).await
            }
            PacketType::PortForwardDestinationResponse => {
                let resp: PortForwardDestinationResponse = pkt.record()?;
                self.handle_destination_response(resp)
            }
            PacketType::PortForwardData => {
                let data: PortForwardData = pkt.record()?;
                self.handle_data(data).await;
                Ok(())
            }
            // The server never asks the client to open a source listener
            other => Err(Error::protocol(format!(
                "unexpected port forward packet at client: {other:?}"
            ))),
        }
    }

    /// A remote listener accepted a connection; dial its local target.
    async fn handle_destination_request(
        &mut self,
        req: PortForwardDestinationRequest,
        channel: &mut ReliableChannel,
    ) -> Result<()> {
        let dial =
            tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(("127.0.0.1", req.port))).await;

        let resp = match dial {
            Ok(Ok(stream)) => {
                let id = self.alloc_conn_id();
                debug!(conn_id = id, peer_id = req.conn_id, port = req.port, "reverse tunnel conn open");
                self.conns.insert(
                    id,
                    ForwardConn::new(
                        id,
                        stream,
                        ForwardDirection::RemoteDestination,
                        Some(req.conn_id),
                    ),
                );
                PortForwardDestinationResponse {
                    conn_id: req.conn_id,
                    socket_id: id,
                    error: None,
                }
            }
            Ok(Err(e)) => PortForwardDestinationResponse {
                conn_id: req.conn_id,
                socket_id: 0,
                error: Some(format!("dial 127.0.0.1:{} failed: {e}", req.port)),
            },
            Err(_) => PortForwardDestinationResponse {
                conn_id: req.conn_id,
                socket_id: 0,
                error: Some(format!("dial 127.0.0.1:{} timed out", req.port)),
            },
        };

        if resp.error.is_some() {
            warn!(port = req.port, error = ?resp.error, "reverse tunnel dial failed");
        }
        channel
            .write_packet(&Packet::from_record(
                PacketType::PortForwardDestinationResponse,
                &resp,
            )?)
            .await
    }

    /// The server answered one of our destination-requests.
    fn handle_destination_response(&mut self, resp: PortForwardDestinationResponse) -> Result<()> {
        use std::collections::hash_map::Entry;

        let Entry::Occupied(mut entry) = self.conns.entry(resp.conn_id) else {
            warn!(conn_id = resp.conn_id, "destination response for unknown conn");
            return Ok(());
        };

        if let Some(err) = resp.error {
            info!(conn_id = resp.conn_id, error = %err, "server could not open destination");
            entry.remove();
            return Ok(());
        }
        if entry.get().peer_id.is_some() {
            return Err(Error::protocol(format!(
                "duplicate destination response for conn {}",
                resp.conn_id
            )));
        }
        debug!(conn_id = resp.conn_id, peer_id = resp.socket_id, "source tunnel conn bound");
        entry.get_mut().peer_id = Some(resp.socket_id);
        Ok(())
    }

    /// Bytes (or end-of-stream) from the server for one of our conns.
    async fn handle_data(&mut self, data: PortForwardData) {
        let Some(conn) = self.conns.get_mut(&data.conn_id) else {
            warn!(conn_id = data.conn_id, "data for unknown conn, dropping");
            return;
        };

        if data.is_eof() {
            debug!(conn_id = data.conn_id, "peer closed forwarded conn");
            // Flush what we can, then release the socket
            if !conn.pending_write.is_empty() {
                use tokio::io::AsyncWriteExt;
                let backlog = std::mem::take(&mut conn.pending_write);
                let _ = conn.stream.write_all(&backlog).await;
            }
            self.conns.remove(&data.conn_id);
            return;
        }

        conn.pending_write.extend_from_slice(&data.buffer);
    }

    /// Non-blocking poll of every listener and connection.
    ///
    /// Collects pending destination-requests for newly accepted conns and
    /// `PortForwardData` frames for readable bytes; the engine sends both
    /// through the channel.
    pub fn update(
        &mut self,
        requests: &mut Vec<PortForwardDestinationRequest>,
        data_out: &mut Vec<PortForwardData>,
    ) {
        // Newly accepted source-tunnel connections
        while let Ok(accepted) = self.accept_rx.try_recv() {
            let id = self.alloc_conn_id();
            debug!(
                conn_id = id,
                peer = %accepted.peer_addr,
                target_port = accepted.target_port,
                "source tunnel accepted conn"
            );
            self.conns.insert(
                id,
                ForwardConn::new(id, accepted.stream, ForwardDirection::LocalSource, None),
            );
            requests.push(PortForwardDestinationRequest {
                port: accepted.target_port,
                conn_id: id,
            });
        }

        let mut dead = Vec::new();
        for conn in self.conns.values_mut() {
            // Flush backlog from the peer to the local socket
            while !conn.pending_write.is_empty() {
                match conn.stream.try_write(&conn.pending_write) {
                    Ok(n) => {
                        conn.pending_write.drain(..n);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(conn_id = conn.id, error = %e, "forward write failed");
                        if let Some(peer_id) = conn.peer_id {
                            data_out.push(PortForwardData::eof(peer_id));
                        }
                        dead.push(conn.id);
                        break;
                    }
                }
            }
            if dead.last() == Some(&conn.id) {
                continue;
            }

            // Drain readable bytes once the conn is bound to a peer
            let Some(peer_id) = conn.peer_id else {
                continue;
            };
            let mut buf = [0u8; FORWARD_BUFFER_SIZE];
            loop {
                match conn.stream.try_read(&mut buf) {
                    Ok(0) => {
                        debug!(conn_id = conn.id, direction = ?conn.direction, "local EOF on forwarded conn");
                        data_out.push(PortForwardData::eof(peer_id));
                        dead.push(conn.id);
                        break;
                    }
                    Ok(n) => {
                        data_out.push(PortForwardData::new(peer_id, buf[..n].to_vec()));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(conn_id = conn.id, error = %e, "forward read failed");
                        data_out.push(PortForwardData::eof(peer_id));
                        dead.push(conn.id);
                        break;
                    }
                }
            }
        }

        for id in dead {
            self.conns.remove(&id);
        }
    }

    /// Drop all listeners and connections.
    pub fn shutdown(&mut self) {
        for source in self.sources.drain(..) {
            debug!(listen_port = source.listen_port, target_port = source.target_port, "closing source tunnel");
            source.task.abort();
        }
        self.conns.clear();
    }

    fn alloc_conn_id(&mut self) -> u64 {
        self.next_conn_id += 1;
        self.next_conn_id
    }
}

impl Default for PortForwardHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PortForwardHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
