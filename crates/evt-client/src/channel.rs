//! Reliable framed channel with reconnection and replay.
//!
//! Provides an ordered packet abstraction over a possibly-reconnecting TCP
//! socket. Every frame written is assigned a send sequence and retained in a
//! bounded replay queue; every frame delivered to the caller advances the
//! receive sequence. When the transport dies, sequences and the replay queue
//! survive, and the next connect performs the resume handshake:
//!
//! - client sends `u16_be id_len || id || u64_be recv_watermark`
//! - server replies `u64_be recv_watermark`
//!
//! Frames acknowledged by the peer's watermark are pruned; frames after it
//! are re-sent in original order before any new packet, so the peer's reader
//! observes the same ordering as if the transport had never failed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use evt_core::constants::{
    CONNECT_TIMEOUT, MAX_CONNECT_ATTEMPTS, MAX_REPLAY_BYTES, RECONNECT_INTERVAL,
};
use evt_core::error::{Error, Result};
use evt_core::protocol::{Codec, Packet, FRAME_HEADER_LEN};
use evt_core::{SessionCredentials, SocketEndpoint};

use crate::transport::TcpTransport;

/// Channel tunables; defaults match production, tests shrink them.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Timeout for one connect attempt (including the resume handshake).
    pub connect_timeout: Duration,
    /// Minimum spacing between reconnect attempts while disconnected.
    pub reconnect_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }
}

/// Reliable ordered packet channel to the everterm server.
pub struct ReliableChannel {
    endpoint: SocketEndpoint,
    credentials: SessionCredentials,
    config: ChannelConfig,

    transport: Option<TcpTransport>,
    send_sequence: u64,
    recv_sequence: u64,
    /// Encoded frames not yet acknowledged by a peer watermark, oldest first.
    unacked_sent: VecDeque<(u64, Bytes)>,
    unacked_bytes: usize,
    /// True once the bounded replay queue had to evict an unacknowledged frame.
    replay_evicted: bool,
    recv_buf: BytesMut,
    shutting_down: bool,

    connect_failures: u32,
    last_connect_attempt: Option<Instant>,
}

impl ReliableChannel {
    pub fn new(endpoint: SocketEndpoint, credentials: SessionCredentials) -> Self {
        Self::with_config(endpoint, credentials, ChannelConfig::default())
    }

    pub fn with_config(
        endpoint: SocketEndpoint,
        credentials: SessionCredentials,
        config: ChannelConfig,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            config,
            transport: None,
            send_sequence: 0,
            recv_sequence: 0,
            unacked_sent: VecDeque::new(),
            unacked_bytes: 0,
            replay_evicted: false,
            recv_buf: BytesMut::new(),
            shutting_down: false,
            connect_failures: 0,
            last_connect_attempt: None,
        }
    }

    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn send_sequence(&self) -> u64 {
        self.send_sequence
    }

    pub fn recv_sequence(&self) -> u64 {
        self.recv_sequence
    }

    /// Establish the transport and perform the resume handshake.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` on a retryable timeout, and
    /// `Err` on any other failure.
    pub async fn connect(&mut self) -> Result<bool> {
        if self.shutting_down {
            return Err(Error::ShuttingDown);
        }

        let mut transport =
            match TcpTransport::connect(&self.endpoint, self.config.connect_timeout).await {
                Ok(t) => t,
                Err(Error::Timeout) => return Ok(false),
                Err(e) => return Err(e),
            };

        let watermark = match tokio::time::timeout(
            self.config.connect_timeout,
            resume_handshake(&mut transport, &self.credentials.id, self.recv_watermark()),
        )
        .await
        {
            Ok(Ok(w)) => w,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("resume handshake timed out");
                return Ok(false);
            }
        };

        self.prune_acknowledged(watermark)?;
        self.replay(&mut transport, watermark).await?;

        self.transport = Some(transport);
        info!(
            endpoint = %self.endpoint,
            watermark,
            replayed = self.unacked_sent.len(),
            "channel connected"
        );
        Ok(true)
    }

    /// Drive reconnection while disconnected, spaced by `reconnect_interval`.
    ///
    /// Three consecutive timeouts surface a fatal transport error; any
    /// non-timeout connect failure is fatal immediately. A success resets
    /// the failure counter.
    pub async fn ensure_connected(&mut self) -> Result<bool> {
        if self.transport.is_some() {
            return Ok(true);
        }
        if self.shutting_down {
            return Err(Error::ShuttingDown);
        }
        if let Some(last) = self.last_connect_attempt {
            if last.elapsed() < self.config.reconnect_interval {
                return Ok(false);
            }
        }
        self.last_connect_attempt = Some(Instant::now());

        match self.connect().await {
            Ok(true) => {
                self.connect_failures = 0;
                Ok(true)
            }
            Ok(false) => {
                self.connect_failures += 1;
                warn!(
                    attempt = self.connect_failures,
                    "connecting to server failed: connect timeout"
                );
                if self.connect_failures >= MAX_CONNECT_ATTEMPTS {
                    Err(Error::Transport {
                        message: format!(
                            "giving up on {} after {} connect timeouts",
                            self.endpoint, self.connect_failures
                        ),
                    })
                } else {
                    Ok(false)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Enqueue a packet for sending.
    ///
    /// The packet is assigned the next send sequence and retained for replay
    /// regardless of transport state; when connected, an immediate send is
    /// attempted and a mid-write failure degrades to disconnected with the
    /// data preserved.
    pub async fn write_packet(&mut self, pkt: &Packet) -> Result<()> {
        if self.shutting_down {
            return Err(Error::ShuttingDown);
        }

        let frame = Codec::encode(pkt)?;
        self.send_sequence += 1;
        self.unacked_bytes += frame.len();
        self.unacked_sent.push_back((self.send_sequence, frame.clone()));

        while self.unacked_bytes > MAX_REPLAY_BYTES {
            if let Some((_, evicted)) = self.unacked_sent.pop_front() {
                self.unacked_bytes -= evicted.len();
                self.replay_evicted = true;
            } else {
                break;
            }
        }

        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.write_all(&frame).await {
                warn!(error = %e, "send failed, dropping transport");
                self.close_and_maybe_reconnect();
            }
        }
        Ok(())
    }

    /// Wait until the transport is readable. Pends forever while disconnected.
    pub async fn readable(&self) -> std::io::Result<()> {
        match &self.transport {
            Some(t) => t.readable().await,
            None => std::future::pending().await,
        }
    }

    /// Non-blocking drain of available transport bytes into the frame buffer.
    ///
    /// Read errors and peer close mark the transport dead; buffered complete
    /// frames stay readable.
    pub fn try_fill(&mut self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        loop {
            match transport.try_read(&mut self.recv_buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    info!(error = %e, "transport read failed, will reconnect");
                    self.close_and_maybe_reconnect();
                    break;
                }
            }
        }
    }

    /// True if at least one complete frame is buffered and decodable.
    pub fn has_data(&self) -> bool {
        Codec::has_frame(&self.recv_buf)
    }

    /// Non-blocking decode of one packet. Advances the receive sequence on
    /// delivery. Codec and unknown-type errors are fatal to the session.
    pub fn read(&mut self) -> Result<Option<Packet>> {
        match Codec::decode(&mut self.recv_buf)? {
            Some(pkt) => {
                self.recv_sequence += 1;
                Ok(Some(pkt))
            }
            None => Ok(None),
        }
    }

    /// Drop the current transport, preserving sequences and the replay queue.
    /// The next liveness tick triggers a fresh connect.
    pub fn close_and_maybe_reconnect(&mut self) {
        if self.transport.take().is_some() {
            info!("transport closed, session state preserved for resume");
        }
        self.truncate_partial_frame();
    }

    /// Begin teardown: no further packets are accepted.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        self.transport = None;
    }

    /// Receive watermark reported during the resume handshake: every frame
    /// contiguously received, whether or not the caller has read it yet.
    fn recv_watermark(&self) -> u64 {
        self.recv_sequence + self.buffered_frames()
    }

    fn buffered_frames(&self) -> u64 {
        let mut count = 0u64;
        let mut offset = 0usize;
        while self.recv_buf.len() >= offset + FRAME_HEADER_LEN {
            let header = &self.recv_buf[offset..offset + FRAME_HEADER_LEN];
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if len == 0 || self.recv_buf.len() < offset + FRAME_HEADER_LEN + len {
                break;
            }
            offset += FRAME_HEADER_LEN + len;
            count += 1;
        }
        count
    }

    /// Discard a trailing partial frame after a transport loss; the peer will
    /// re-send it whole during resume.
    fn truncate_partial_frame(&mut self) {
        let mut offset = 0usize;
        while self.recv_buf.len() >= offset + FRAME_HEADER_LEN {
            let header = &self.recv_buf[offset..offset + FRAME_HEADER_LEN];
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if len == 0 || self.recv_buf.len() < offset + FRAME_HEADER_LEN + len {
                break;
            }
            offset += FRAME_HEADER_LEN + len;
        }
        self.recv_buf.truncate(offset);
    }

    fn prune_acknowledged(&mut self, watermark: u64) -> Result<()> {
        if watermark > self.send_sequence {
            return Err(Error::protocol(format!(
                "peer acknowledged sequence {} beyond our send sequence {}",
                watermark, self.send_sequence
            )));
        }
        while let Some((seq, frame)) = self.unacked_sent.front() {
            if *seq <= watermark {
                self.unacked_bytes -= frame.len();
                self.unacked_sent.pop_front();
            } else {
                break;
            }
        }
        // Everything at or below the watermark is acknowledged, so eviction
        // only matters if a frame the peer still needs is gone.
        if let Some((first, _)) = self.unacked_sent.front() {
            if self.replay_evicted && *first > watermark + 1 {
                return Err(Error::protocol(format!(
                    "replay queue overflowed: peer needs sequence {} but oldest retained is {}",
                    watermark + 1,
                    first
                )));
            }
        } else if self.replay_evicted && watermark < self.send_sequence {
            return Err(Error::protocol(
                "replay queue overflowed: evicted frames were never acknowledged",
            ));
        }
        Ok(())
    }

    async fn replay(&mut self, transport: &mut TcpTransport, watermark: u64) -> Result<()> {
        for (seq, frame) in &self.unacked_sent {
            debug_assert!(*seq > watermark);
            debug!(seq, "replaying frame");
            transport.write_all(frame).await?;
        }
        Ok(())
    }
}

/// Exchange session id and receive watermarks on a fresh transport.
/// Returns the peer's watermark.
async fn resume_handshake(
    transport: &mut TcpTransport,
    id: &str,
    recv_watermark: u64,
) -> Result<u64> {
    let id_bytes = id.as_bytes();
    if id_bytes.len() > u16::MAX as usize {
        return Err(Error::protocol("session id too long"));
    }

    let mut hello = Vec::with_capacity(2 + id_bytes.len() + 8);
    hello.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
    hello.extend_from_slice(id_bytes);
    hello.extend_from_slice(&recv_watermark.to_be_bytes());
    transport.write_all(&hello).await?;

    let mut reply = [0u8; 8];
    transport.read_exact(&mut reply).await?;
    Ok(u64::from_be_bytes(reply))
}
