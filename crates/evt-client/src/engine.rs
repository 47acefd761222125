//! The client session engine.
//!
//! One event loop multiplexes the console, the reliable channel, and the
//! port-forward handler: keystrokes become `TerminalBuffer` packets, server
//! packets are dispatched to the console or the forward handler, keepalives
//! track liveness, and terminal resizes propagate as `TerminalInfo`.
//!
//! Lifecycle: Starting -> Connected -> Running -> Draining -> Terminated.
//! Console teardown runs on every exit path after setup, including protocol
//! errors and transport give-up.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use evt_core::constants::{KEEPALIVE_PERIOD, POLL_INTERVAL};
use evt_core::error::{Error, Result};
use evt_core::forward::parse_port_pairs;
use evt_core::protocol::{
    InitialPayload, Packet, PacketType, PortForwardData, PortForwardDestinationRequest,
    PortForwardSourceRequest, TerminalBuffer, TerminalInfo,
};

use crate::channel::ReliableChannel;
use crate::console::Console;
use crate::forward::PortForwardHandler;

/// Engine tunables; defaults match production, tests shrink them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Idle interval after which a keepalive probe is sent.
    pub keepalive: Duration,
    /// Bounded wait of the readiness multiplex.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keepalive: KEEPALIVE_PERIOD,
            poll_interval: POLL_INTERVAL,
        }
    }
}

enum LoopEvent {
    /// Console input bytes, or EOF.
    Console(Option<Bytes>),
    /// The channel transport became readable (or failed readiness).
    ChannelReadable(std::io::Result<()>),
    /// Bounded wait elapsed; run periodic work only.
    Tick,
}

/// The client-side session engine.
///
/// Exclusively owns the channel, the console, and the port-forward handler
/// for the duration of [`run`](Self::run); dropping the engine closes all
/// forwards and their sockets.
pub struct SessionEngine {
    channel: ReliableChannel,
    console: Box<dyn Console>,
    forwards: PortForwardHandler,
    config: EngineConfig,

    run: bool,
    waiting_on_keepalive: bool,
    keepalive_deadline: Instant,
    last_terminal_info: Option<TerminalInfo>,
}

impl SessionEngine {
    pub fn new(channel: ReliableChannel, console: Box<dyn Console>, config: EngineConfig) -> Self {
        let keepalive_deadline = Instant::now() + config.keepalive;
        Self {
            channel,
            console,
            forwards: PortForwardHandler::new(),
            config,
            run: true,
            waiting_on_keepalive: false,
            keepalive_deadline,
            last_terminal_info: None,
        }
    }

    /// Run one session to completion.
    ///
    /// `command` is sent as an initial terminal buffer (with `; exit`
    /// appended) when non-empty; `tunnels` and `reverse_tunnels` are specs
    /// in the grammar of [`parse_port_pairs`].
    pub async fn run(mut self, command: &str, tunnels: &str, reverse_tunnels: &str) -> Result<()> {
        // Initial connect happens before the terminal is disturbed; a
        // failure here needs no teardown.
        self.initial_connect().await?;

        if let Err(e) = self.console.setup() {
            // Raw mode may be partially applied
            self.console.teardown();
            return Err(e);
        }
        let result = self.session(command, tunnels, reverse_tunnels).await;

        self.forwards.shutdown();
        self.channel.shutdown();
        self.console.teardown();
        info!("session terminated");
        result
    }

    async fn initial_connect(&mut self) -> Result<()> {
        loop {
            if self.channel.ensure_connected().await? {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        debug!(endpoint = %self.channel.endpoint(), "initial connection established");

        let payload = InitialPayload {
            jumphost: self.channel.endpoint().jumphost,
        };
        self.channel
            .write_packet(&Packet::from_record(PacketType::InitialPayload, &payload)?)
            .await
    }

    async fn session(&mut self, command: &str, tunnels: &str, reverse_tunnels: &str) -> Result<()> {
        self.startup(command, tunnels, reverse_tunnels).await?;

        while self.run && !self.channel.is_shutting_down() {
            let event = tokio::select! {
                biased;

                input = self.console.read() => LoopEvent::Console(input?),

                ready = self.channel.readable(),
                    if self.channel.is_connected() && !self.channel.has_data() =>
                {
                    LoopEvent::ChannelReadable(ready)
                }

                _ = tokio::time::sleep(self.config.poll_interval) => LoopEvent::Tick,
            };

            if let Err(e) = self.process(event).await {
                if e.is_fatal() {
                    error!(error = %e, "fatal session error");
                    return Err(e);
                }
                warn!(error = %e, "connection closing because of error");
                self.run = false;
            }

            // Transport give-up propagates as fatal
            if !self.channel.is_connected() {
                self.channel.ensure_connected().await?;
            }
        }
        Ok(())
    }

    async fn startup(&mut self, command: &str, tunnels: &str, reverse_tunnels: &str) -> Result<()> {
        if !command.is_empty() {
            info!(command, "sending initial command");
            let tb = TerminalBuffer::new(format!("{command}; exit\n").into_bytes());
            self.send(Packet::from_record(PacketType::TerminalBuffer, &tb)?)
                .await?;
        }

        if !tunnels.is_empty() {
            // Spec violations fail here, before any socket is opened
            let pairs = parse_port_pairs(tunnels)?;
            for pair in pairs {
                let req = PortForwardSourceRequest {
                    source_port: pair.source,
                    destination_port: pair.destination,
                };
                let resp = self.forwards.create_source(req).await;
                if let Some(err) = resp.error {
                    return Err(Error::Forward {
                        message: format!("error establishing port forward: {err}"),
                    });
                }
            }
        }

        if !reverse_tunnels.is_empty() {
            let pairs = parse_port_pairs(reverse_tunnels)?;
            for pair in pairs {
                let req = PortForwardSourceRequest {
                    source_port: pair.source,
                    destination_port: pair.destination,
                };
                self.send(Packet::from_record(
                    PacketType::PortForwardSourceRequest,
                    &req,
                )?)
                .await?;
            }
        }

        Ok(())
    }

    async fn process(&mut self, event: LoopEvent) -> Result<()> {
        match event {
            LoopEvent::Console(Some(data)) => {
                debug!(len = data.len(), "console input");
                let tb = TerminalBuffer::new(data.to_vec());
                self.send(Packet::from_record(PacketType::TerminalBuffer, &tb)?)
                    .await?;
            }
            LoopEvent::Console(None) => {
                info!("console EOF, ending session");
                self.run = false;
            }
            LoopEvent::ChannelReadable(Ok(())) => {
                self.channel.try_fill();
            }
            LoopEvent::ChannelReadable(Err(e)) => {
                info!(error = %e, "transport readiness failed, will reconnect");
                self.channel.close_and_maybe_reconnect();
            }
            LoopEvent::Tick => {}
        }

        self.drain_packets().await?;
        self.tick_keepalive().await?;
        self.poll_terminal_info().await?;
        self.pump_forwards().await?;
        Ok(())
    }

    /// Dispatch every decodable packet. Unknown types are fatal.
    async fn drain_packets(&mut self) -> Result<()> {
        while let Some(pkt) = self.channel.read()? {
            match pkt.packet_type {
                ty if ty.is_port_forward() => {
                    self.refresh_keepalive();
                    self.forwards.handle_packet(&pkt, &mut self.channel).await?;
                }
                PacketType::TerminalBuffer => {
                    let tb: TerminalBuffer = pkt.record()?;
                    self.refresh_keepalive();
                    self.console.write(&tb.buffer).await?;
                }
                PacketType::KeepAlive => {
                    debug!("got a keepalive");
                    self.waiting_on_keepalive = false;
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected packet type from server: {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Liveness: one probe per idle period; a second idle period with the
    /// probe outstanding kills the transport so resume can take over.
    async fn tick_keepalive(&mut self) -> Result<()> {
        if !self.channel.is_connected() {
            // Disconnected: nobody can answer a probe
            self.waiting_on_keepalive = false;
            return Ok(());
        }

        if Instant::now() >= self.keepalive_deadline {
            self.keepalive_deadline = Instant::now() + self.config.keepalive;
            if self.waiting_on_keepalive {
                info!("missed a keepalive, killing connection");
                self.channel.close_and_maybe_reconnect();
                self.waiting_on_keepalive = false;
            } else {
                debug!("writing keepalive packet");
                self.channel.write_packet(&Packet::keep_alive()).await?;
                self.waiting_on_keepalive = true;
            }
        }
        Ok(())
    }

    /// Send at most one `TerminalInfo` per distinct size.
    async fn poll_terminal_info(&mut self) -> Result<()> {
        let info = self.console.terminal_info();
        if self.last_terminal_info != Some(info) {
            info!(rows = info.rows, cols = info.cols, "window size changed");
            self.last_terminal_info = Some(info);
            self.channel
                .write_packet(&Packet::from_record(PacketType::TerminalInfo, &info)?)
                .await?;
        }
        Ok(())
    }

    async fn pump_forwards(&mut self) -> Result<()> {
        let mut requests: Vec<PortForwardDestinationRequest> = Vec::new();
        let mut data: Vec<PortForwardData> = Vec::new();
        self.forwards.update(&mut requests, &mut data);

        for req in requests {
            self.send(Packet::from_record(
                PacketType::PortForwardDestinationRequest,
                &req,
            )?)
            .await?;
        }
        for frame in data {
            self.send(Packet::from_record(PacketType::PortForwardData, &frame)?)
                .await?;
        }
        Ok(())
    }

    /// Write a packet and refresh the liveness deadline.
    async fn send(&mut self, pkt: Packet) -> Result<()> {
        self.channel.write_packet(&pkt).await?;
        self.refresh_keepalive();
        Ok(())
    }

    fn refresh_keepalive(&mut self) {
        self.keepalive_deadline = Instant::now() + self.config.keepalive;
    }
}
