//! End-to-end session engine tests against an in-process mock server.

use std::time::Duration;

use evt_client::{ChannelConfig, EngineConfig, ReliableChannel, SessionEngine};
use evt_core::error::Error;
use evt_core::protocol::{
    Packet, PacketType, PortForwardData, PortForwardDestinationRequest,
    PortForwardDestinationResponse, TerminalBuffer, TerminalInfo,
};
use evt_core::{SessionCredentials, SocketEndpoint};
use evt_test_utils::{pipe_console, MockServer};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn credentials() -> SessionCredentials {
    SessionCredentials::new("e2e-session", &[0x55; 32]).unwrap()
}

fn engine_for(server: &MockServer, console: Box<dyn evt_client::Console>) -> SessionEngine {
    let channel = ReliableChannel::with_config(
        SocketEndpoint::new("127.0.0.1", server.port(), false),
        credentials(),
        ChannelConfig {
            connect_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_millis(20),
        },
    );
    SessionEngine::new(
        channel,
        console,
        EngineConfig {
            keepalive: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
        },
    )
}

/// A block of localhost ports unlikely to collide across parallel tests.
/// Each test uses a distinct offset within the process's 8-port block.
fn port_base(offset: u16) -> u16 {
    39000 + (std::process::id() % 400) as u16 * 8 + offset
}

#[tokio::test]
async fn echo_command_sends_one_buffer_with_exit_suffix() {
    let server = MockServer::start(true).await;
    let (console, mut handle) = pipe_console();
    let engine = engine_for(&server, Box::new(console));

    let task = tokio::spawn(engine.run("echo hi", "", ""));

    // Initial payload, the command buffer, and the first terminal info
    server.wait_for_packets(3).await;
    let received = server.received();
    assert_eq!(received[0].packet_type, PacketType::InitialPayload);
    assert_eq!(received[1].packet_type, PacketType::TerminalBuffer);

    let buffers = server.received_of(PacketType::TerminalBuffer);
    assert_eq!(buffers.len(), 1);
    let tb: TerminalBuffer = buffers[0].record().unwrap();
    assert_eq!(tb.buffer, b"echo hi; exit\n");

    // Remote side is done; the console reports EOF and the session ends
    handle.close_input().await;
    task.await.unwrap().unwrap();

    assert!(handle.was_set_up());
    assert!(handle.was_torn_down());
    assert_eq!(server.received_of(PacketType::TerminalBuffer).len(), 1);
}

#[tokio::test]
async fn resize_sends_one_terminal_info_per_distinct_value() {
    let server = MockServer::start(true).await;
    let (console, mut handle) = pipe_console();
    let engine = engine_for(&server, Box::new(console));

    let task = tokio::spawn(engine.run("", "", ""));
    server.wait_for_packets(2).await;

    // The 24x80 startup value went out once
    let infos = server.received_of(PacketType::TerminalInfo);
    assert_eq!(infos.len(), 1);
    let initial: TerminalInfo = infos[0].record().unwrap();
    assert_eq!((initial.rows, initial.cols), (24, 80));

    // Resize to 40x120
    handle.set_terminal_info(TerminalInfo {
        rows: 40,
        cols: 120,
        pixel_width: 0,
        pixel_height: 0,
    });

    server.wait_for_packets(3).await;
    let infos = server.received_of(PacketType::TerminalInfo);
    assert_eq!(infos.len(), 2);
    let resized: TerminalInfo = infos[1].record().unwrap();
    assert_eq!((resized.rows, resized.cols), (40, 120));

    // Identical polls must not produce further packets
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.received_of(PacketType::TerminalInfo).len(), 2);

    handle.close_input().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn terminal_input_flows_in_order_across_a_disconnect() {
    let server = MockServer::start(true).await;
    let (console, mut handle) = pipe_console();
    let engine = engine_for(&server, Box::new(console));

    let task = tokio::spawn(engine.run("", "", ""));
    server.wait_for_packets(2).await;

    // Seven keystroke packets delivered over the first connection; waiting
    // for each keeps every write in its own packet
    for i in 1..=7u8 {
        handle.write_input(&[b'0' + i]).await;
        while server.received_of(PacketType::TerminalBuffer).len() < i as usize {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // Kill the transport, then keep typing while disconnected
    server.drop_connection();
    handle.write_input(b"8").await;

    // The client resumes and replays; the server must observe #8 exactly once
    server.wait_for_connections(2).await;
    while server.received_of(PacketType::TerminalBuffer).len() < 8 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let buffers: Vec<Vec<u8>> = server
        .received_of(PacketType::TerminalBuffer)
        .iter()
        .map(|p| p.record::<TerminalBuffer>().unwrap().buffer)
        .collect();
    assert_eq!(
        buffers,
        vec![
            b"1".to_vec(),
            b"2".to_vec(),
            b"3".to_vec(),
            b"4".to_vec(),
            b"5".to_vec(),
            b"6".to_vec(),
            b"7".to_vec(),
            b"8".to_vec(),
        ],
        "no gaps, no duplicates, original order"
    );

    handle.close_input().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn double_missed_keepalive_forces_reconnect() {
    // Server never answers keepalives
    let server = MockServer::start(false).await;
    let (console, mut handle) = pipe_console();

    let channel = ReliableChannel::with_config(
        SocketEndpoint::new("127.0.0.1", server.port(), false),
        credentials(),
        ChannelConfig {
            connect_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_millis(30),
        },
    );
    let engine = SessionEngine::new(
        channel,
        Box::new(console),
        EngineConfig {
            keepalive: Duration::from_millis(60),
            poll_interval: Duration::from_millis(5),
        },
    );

    let task = tokio::spawn(engine.run("", "", ""));
    server.wait_for_connections(1).await;

    // One idle period -> one probe; a second idle period with the probe
    // outstanding -> the client kills the transport and resumes.
    server.wait_for_connections(2).await;
    assert_eq!(
        server.received_of(PacketType::KeepAlive).len(),
        1,
        "exactly one probe was in flight before the reconnect"
    );

    handle.close_input().await;
    task.await.unwrap().unwrap();
    assert!(handle.was_torn_down());
}

#[tokio::test]
async fn unknown_packet_type_is_fatal_and_still_tears_down() {
    let server = MockServer::start(true).await;
    let (console, handle) = pipe_console();
    let engine = engine_for(&server, Box::new(console));

    let task = tokio::spawn(engine.run("", "", ""));
    server.wait_for_packets(2).await;

    // Frame with an unregistered type code
    server.send_raw(vec![0, 0, 0, 1, 0xEE]);

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Protocol { .. }));
    assert!(handle.was_torn_down());
}

#[tokio::test]
async fn bad_tunnel_range_fails_before_any_socket_opens() {
    let server = MockServer::start(true).await;
    let (console, handle) = pipe_console();
    let engine = engine_for(&server, Box::new(console));

    let listen_port = port_base(0);
    let spec = format!("{}-{}:80-81", listen_port, listen_port + 2);
    let err = engine.run("", &spec, "").await.unwrap_err();
    assert!(matches!(err, Error::Config { .. }));

    // The mismatched range was rejected before binding anything
    assert!(TcpStream::connect(("127.0.0.1", listen_port)).await.is_err());
    assert!(handle.was_torn_down());
}

#[tokio::test]
async fn tunnel_range_creates_each_pair() {
    let server = MockServer::start(true).await;
    let (console, mut handle) = pipe_console();
    let engine = engine_for(&server, Box::new(console));

    let base = port_base(4);
    let spec = format!("{}-{}:80-82", base, base + 2);
    let task = tokio::spawn(async move { engine.run("", &spec, "").await });
    server.wait_for_packets(2).await;

    // Middle port of the range is listening and maps to destination 81
    let _conn = TcpStream::connect(("127.0.0.1", base + 1)).await.unwrap();
    let mut requests;
    loop {
        requests = server.received_of(PacketType::PortForwardDestinationRequest);
        if !requests.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let req: PortForwardDestinationRequest = requests[0].record().unwrap();
    assert_eq!(req.port, 81);

    handle.close_input().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn forwarded_bytes_roundtrip_exactly() {
    let server = MockServer::start(true).await;
    let (console, mut handle) = pipe_console();
    let engine = engine_for(&server, Box::new(console));

    let listen_port = port_base(7);
    let spec = format!("{listen_port}:9999");
    let task = tokio::spawn(async move { engine.run("", &spec, "").await });
    server.wait_for_packets(2).await;

    let mut local = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    // The accept produces a destination request; bind it to server id 4242
    let req: PortForwardDestinationRequest = loop {
        let requests = server.received_of(PacketType::PortForwardDestinationRequest);
        if let Some(pkt) = requests.first() {
            break pkt.record().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(req.port, 9999);
    server.send(
        Packet::from_record(
            PacketType::PortForwardDestinationResponse,
            &PortForwardDestinationResponse {
                conn_id: req.conn_id,
                socket_id: 4242,
                error: None,
            },
        )
        .unwrap(),
    );
    // Let the response land before pushing bytes
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Local bytes arrive tagged with the server's id
    local.write_all(b"ping").await.unwrap();
    let data: PortForwardData = loop {
        let frames = server.received_of(PacketType::PortForwardData);
        if let Some(pkt) = frames.first() {
            break pkt.record().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(data.conn_id, 4242);
    assert_eq!(data.buffer, b"ping");

    // Server bytes tagged with the client's id land on the local socket
    server.send(
        Packet::from_record(
            PacketType::PortForwardData,
            &PortForwardData::new(req.conn_id, b"pong".to_vec()),
        )
        .unwrap(),
    );
    let mut buf = [0u8; 16];
    let n = local.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"pong");

    // Closing the local side signals end-of-stream to the peer
    drop(local);
    loop {
        let frames = server.received_of(PacketType::PortForwardData);
        if frames
            .iter()
            .any(|p| p.record::<PortForwardData>().unwrap().is_eof())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    handle.close_input().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn reverse_tunnel_dials_local_target() {
    let server = MockServer::start(true).await;
    let (console, mut handle) = pipe_console();
    let engine = engine_for(&server, Box::new(console));

    // A local service the reverse tunnel should reach
    let target = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();

    let spec = format!("18000:{target_port}");
    let task = tokio::spawn(async move { engine.run("", "", &spec).await });
    server.wait_for_packets(3).await;

    // The reverse spec went out as a source request
    let sources = server.received_of(PacketType::PortForwardSourceRequest);
    assert_eq!(sources.len(), 1);

    // A remote accept arrives as a destination request; the client dials us
    server.send(
        Packet::from_record(
            PacketType::PortForwardDestinationRequest,
            &PortForwardDestinationRequest {
                port: target_port,
                conn_id: 900,
            },
        )
        .unwrap(),
    );
    let (mut local_end, _) = target.accept().await.unwrap();

    let resp: PortForwardDestinationResponse = loop {
        let frames = server.received_of(PacketType::PortForwardDestinationResponse);
        if let Some(pkt) = frames.first() {
            break pkt.record().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(resp.conn_id, 900);
    assert!(resp.error.is_none());

    // Bytes pump symmetrically: server -> target and target -> server
    server.send(
        Packet::from_record(
            PacketType::PortForwardData,
            &PortForwardData::new(resp.socket_id, b"from-remote".to_vec()),
        )
        .unwrap(),
    );
    let mut buf = [0u8; 32];
    let n = local_end.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"from-remote");

    local_end.write_all(b"from-target").await.unwrap();
    let data: PortForwardData = loop {
        let frames = server.received_of(PacketType::PortForwardData);
        if let Some(pkt) = frames.iter().find(|p| {
            p.record::<PortForwardData>()
                .map(|d| !d.is_eof() && d.conn_id == 900)
                .unwrap_or(false)
        }) {
            break pkt.record().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(data.buffer, b"from-target");

    handle.close_input().await;
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn server_output_reaches_the_console() {
    let server = MockServer::start(true).await;
    let (console, mut handle) = pipe_console();
    let engine = engine_for(&server, Box::new(console));

    let task = tokio::spawn(engine.run("", "", ""));
    server.wait_for_packets(2).await;

    server.send(
        Packet::from_record(
            PacketType::TerminalBuffer,
            &TerminalBuffer::new(b"login banner".to_vec()),
        )
        .unwrap(),
    );

    let output = handle.read_output().await;
    assert_eq!(output, b"login banner");

    handle.close_input().await;
    task.await.unwrap().unwrap();
}
