//! End-to-end: mock serial device -> bridge -> real loopback outputs

use mavlink::MavHeader;
use mavlink::common::{
    ATTITUDE_DATA, HEARTBEAT_DATA, MavAutopilot, MavMessage, MavModeFlag, MavState, MavType,
    VFR_HUD_DATA,
};
use setu_io::output::OutputKind;
use setu_io::transport::MockTransport;
use setu_io::{Bridge, BridgeConfig, MemoryStore, NullSink, OutputConfig, Router, ArduPilotDialect};
use std::io::Read;
use std::net::{TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn frame(msg: &MavMessage, sequence: u8) -> Vec<u8> {
    let header = MavHeader {
        system_id: 1,
        component_id: 1,
        sequence,
    };
    let mut buf = Vec::with_capacity(280);
    mavlink::write_v2_msg(&mut buf, header, msg).unwrap();
    buf
}

fn heartbeat(seq: u8) -> Vec<u8> {
    let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode: MavModeFlag::from_bits_truncate(0x81),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    });
    frame(&msg, seq)
}

fn attitude(roll: f32, seq: u8) -> Vec<u8> {
    let msg = MavMessage::ATTITUDE(ATTITUDE_DATA {
        time_boot_ms: 1_000,
        roll,
        pitch: -0.05,
        yaw: 1.2,
        rollspeed: 0.01,
        pitchspeed: 0.0,
        yawspeed: 0.0,
    });
    frame(&msg, seq)
}

fn vfr_hud(seq: u8) -> Vec<u8> {
    let msg = MavMessage::VFR_HUD(VFR_HUD_DATA {
        airspeed: 12.0,
        groundspeed: 11.5,
        alt: 30.0,
        climb: 0.4,
        heading: 90,
        throttle: 40,
    });
    frame(&msg, seq)
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn udp_listener() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

#[test]
fn test_handshake_and_stream_frames_reach_every_output_in_order() {
    let router = Router::new(Arc::new(MemoryStore::default()));
    let bridge = Bridge::new(
        Arc::clone(&router),
        Arc::new(NullSink),
        Arc::new(ArduPilotDialect),
        BridgeConfig {
            handshake_timeout: Duration::from_secs(1),
            ..BridgeConfig::default()
        },
    );

    let udp_a = udp_listener();
    let udp_b = udp_listener();
    for (id, socket) in [("udp-a", &udp_a), ("udp-b", &udp_b)] {
        let port = socket.local_addr().unwrap().port();
        router
            .add_output(OutputConfig::new(id, OutputKind::Udp, "127.0.0.1", port))
            .unwrap();
    }
    router
        .add_output(OutputConfig::new("tcp", OutputKind::TcpServer, "127.0.0.1", 0))
        .unwrap();

    let tcp_addr = router
        .get_status()
        .outputs
        .iter()
        .find(|o| o.config.id == "tcp")
        .and_then(|o| o.local_addr.clone())
        .unwrap();
    let mut clients: Vec<TcpStream> = (0..2)
        .map(|_| {
            let s = TcpStream::connect(&tcp_addr).unwrap();
            s.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            s
        })
        .collect();
    assert!(wait_for(|| {
        router
            .get_status()
            .outputs
            .iter()
            .any(|o| o.config.id == "tcp" && o.clients == 2)
    }));
    assert_eq!(router.get_status().active, 3);

    let mock = MockTransport::new();
    let handshake = heartbeat(0);
    mock.inject_read(&handshake);
    bridge
        .connect_transport("mock", Box::new(mock.clone()))
        .unwrap();

    let live = vec![attitude(0.1, 1), vfr_hud(2), heartbeat(3)];
    let wire = live.concat();
    // Split mid-frame so reassembly is exercised
    let split = live[0].len() + 7;
    mock.inject_read(&wire[..split]);
    thread::sleep(Duration::from_millis(20));
    mock.inject_read(&wire[split..]);

    // The handshake heartbeat goes out ahead of the live stream
    let frames: Vec<Vec<u8>> = std::iter::once(handshake).chain(live).collect();
    let stream = frames.concat();

    for socket in [&udp_a, &udp_b] {
        let mut buf = [0u8; 512];
        for expected in &frames {
            let n = socket.recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], expected.as_slice());
        }
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        assert!(socket.recv(&mut buf).is_err(), "unexpected extra datagram");
    }

    for client in clients.iter_mut() {
        let mut buf = vec![0u8; stream.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, stream);
    }

    let status = router.get_status();
    for output in &status.outputs {
        assert_eq!(output.stats.tx, 4, "output {}", output.config.id);
        assert_eq!(output.stats.errors, 0);
    }

    let counters = bridge.disconnect().unwrap();
    assert_eq!(counters.frames_in, 4);
    assert_eq!(counters.decode_failures, 0);
    router.stop_all();
}

#[test]
fn test_frames_forwarded_even_when_undecodable() {
    let router = Router::new(Arc::new(MemoryStore::default()));
    let bridge = Bridge::new(
        Arc::clone(&router),
        Arc::new(NullSink),
        Arc::new(ArduPilotDialect),
        BridgeConfig::default(),
    );
    let sink = udp_listener();
    let port = sink.local_addr().unwrap().port();
    router
        .add_output(OutputConfig::new("gcs", OutputKind::Udp, "127.0.0.1", port))
        .unwrap();

    let mock = MockTransport::new();
    let hb = heartbeat(0);
    mock.inject_read(&hb);
    bridge
        .connect_transport("mock", Box::new(mock.clone()))
        .unwrap();

    // Valid framing, corrupted checksum
    let mut bad = attitude(0.5, 9);
    let last = bad.len() - 1;
    bad[last] ^= 0x5A;
    mock.inject_read(&bad);

    let mut buf = [0u8; 128];
    let n = sink.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], hb.as_slice());
    let n = sink.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], bad.as_slice());
    assert!(wait_for(|| bridge.get_status().counters.decode_failures == 1));

    bridge.disconnect().unwrap();
    router.stop_all();
}
