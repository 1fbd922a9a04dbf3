//! End-to-end exchanges: a client context wired to a server session over an
//! in-memory duplex stream, for each framing.

use std::time::{Duration, Instant};

use tokio::io::DuplexStream;

use triplex_modbus::transport::StreamTransport;
use triplex_modbus::{
    errno, DeviceIdentification, ErrorRecovery, ExceptionCode, FrameFormat, GenericModbusClient,
    ModbusClient, ModbusError, ModbusMapping, ModbusTransport, Quirks, ServerSession, TimeoutSpec,
};

type TestClient = GenericModbusClient<StreamTransport<DuplexStream>>;
type TestServer = ServerSession<StreamTransport<DuplexStream>, ModbusMapping>;

/// A client and a server session joined back to back
fn pair(format: FrameFormat, server_id: u8) -> (TestClient, TestServer) {
    let (near, far) = tokio::io::duplex(2048);

    let mut client = GenericModbusClient::new(StreamTransport::new(near), format);
    client.config_mut().response_timeout = TimeoutSpec::from_millis(500).unwrap();

    let mapping = ModbusMapping::new(256, 256, 256, 256);
    let mut server = ServerSession::new(StreamTransport::new(far), format, mapping);
    server.config_mut().slave = server_id;

    (client, server)
}

/// Serve until the client hangs up
fn spawn_server(mut server: TestServer) -> tokio::task::JoinHandle<TestServer> {
    tokio::spawn(async move {
        while server.serve_once().await.is_ok() {}
        server
    })
}

#[tokio::test]
async fn read_holding_registers_over_rtu() {
    let (mut client, mut server) = pair(FrameFormat::Rtu, 17);
    server.backend_mut().holding_registers_mut()[0x6B] = 0x022B;
    server.backend_mut().holding_registers_mut()[0x6C] = 0x0001;
    server.backend_mut().holding_registers_mut()[0x6D] = 0x0064;
    let server = spawn_server(server);

    let values = client.read_03(17, 0x6B, 3).await.unwrap();
    assert_eq!(values, vec![0x022B, 0x0001, 0x0064]);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn illegal_data_address_over_tcp() {
    // Coil extent [0x13, 0x13 + 0x25)
    let (near, far) = tokio::io::duplex(2048);
    let mut client = GenericModbusClient::new(StreamTransport::new(near), FrameFormat::Tcp);
    client.config_mut().response_timeout = TimeoutSpec::from_millis(500).unwrap();

    let mapping = ModbusMapping::with_start_addresses(0x13, 0x25, 0, 0, 0, 0, 0, 0);
    let server = ServerSession::new(StreamTransport::new(far), FrameFormat::Tcp, mapping);
    let server = spawn_server(server);

    let err = client.read_01(1, 0x00FF, 1).await.unwrap_err();
    match err {
        ModbusError::Exception { function, code } => {
            assert_eq!(function, 0x01);
            assert_eq!(code, ExceptionCode::IllegalDataAddress);
        }
        other => panic!("expected an exception, got {:?}", other),
    }
    assert_eq!(err.to_errno(), -2);

    // The session survives an exception: a legal read works afterwards
    let bits = client.read_01(1, 0x13, 0x25).await.unwrap();
    assert_eq!(bits.len(), 0x25);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn bad_crc_is_reported_and_recovered() {
    let (near, far) = tokio::io::duplex(2048);
    let mut client = GenericModbusClient::new(StreamTransport::new(near), FrameFormat::Rtu);
    client.config_mut().response_timeout = TimeoutSpec::from_millis(50).unwrap();
    client.config_mut().recovery = ErrorRecovery::PROTOCOL;

    let mut far = StreamTransport::new(far);
    let peer = tokio::spawn(async move {
        // Valid payload, low CRC byte inverted
        assert!(far.readable(Duration::from_millis(500)).await.unwrap());
        let mut buf = [0u8; 32];
        let _ = far.recv(&mut buf).await.unwrap();

        let mut reply = vec![0x11u8, 0x03, 0x02, 0x12, 0x34];
        let crc = triplex_modbus::crc16(&reply);
        reply.push(!(crc & 0xFF) as u8);
        reply.push((crc >> 8) as u8);
        far.send(&reply).await.unwrap();
        far
    });

    let err = client.read_03(0x11, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::BadChecksum { .. }));
    assert_eq!(err.to_errno(), errno::EBADCRC);
    peer.await.unwrap();
}

#[tokio::test]
async fn short_response_timeout_and_flush_of_the_late_reply() {
    let (near, far) = tokio::io::duplex(2048);
    let mut client = GenericModbusClient::new(StreamTransport::new(near), FrameFormat::Tcp);
    client.config_mut().response_timeout = TimeoutSpec::from_millis(200).unwrap();
    client.config_mut().recovery = ErrorRecovery::PROTOCOL;

    let mut far = StreamTransport::new(far);
    let peer = tokio::spawn(async move {
        // First request: deliberately answer 500 ms late
        assert!(far.readable(Duration::from_millis(1000)).await.unwrap());
        let mut buf = [0u8; 32];
        let _ = far.recv(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        // TID 0, one register
        far.send(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x11, 0x11])
            .await
            .unwrap();

        // Second request (TID 1): answer promptly
        assert!(far.readable(Duration::from_millis(2000)).await.unwrap());
        let mut buf = [0u8; 32];
        let _ = far.recv(&mut buf).await.unwrap();
        far.send(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x22, 0x22])
            .await
            .unwrap();

        // Third request (TID 2): answer promptly
        assert!(far.readable(Duration::from_millis(2000)).await.unwrap());
        let mut buf = [0u8; 32];
        let _ = far.recv(&mut buf).await.unwrap();
        far.send(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x33, 0x33])
            .await
            .unwrap();
    });

    // The late reply must surface as a timeout in roughly the configured
    // budget, not after the server's 500 ms nap
    let started = Instant::now();
    let err = client.read_03(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_millis(450));

    // Let the late reply land in the pipe
    tokio::time::sleep(Duration::from_millis(450)).await;

    // The next exchange sees the late TID-0 frame, rejects it, and protocol
    // recovery flushes it away
    let err = client.read_03(1, 0, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::BadData { .. }));

    // After the flush the session is clean again
    let values = client.read_03(1, 0, 1).await.unwrap();
    assert_eq!(values, vec![0x3333]);
    peer.await.unwrap();
}

#[tokio::test]
async fn broadcast_write_is_applied_and_silent() {
    let (mut client, server) = pair(FrameFormat::Rtu, 17);

    // 37 coils with an alternating-ish pattern
    let bits: Vec<bool> = (0..37).map(|i| i % 3 != 1).collect();

    let server = spawn_server(server);

    // Broadcast returns without blocking on a confirmation
    let started = Instant::now();
    client.write_0f(0, 0x20, &bits).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    // Give the server a beat to apply the side effects, then read them back
    // from the actual server id, byte for byte
    tokio::time::sleep(Duration::from_millis(50)).await;
    let read_back = client.read_01(17, 0x20, 37).await.unwrap();
    assert_eq!(read_back, bits);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn ascii_frame_text_on_the_wire() {
    let (near, far) = tokio::io::duplex(2048);
    let mut client = GenericModbusClient::new(StreamTransport::new(near), FrameFormat::Ascii);
    client.config_mut().response_timeout = TimeoutSpec::from_millis(500).unwrap();

    let mut far = StreamTransport::new(far);
    let peer = tokio::spawn(async move {
        assert!(far.readable(Duration::from_millis(500)).await.unwrap());
        let mut buf = [0u8; 64];
        let n = far.recv(&mut buf).await.unwrap();
        // The exact uppercase-hex frame, LRC included
        assert_eq!(&buf[..n], b":1103006B00037E\r\n");

        // Respond with three registers; the byte sum is 0xAC so the LRC is 0x54
        far.send(b":110306022B0001006454\r\n".as_ref()).await.unwrap();
    });

    let values = client.read_03(0x11, 0x6B, 3).await.unwrap();
    assert_eq!(values, vec![0x022B, 0x0001, 0x0064]);
    peer.await.unwrap();
}

#[tokio::test]
async fn ascii_end_to_end_with_server_session() {
    let (mut client, mut server) = pair(FrameFormat::Ascii, 17);
    server.backend_mut().holding_registers_mut()[0x6B] = 0x022B;
    let server = spawn_server(server);

    let values = client.read_03(17, 0x6B, 1).await.unwrap();
    assert_eq!(values, vec![0x022B]);

    client.write_06(17, 0x10, 0xBEEF).await.unwrap();
    let values = client.read_03(17, 0x10, 1).await.unwrap();
    assert_eq!(values, vec![0xBEEF]);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let (mut client, server) = pair(FrameFormat::Tcp, 1);
    let server = spawn_server(server);

    // Single coil
    client.write_05(1, 7, true).await.unwrap();
    assert_eq!(client.read_01(1, 7, 1).await.unwrap(), vec![true]);
    client.write_05(1, 7, false).await.unwrap();
    assert_eq!(client.read_01(1, 7, 1).await.unwrap(), vec![false]);

    // Multiple registers, byte for byte
    let values: Vec<u16> = (0..42).map(|i| 0x0100 + i as u16).collect();
    client.write_10(1, 0x40, &values).await.unwrap();
    assert_eq!(client.read_03(1, 0x40, values.len() as u16).await.unwrap(), values);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn mask_write_register_law() {
    let (mut client, server) = pair(FrameFormat::Tcp, 1);
    let server = spawn_server(server);

    client.write_06(1, 4, 0x0012).await.unwrap();
    client.mask_write_16(1, 4, 0x00F2, 0x0025).await.unwrap();

    // (0x12 & 0xF2) | (0x25 & !0xF2) = 0x17
    assert_eq!(client.read_03(1, 4, 1).await.unwrap(), vec![0x0017]);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn write_and_read_registers_in_one_transaction() {
    let (mut client, mut server) = pair(FrameFormat::Tcp, 1);
    server.backend_mut().holding_registers_mut()[3] = 0x00AA;
    let server = spawn_server(server);

    let read_back = client
        .read_write_17(1, 3, 2, 14, &[0x0102, 0x0304])
        .await
        .unwrap();
    assert_eq!(read_back, vec![0x00AA, 0x0000]);
    assert_eq!(client.read_03(1, 14, 2).await.unwrap(), vec![0x0102, 0x0304]);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn report_server_id_and_exception_status() {
    let (mut client, mut server) = pair(FrameFormat::Rtu, 17);
    server.backend_mut().set_exception_status(0x2A);
    let server = spawn_server(server);

    let report = client.report_server_id_11(17).await.unwrap();
    assert_eq!(report.server_id, 17);
    assert!(report.running);
    assert!(!report.additional.is_empty());

    let status = client.read_exception_status_07(17).await.unwrap();
    assert_eq!(status, 0x2A);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn device_identification_over_multiple_round_trips() {
    let (near, far) = tokio::io::duplex(4096);
    let mut client = GenericModbusClient::new(StreamTransport::new(near), FrameFormat::Tcp);
    client.config_mut().response_timeout = TimeoutSpec::from_millis(500).unwrap();

    let mut identification = DeviceIdentification::new("Acme Automation", "AMX-4000", "v2.11");
    // Long regular objects force the stream over several transactions
    identification.set_object(0x03, vec![b'u'; 120]);
    identification.set_object(0x04, vec![b'p'; 120]);
    identification.set_object(0x05, vec![b'm'; 120]);

    let mapping = ModbusMapping::new(8, 8, 8, 8);
    let server = ServerSession::new(StreamTransport::new(far), FrameFormat::Tcp, mapping)
        .with_identification(identification);
    let server = spawn_server(server);

    let objects = client.read_device_identification(1, 2).await.unwrap();
    assert_eq!(objects.len(), 6);
    assert_eq!(objects[0], (0x00, b"Acme Automation".to_vec()));
    assert_eq!(objects[3].1.len(), 120);
    assert_eq!(objects[5].1.len(), 120);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn reply_to_broadcast_quirk() {
    let (mut client, mut server) = pair(FrameFormat::Rtu, 17);
    server.config_mut().quirks.insert(Quirks::REPLY_TO_BROADCAST);
    let server = spawn_server(server);

    // With the quirk the server answers even a broadcast; the client still
    // does not wait for it, so the reply sits in the pipe and is flushed
    // before the next exchange
    client.write_06(0, 3, 0x0042).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.read_03(17, 3, 1).await.unwrap(), vec![0x0042]);

    client.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn tid_streams_are_independent_per_context() {
    let (mut client_a, server_a) = pair(FrameFormat::Tcp, 1);
    let (mut client_b, server_b) = pair(FrameFormat::Tcp, 1);
    let server_a = spawn_server(server_a);
    let server_b = spawn_server(server_b);

    // Interleave: A, A, B. Each context counts on its own.
    client_a.write_06(1, 0, 1).await.unwrap();
    client_a.write_06(1, 0, 2).await.unwrap();
    client_b.write_06(1, 0, 3).await.unwrap();

    let stats_a = client_a.get_stats();
    let stats_b = client_b.get_stats();
    assert_eq!(stats_a.frames_sent, 2);
    assert_eq!(stats_b.frames_sent, 1);

    client_a.close().await.unwrap();
    client_b.close().await.unwrap();
    server_a.await.unwrap();
    server_b.await.unwrap();
}
