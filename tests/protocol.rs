//! End-to-end protocol tests over real loopback sockets: authentication
//! outcomes, the full upload round trip, validation rejects, oversized
//! frames, stalled transfers, and session isolation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pestdetect::client::{ClientConfig, ClientConnection, ClientTimeouts};
use pestdetect::common::telemetry::TelemetryReport;
use pestdetect::crypto;
use pestdetect::inference::{EchoEngine, InferenceEngine};
use pestdetect::server::{shutdown_channel, ServerConfig, SessionServer, ShutdownHandle};

const PASSWORD: &str = "jagapadi2024";
const KEY: &[u8] = b"tEaXKE1f8Xe8k3SlVRMGxQAoGIcDAq0C";

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    // Dropping this removes the data directories.
    _data_dir: tempfile::TempDir,
}

async fn spawn_server(
    engine: Arc<dyn InferenceEngine>,
    tune: impl FnOnce(&mut ServerConfig),
) -> TestServer {
    let data_dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        data_dir: data_dir.path().to_string_lossy().to_string(),
        ..ServerConfig::default()
    };
    tune(&mut config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SessionServer::new(config, engine).unwrap());
    let (shutdown, token) = shutdown_channel();
    tokio::spawn(server.serve(listener, token));

    TestServer {
        addr,
        shutdown,
        _data_dir: data_dir,
    }
}

fn client_config(addr: SocketAddr, output_dir: &std::path::Path) -> ClientConfig {
    ClientConfig {
        server_addr: addr.to_string(),
        output_dir: output_dir.to_string_lossy().to_string(),
        timeouts: ClientTimeouts {
            connect_secs: 2,
            socket_secs: 2,
            auth_secs: 2,
            telemetry_secs: 2,
        },
        ..ClientConfig::default()
    }
}

/// Raw socket that speaks just enough of the protocol to probe server
/// behavior the cooperative client cannot trigger.
async fn raw_authenticated(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let digest = crypto::hash_password(PASSWORD);
    stream.write_all(b"AUTH").await.unwrap();
    stream
        .write_all(&(digest.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(digest.as_bytes()).await.unwrap();
    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"AUTH_OK\0");
    stream
}

fn jpeg_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0xFF, 0xD8];
    payload.resize(len, 0x42);
    payload
}

#[tokio::test]
async fn correct_password_authenticates_wrong_password_is_rejected() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;
    let out = tempfile::tempdir().unwrap();

    let mut client = ClientConnection::new(client_config(server.addr, out.path())).unwrap();
    let report = client.connect("wrong-password").await;
    assert!(!report.success);
    assert!(report.message.contains("failed") && report.message.contains("invalid"));
    assert!(!client.authenticated());

    let report = client.connect(PASSWORD).await;
    assert!(report.success, "auth failed: {}", report.message);
    assert!(client.authenticated());
    assert!(report.connect_secs >= 0.0 && report.auth_secs >= 0.0);

    client.disconnect().await;
    server.shutdown.trigger();
}

#[tokio::test]
async fn rejected_client_connection_is_closed() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let digest = crypto::hash_password("not-the-password");
    stream.write_all(b"AUTH").await.unwrap();
    stream
        .write_all(&(digest.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(digest.as_bytes()).await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"AUTH_ERR");
    // Nothing more follows the rejection.
    let mut rest = [0u8; 1];
    assert_eq!(stream.read(&mut rest).await.unwrap(), 0);

    server.shutdown.trigger();
}

#[tokio::test]
async fn silent_server_times_out_authentication() {
    // Accepts the TCP connection but never answers the handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_held, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let out = tempfile::tempdir().unwrap();
    let mut client = ClientConnection::new(client_config(addr, out.path())).unwrap();
    let report = client.connect(PASSWORD).await;
    assert!(!report.success);
    assert!(report.message.contains("timed out"));
    assert!(!client.connected());
}

#[tokio::test]
async fn upload_round_trip_decrypts_to_annotated_image() {
    let engine = Arc::new(EchoEngine::with_labels(vec!["wereng".to_string()], 0.9));
    let server = spawn_server(engine, |_| {}).await;
    let out = tempfile::tempdir().unwrap();

    let mut client = ClientConnection::new(client_config(server.addr, out.path())).unwrap();
    assert!(client.connect(PASSWORD).await.success);

    let payload = jpeg_payload(200 * 1024);
    let report = client.send_image("padi.jpg", &payload).await.unwrap();

    // EchoEngine returns the input bytes as the annotated image.
    assert_eq!(report.plaintext_bytes, payload.len());
    assert_eq!(report.encrypted_bytes, payload.len() + 8);
    assert_eq!(report.format_hint, "JPEG");
    assert!(report.telemetry_acked);
    assert_eq!(std::fs::read(&report.output_path).unwrap(), payload);

    // Several transfers on one connection.
    let second = jpeg_payload(1024);
    let report = client.send_image("padi2.png", &second).await.unwrap();
    assert_eq!(report.plaintext_bytes, second.len());

    client.disconnect().await;
    server.shutdown.trigger();
}

#[tokio::test]
async fn disallowed_extension_gets_no_response() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;
    let out = tempfile::tempdir().unwrap();

    let mut client = ClientConnection::new(client_config(server.addr, out.path())).unwrap();
    assert!(client.connect(PASSWORD).await.success);

    // The server logs the reject and keeps the session; the client's read
    // for the response length runs out.
    let err = client
        .send_image("notes.txt", b"not an image")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));

    server.shutdown.trigger();
}

#[tokio::test]
async fn session_survives_reject_on_raw_socket() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;
    let mut stream = raw_authenticated(server.addr).await;

    // Disallowed extension: no reply, but the session stays up.
    let name = b"notes.txt";
    stream
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&4u32.to_be_bytes()).await.unwrap();
    stream.write_all(name).await.unwrap();
    stream.write_all(b"data").await.unwrap();

    // A valid upload on the same socket still round-trips.
    let payload = jpeg_payload(512);
    let name = b"ok.jpg";
    stream
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(name).await.unwrap();
    stream.write_all(&payload).await.unwrap();

    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let response_len = u32::from_be_bytes(len) as usize;
    assert_eq!(response_len, payload.len() + 8);
    let mut encrypted = vec![0u8; response_len];
    stream.read_exact(&mut encrypted).await.unwrap();
    assert_eq!(crypto::decrypt(KEY, &encrypted).unwrap(), payload);

    server.shutdown.trigger();
}

#[tokio::test]
async fn oversized_declared_payload_closes_connection() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;
    let mut stream = raw_authenticated(server.addr).await;

    stream.write_all(&5u32.to_be_bytes()).await.unwrap();
    // 200 MiB declared; twice the frame ceiling, never buffered.
    stream
        .write_all(&(200u32 * 1024 * 1024).to_be_bytes())
        .await
        .unwrap();

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close, not stall")
        .unwrap();
    assert_eq!(n, 0, "connection must be closed after an oversized header");

    server.shutdown.trigger();
}

#[tokio::test]
async fn stalled_upload_is_dropped_but_slow_progress_is_not() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |config| {
        config.timeouts.socket_secs = 1;
    })
    .await;

    // Slow but steady: chunks arrive within the window, transfer completes.
    let mut steady = raw_authenticated(server.addr).await;
    let payload = jpeg_payload(50 * 1024);
    let name = b"slow.jpg";
    steady
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    steady
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    steady.write_all(name).await.unwrap();
    for chunk in payload.chunks(10 * 1024) {
        steady.write_all(chunk).await.unwrap();
        steady.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    let mut len = [0u8; 4];
    steady.read_exact(&mut len).await.unwrap();
    assert_eq!(u32::from_be_bytes(len) as usize, payload.len() + 8);

    // Stalled mid-payload: the window expires and the server closes.
    let mut stalled = raw_authenticated(server.addr).await;
    stalled
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stalled
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stalled.write_all(name).await.unwrap();
    stalled.write_all(&payload[..10 * 1024]).await.unwrap();

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stalled.read(&mut buf))
        .await
        .expect("server should drop a stalled session")
        .unwrap();
    assert_eq!(n, 0);

    server.shutdown.trigger();
}

#[tokio::test]
async fn concurrent_sessions_are_isolated() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;
    let out_a = tempfile::tempdir().unwrap();
    let out_b = tempfile::tempdir().unwrap();

    let addr = server.addr;
    let payload_a = jpeg_payload(64 * 1024);
    let payload_b = {
        let mut p = jpeg_payload(96 * 1024);
        p[100..200].fill(0x77);
        p
    };

    let (pa, pb) = (payload_a.clone(), payload_b.clone());
    let task_a = tokio::spawn({
        let out = out_a.path().to_path_buf();
        async move {
            let mut client = ClientConnection::new(client_config(addr, &out)).unwrap();
            assert!(client.connect(PASSWORD).await.success);
            let report = client.send_image("a.jpg", &pa).await.unwrap();
            client.disconnect().await;
            report
        }
    });
    let task_b = tokio::spawn({
        let out = out_b.path().to_path_buf();
        async move {
            let mut client = ClientConnection::new(client_config(addr, &out)).unwrap();
            assert!(client.connect(PASSWORD).await.success);
            let report = client.send_image("b.jpg", &pb).await.unwrap();
            client.disconnect().await;
            report
        }
    });

    let report_a = task_a.await.unwrap();
    let report_b = task_b.await.unwrap();
    // Each session gets exactly its own bytes back.
    assert_eq!(std::fs::read(report_a.output_path).unwrap(), payload_a);
    assert_eq!(std::fs::read(report_b.output_path).unwrap(), payload_b);

    server.shutdown.trigger();
}

#[tokio::test]
async fn ping_pong_round_trips() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;
    let out = tempfile::tempdir().unwrap();

    let mut client = ClientConnection::new(client_config(server.addr, out.path())).unwrap();
    assert!(client.connect(PASSWORD).await.success);
    let rtt = client.ping().await.unwrap();
    assert!(rtt < Duration::from_secs(2));

    client.disconnect().await;
    server.shutdown.trigger();
}

#[tokio::test]
async fn idle_session_is_disconnected() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |config| {
        config.timeouts.socket_secs = 1;
    })
    .await;
    let mut stream = raw_authenticated(server.addr).await;

    // Say nothing; the idle window expires and the server hangs up.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should disconnect an idle session")
        .unwrap();
    assert_eq!(n, 0);

    server.shutdown.trigger();
}

#[tokio::test]
async fn telemetry_is_optional_and_tolerant() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;
    let mut stream = raw_authenticated(server.addr).await;

    let payload = jpeg_payload(1024);
    let name = b"quiet.jpg";
    stream
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(name).await.unwrap();
    stream.write_all(&payload).await.unwrap();

    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let mut encrypted = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut encrypted).await.unwrap();

    // Skip telemetry entirely and immediately send another upload; the
    // speculative tag read must not eat the next header.
    stream
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(name).await.unwrap();
    stream.write_all(&payload).await.unwrap();

    stream.read_exact(&mut len).await.unwrap();
    let mut encrypted = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut encrypted).await.unwrap();
    assert_eq!(crypto::decrypt(KEY, &encrypted).unwrap(), payload);

    // This time send telemetry and expect the ACK.
    let report = TelemetryReport {
        filename: "quiet.jpg".to_string(),
        decrypt_time_secs: 0.012,
        result_size_kb: 1.0,
    };
    let body = report.to_bytes().unwrap();
    stream.write_all(b"TIMING").await.unwrap();
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&body).await.unwrap();

    let mut ack = [0u8; 3];
    stream.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"ACK");

    server.shutdown.trigger();
}

#[tokio::test]
async fn header_bytes_straddling_the_telemetry_window_are_not_lost() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;
    let mut stream = raw_authenticated(server.addr).await;

    let payload = jpeg_payload(1024);
    let name = b"first.jpg";
    stream
        .write_all(&(name.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(name).await.unwrap();
    stream.write_all(&payload).await.unwrap();

    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let mut encrypted = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut encrypted).await.unwrap();

    // Send only 3 of the 4 filename-length bytes of the next upload, then
    // stall past the telemetry window. The speculative tag read must hand
    // those bytes back untouched.
    let name = b"second.jpg";
    let header = (name.len() as u32).to_be_bytes();
    stream.write_all(&header[..3]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    stream.write_all(&header[3..]).await.unwrap();
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(name).await.unwrap();
    stream.write_all(&payload).await.unwrap();

    stream.read_exact(&mut len).await.unwrap();
    let mut encrypted = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut encrypted).await.unwrap();
    assert_eq!(crypto::decrypt(KEY, &encrypted).unwrap(), payload);

    server.shutdown.trigger();
}

#[tokio::test]
async fn disconnect_notice_ends_session_cleanly() {
    let server = spawn_server(Arc::new(EchoEngine::new()), |_| {}).await;
    let mut stream = raw_authenticated(server.addr).await;

    stream.write_all(b"DISCONNECT").await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close after a disconnect notice")
        .unwrap();
    assert_eq!(n, 0);

    server.shutdown.trigger();
}
