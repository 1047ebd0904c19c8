use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use spa_server::network::{HEADER_SIZE, LENGTH_OFFSET};
use spa_server::{
    encode_frame, AppError, AppResult, ClientHandle, DispatchStrategy, MessageHandler,
    ServerConfig, SessionListener, SpaFrame, SpaServer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Echoes frames back, reports each payload, fails on payloads starting with `!`
/// and stalls on payloads starting with `#`.
struct EchoHandler {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    disconnected: mpsc::UnboundedSender<u64>,
}

impl SessionListener for EchoHandler {
    fn on_connect(&self, _client: &Arc<ClientHandle>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }
    fn on_disconnect(&self, client: &Arc<ClientHandle>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let _ = self.disconnected.send(client.connection_id());
    }
}

impl MessageHandler for EchoHandler {
    async fn handle(&self, frame: SpaFrame, client: Arc<ClientHandle>) -> AppResult<()> {
        let _ = self.frames.send(frame.payload().to_vec());
        if frame.payload().first() == Some(&b'!') {
            return Err(AppError::Handler("rejected payload".into()));
        }
        if frame.payload().first() == Some(&b'#') {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        client.send(frame.as_bytes()).await
    }
}

struct Harness {
    server: SpaServer<EchoHandler>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    disconnected: mpsc::UnboundedReceiver<u64>,
}

fn harness(strategy: DispatchStrategy) -> Harness {
    let mut config = ServerConfig::default();
    config.network.ip = "127.0.0.1".to_string();
    config.network.port = 0;
    config.network.recv_buffer_size = 32;
    config.dispatch.strategy = strategy;
    config.dispatch.pool_size = 2;
    config.dispatch.drain_timeout_ms = 1_000;

    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (disconnected_tx, disconnected) = mpsc::unbounded_channel();
    let handler = EchoHandler {
        frames: frames_tx,
        connects: AtomicUsize::new(0),
        disconnects: AtomicUsize::new(0),
        disconnected: disconnected_tx,
    };
    Harness {
        server: SpaServer::new(config, handler),
        frames,
        disconnected,
    }
}

async fn read_exact_frame(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("reply timed out")
        .unwrap();
    buf
}

#[rstest]
#[case(DispatchStrategy::PerMessage)]
#[case(DispatchStrategy::WorkerPool)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_split_across_reads(#[case] strategy: DispatchStrategy) {
    let mut h = harness(strategy);
    let addr = h.server.start().await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // 80 byte frame written as 50 + 30
    let frame = encode_frame(b"TERM01", &[7u8; 12]).unwrap();
    assert_eq!(frame.len(), 80);
    stream.write_all(&frame[..50]).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.frames.try_recv().is_err());
    stream.write_all(&frame[50..]).await.unwrap();

    let reply = read_exact_frame(&mut stream, 80).await;
    assert_eq!(&reply[..], &frame[..]);
    assert_eq!(timeout(WAIT, h.frames.recv()).await.unwrap().unwrap(), vec![7u8; 12]);

    h.server.stop().await;
}

#[rstest]
#[case(DispatchStrategy::PerMessage)]
#[case(DispatchStrategy::WorkerPool)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipelined_frames_keep_order(#[case] strategy: DispatchStrategy) {
    let h = harness(strategy);
    let addr = h.server.start().await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let frames: Vec<_> = (0..30u8)
        .map(|i| encode_frame(&[], &vec![i; 1 + (i as usize * 7) % 90]).unwrap())
        .collect();
    let wire: Vec<u8> = frames.iter().flat_map(|f| f.to_vec()).collect();
    stream.write_all(&wire).await.unwrap();

    for frame in &frames {
        let reply = read_exact_frame(&mut stream, frame.len()).await;
        assert_eq!(&reply[..], &frame[..]);
    }
    h.server.stop().await;
}

#[tokio::test]
async fn test_malformed_header_disconnects() {
    let mut h = harness(DispatchStrategy::WorkerPool);
    let addr = h.server.start().await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let good = encode_frame(&[], b"ok").unwrap();
    let mut bad = vec![0u8; HEADER_SIZE];
    bad[LENGTH_OFFSET..LENGTH_OFFSET + 2].copy_from_slice(&0i16.to_le_bytes());
    stream.write_all(&good).await.unwrap();
    let reply = read_exact_frame(&mut stream, good.len()).await;
    assert_eq!(&reply[..], &good[..]);

    stream.write_all(&bad).await.unwrap();
    timeout(WAIT, h.disconnected.recv()).await.unwrap().unwrap();
    let mut rest = Vec::new();
    let n = timeout(WAIT, stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(h.frames.try_recv().unwrap(), b"ok".to_vec());
    assert!(h.frames.try_recv().is_err());
    h.server.stop().await;
}

#[tokio::test]
async fn test_handler_error_keeps_connection() {
    let h = harness(DispatchStrategy::PerMessage);
    let addr = h.server.start().await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let rejected = encode_frame(&[], b"!bad").unwrap();
    let accepted = encode_frame(&[], b"good").unwrap();
    stream.write_all(&rejected).await.unwrap();
    stream.write_all(&accepted).await.unwrap();

    let reply = read_exact_frame(&mut stream, accepted.len()).await;
    assert_eq!(&reply[..], &accepted[..]);
    assert_eq!(h.server.registry().len(), 1);
    h.server.stop().await;
}

#[tokio::test]
async fn test_callbacks_once_per_connection() {
    let mut h = harness(DispatchStrategy::WorkerPool);
    let addr = h.server.start().await.unwrap();

    let first = TcpStream::connect(addr).await.unwrap();
    let second = TcpStream::connect(addr).await.unwrap();
    let mut probe = second;
    // round trip guarantees the second connection is registered
    let frame = encode_frame(&[], b"x").unwrap();
    probe.write_all(&frame).await.unwrap();
    read_exact_frame(&mut probe, frame.len()).await;

    drop(first);
    timeout(WAIT, h.disconnected.recv()).await.unwrap().unwrap();
    assert_eq!(h.server.registry().len(), 1);

    h.server.stop().await;
    timeout(WAIT, h.disconnected.recv()).await.unwrap().unwrap();
    assert!(h.server.registry().is_empty());

    // stop drops the remaining connection
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, probe.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_lifecycle_is_idempotent() {
    let h = harness(DispatchStrategy::WorkerPool);
    assert!(!h.server.is_listening());
    h.server.stop().await;

    let addr = h.server.start().await.unwrap();
    assert!(h.server.is_listening());
    assert_eq!(h.server.start().await.unwrap(), addr);
    assert_eq!(h.server.local_addr().await, Some(addr));

    h.server.stop().await;
    h.server.stop().await;
    assert!(!h.server.is_listening());
    assert!(TcpStream::connect(addr).await.is_err());

    // restart after stop binds again
    let addr = h.server.start().await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let frame = encode_frame(&[], b"again").unwrap();
    stream.write_all(&frame).await.unwrap();
    read_exact_frame(&mut stream, frame.len()).await;
    h.server.stop().await;
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let h = harness(DispatchStrategy::WorkerPool);
    let addr = h.server.start().await.unwrap();

    let mut config = ServerConfig::default();
    config.network.ip = "127.0.0.1".to_string();
    config.network.port = addr.port();
    let (frames, _) = mpsc::unbounded_channel();
    let (disconnected, _) = mpsc::unbounded_channel();
    let other = SpaServer::new(
        config,
        EchoHandler {
            frames,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            disconnected,
        },
    );
    // SO_REUSEADDR does not allow two listeners on the same port
    let err = other.start().await.unwrap_err();
    assert!(matches!(err, AppError::Bind(..)));
    assert!(!other.is_listening());

    h.server.stop().await;
    other.start().await.unwrap();
    assert!(other.is_listening());
    other.stop().await;
}

#[tokio::test]
async fn test_oversized_frame_disconnects() {
    let mut h = harness(DispatchStrategy::PerMessage);
    let mut config = h.server.config().clone();
    config.network.max_frame_size = 128;
    let (frames, _) = mpsc::unbounded_channel();
    let (disconnected_tx, disconnected) = mpsc::unbounded_channel();
    h.server = SpaServer::new(
        config,
        EchoHandler {
            frames,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            disconnected: disconnected_tx,
        },
    );
    h.disconnected = disconnected;

    let addr = h.server.start().await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let frame = encode_frame(&[], &[1u8; 200]).unwrap();
    stream.write_all(&frame[..HEADER_SIZE]).await.unwrap();

    timeout(WAIT, h.disconnected.recv()).await.unwrap().unwrap();
    assert!(h.server.registry().is_empty());
    h.server.stop().await;
}

#[rstest]
#[case(DispatchStrategy::PerMessage)]
#[case(DispatchStrategy::WorkerPool)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_is_bounded_by_drain_timeout(#[case] strategy: DispatchStrategy) {
    let mut h = harness(strategy);
    let addr = h.server.start().await.unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let stalled = encode_frame(&[], b"#stall").unwrap();
    let queued = encode_frame(&[], b"next").unwrap();
    stream.write_all(&stalled).await.unwrap();
    stream.write_all(&queued).await.unwrap();
    assert_eq!(
        timeout(WAIT, h.frames.recv()).await.unwrap().unwrap(),
        b"#stall".to_vec()
    );

    // one drain_timeout_ms (1s) covers both connection handlers and the dispatcher
    let started = tokio::time::Instant::now();
    h.server.stop().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1_500), "{:?}", elapsed);
    assert!(!h.server.is_listening());
}
