//! Integration tests for Veil Tunnel
//!
//! Drives two sessions against each other over in-memory carriers:
//! - single- and multi-carrier echo
//! - per-stream byte integrity under concurrency
//! - carrier failure and pool recovery
//! - session shutdown semantics
//! - config parsing equivalence between the JSON and single-line forms

use ring::digest;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::oneshot;
use tokio::time::timeout;
use veil_tunnel::mux::{MuxError, Session, SessionRole};
use veil_tunnel::obfs::{self, Obfuscator, PlainObfuscator};
use veil_tunnel::ClientState;

const CARRIER_BUF: usize = 256 * 1024;

fn plain() -> Arc<dyn Obfuscator> {
    Arc::new(PlainObfuscator)
}

/// Two sessions joined by `carriers` in-memory pipes.
fn session_pair(carriers: usize) -> (Arc<Session>, Arc<Session>) {
    let (a0, b0) = duplex(CARRIER_BUF);
    let left = Session::new(1, SessionRole::Initiator, a0, plain());
    let right = Session::new(1, SessionRole::Responder, b0, plain());
    for _ in 1..carriers {
        let (a, b) = duplex(CARRIER_BUF);
        left.add_connection(a);
        right.add_connection(b);
    }
    (left, right)
}

async fn read_exact_mux(stream: &veil_tunnel::Stream, want: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(want);
    let mut buf = vec![0u8; 8192];
    while out.len() < want {
        let n = stream.read(&mut buf).await.unwrap();
        assert_ne!(n, 0, "unexpected end of stream");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Single carrier, identity obfuscator: write "hello", peer accepts and
/// reads it back.
#[tokio::test]
async fn test_single_carrier_echo() {
    let (left, right) = session_pair(1);

    let stream = left.open_stream().await.unwrap();
    stream.write_all(b"hello").await.unwrap();

    let accepted = timeout(Duration::from_secs(2), right.accept_stream())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(accepted.id(), stream.id());

    let got = read_exact_mux(&accepted, 5).await;
    assert_eq!(got, b"hello");

    // And the other direction over the same stream
    accepted.write_all(b"world").await.unwrap();
    let got = read_exact_mux(&stream, 5).await;
    assert_eq!(got, b"world");
}

/// Same echo through the AEAD obfuscator on both ends.
#[tokio::test]
async fn test_aead_carrier_echo() {
    let key = [0x42u8; 32];
    let (a, b) = duplex(CARRIER_BUF);
    let left = Session::new(
        1,
        SessionRole::Initiator,
        a,
        obfs::generate(0x02, key).unwrap(),
    );
    let right = Session::new(
        1,
        SessionRole::Responder,
        b,
        obfs::generate(0x02, key).unwrap(),
    );

    let stream = left.open_stream().await.unwrap();
    stream.write_all(b"sealed hello").await.unwrap();

    let accepted = timeout(Duration::from_secs(2), right.accept_stream())
        .await
        .unwrap()
        .unwrap();
    let got = read_exact_mux(&accepted, 12).await;
    assert_eq!(got, b"sealed hello");
}

/// Stream ids from one session are strictly monotonic and distinct, and the
/// initiator/responder halves of the id space never collide.
#[tokio::test]
async fn test_stream_ids_monotonic_and_partitioned() {
    let (left, right) = session_pair(1);

    let mut last = 0;
    for _ in 0..10 {
        let stream = left.open_stream().await.unwrap();
        assert!(stream.id() > last);
        assert_eq!(stream.id() % 2, 1, "initiator ids are odd");
        last = stream.id();
    }

    let peer_stream = right.open_stream().await.unwrap();
    assert_eq!(peer_stream.id() % 2, 0, "responder ids are even");
}

/// Many concurrent streams over several carriers: every stream's bytes
/// arrive intact and in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams_preserve_bytes() {
    const STREAMS: usize = 24;
    const BYTES: usize = 64 * 1024;

    let (left, right) = session_pair(3);

    let acceptor = {
        let right = right.clone();
        tokio::spawn(async move {
            let mut tasks = Vec::new();
            for _ in 0..STREAMS {
                let stream = right.accept_stream().await.unwrap();
                tasks.push(tokio::spawn(async move {
                    let mut ctx = digest::Context::new(&digest::SHA256);
                    let mut buf = vec![0u8; 8192];
                    let mut total = 0usize;
                    loop {
                        let n = stream.read(&mut buf).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        ctx.update(&buf[..n]);
                        total += n;
                    }
                    (stream.id(), total, ctx.finish().as_ref().to_vec())
                }));
            }
            let mut digests = HashMap::new();
            for task in tasks {
                let (id, total, hash) = task.await.unwrap();
                digests.insert(id, (total, hash));
            }
            digests
        })
    };

    let mut writers = Vec::new();
    for _ in 0..STREAMS {
        let stream = left.open_stream().await.unwrap();
        writers.push(tokio::spawn(async move {
            let mut data = vec![0u8; BYTES];
            veil_tunnel::crypto::random_bytes(&mut data);
            let hash = digest::digest(&digest::SHA256, &data).as_ref().to_vec();
            stream.write_all(&data).await.unwrap();
            stream.close().await.unwrap();
            (stream.id(), hash)
        }));
    }

    let mut sent = HashMap::new();
    for writer in writers {
        let (id, hash) = writer.await.unwrap();
        sent.insert(id, hash);
    }

    let received = timeout(Duration::from_secs(30), acceptor)
        .await
        .expect("transfer timed out")
        .unwrap();

    assert_eq!(received.len(), STREAMS);
    for (id, hash) in sent {
        let (total, got) = received.get(&id).expect("stream missing on peer");
        assert_eq!(*total, BYTES, "stream {} byte count", id);
        assert_eq!(*got, hash, "stream {} content hash", id);
    }
}

/// A duplex endpoint with a kill switch: once tripped, every poll fails.
struct KillableIo {
    inner: DuplexStream,
    dead: Arc<AtomicBool>,
}

impl KillableIo {
    fn pair(buf: usize) -> (Self, Self, Arc<AtomicBool>) {
        let dead = Arc::new(AtomicBool::new(false));
        let (a, b) = duplex(buf);
        (
            Self {
                inner: a,
                dead: dead.clone(),
            },
            Self {
                inner: b,
                dead: dead.clone(),
            },
            dead,
        )
    }

    fn check(&self) -> io::Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "carrier killed"))
        } else {
            Ok(())
        }
    }
}

impl AsyncRead for KillableIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Err(e) = self.check() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for KillableIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Err(e) = self.check() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Err(e) = self.check() {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Two carriers; one dies mid-transfer. The stream still completes, and
/// only when the second carrier dies too does the session break.
#[tokio::test(flavor = "multi_thread")]
async fn test_carrier_failure_pool_survives() {
    let (a0, b0, kill0) = KillableIo::pair(CARRIER_BUF);
    let (a1, b1, kill1) = KillableIo::pair(CARRIER_BUF);

    let left = Session::new(1, SessionRole::Initiator, a0, plain());
    let right = Session::new(1, SessionRole::Responder, b0, plain());
    left.add_connection(a1);
    right.add_connection(b1);
    // Let the supervisors move the second carrier into the active set
    tokio::time::sleep(Duration::from_millis(50)).await;

    let chunk1 = vec![0xA1u8; 8 * 1024];
    let chunk2 = vec![0xB2u8; 8 * 1024];

    let stream = left.open_stream().await.unwrap();

    let (drained_tx, drained_rx) = oneshot::channel();
    let reader = {
        let right = right.clone();
        let want_first = chunk1.len();
        tokio::spawn(async move {
            let accepted = right.accept_stream().await.unwrap();
            let first = read_exact_mux(&accepted, want_first).await;
            drained_tx.send(()).unwrap();
            let mut rest = Vec::new();
            let mut buf = vec![0u8; 8192];
            loop {
                let n = accepted.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                rest.extend_from_slice(&buf[..n]);
            }
            (first, rest)
        })
    };

    stream.write_all(&chunk1).await.unwrap();
    // Wait until the peer drained everything so no frame is in flight on
    // the carrier about to die
    timeout(Duration::from_secs(5), drained_rx)
        .await
        .unwrap()
        .unwrap();

    kill0.store(true, Ordering::SeqCst);

    // These writes hit the dead carrier roughly every other attempt; the
    // pool evicts it and retries on the survivor
    for piece in chunk2.chunks(1024) {
        stream.write_all(piece).await.unwrap();
    }
    stream.close().await.unwrap();

    let (first, rest) = timeout(Duration::from_secs(5), reader)
        .await
        .expect("transfer after carrier death timed out")
        .unwrap();
    assert_eq!(first, chunk1);
    assert_eq!(rest, chunk2);

    // Kill the survivor: the pool empties and the session breaks
    kill1.store(true, Ordering::SeqCst);
    let second = left.open_stream().await.unwrap();
    let err = second.write(b"doomed").await.unwrap_err();
    assert!(
        matches!(err, MuxError::NoCarriers | MuxError::BrokenStream | MuxError::BrokenSession),
        "unexpected error: {:?}",
        err
    );
    assert!(left.open_stream().await.is_err());
}

/// Session close unblocks every parked reader, errors all later operations
/// and reports a repeated close.
#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_unblocks_everything() {
    let (left, right) = session_pair(2);

    let mut readers = Vec::new();
    for _ in 0..50 {
        let stream = left.open_stream().await.unwrap();
        readers.push(tokio::spawn(async move {
            let mut buf = [0u8; 32];
            stream.read(&mut buf).await
        }));
    }
    tokio::task::yield_now().await;

    left.close().await.unwrap();

    for reader in readers {
        let res = timeout(Duration::from_secs(2), reader)
            .await
            .expect("read did not unblock")
            .unwrap();
        assert!(res.is_err(), "read must fail after session close");
    }

    assert!(matches!(left.close().await, Err(MuxError::RepeatClose)));
    assert!(matches!(
        left.open_stream().await,
        Err(MuxError::BrokenSession)
    ));
    assert!(matches!(
        timeout(Duration::from_secs(2), left.accept_stream())
            .await
            .expect("accept did not unblock"),
        Err(MuxError::BrokenSession)
    ));

    // The peer sees its carriers drain away and dies as well
    assert!(timeout(Duration::from_secs(2), right.accept_stream())
        .await
        .expect("peer accept did not unblock")
        .is_err());
}

/// A stream closed by the peer reads end-of-stream after the data drains.
#[tokio::test]
async fn test_peer_close_reaches_reader() {
    let (left, right) = session_pair(1);

    let stream = left.open_stream().await.unwrap();
    stream.write_all(b"last words").await.unwrap();
    stream.close().await.unwrap();

    let accepted = timeout(Duration::from_secs(2), right.accept_stream())
        .await
        .unwrap()
        .unwrap();
    let got = read_exact_mux(&accepted, 10).await;
    assert_eq!(got, b"last words");

    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(2), accepted.read(&mut buf))
        .await
        .expect("EOF did not arrive")
        .unwrap();
    assert_eq!(n, 0);
}

/// The JSON file form and the single-line form parse to identical state.
#[tokio::test]
async fn test_config_forms_equivalent() {
    let json = r#"{
        "ServerName": "www.example.com",
        "ProxyMethod": "shadowsocks",
        "EncryptionMethod": "aes",
        "UID": "AAAAAAAAAAAAAAAAAAAAAA==",
        "PublicKey": "aW5zZWN1cmUgdGVzdCBwdWJsaWMga2V5IDMyIGJ5dGU=",
        "TicketTimeHint": 3600,
        "BrowserSig": "chrome",
        "NumConn": 4
    }"#;
    let ssv = "ServerName=www.example.com;ProxyMethod=shadowsocks;EncryptionMethod=aes;\
               UID=AAAAAAAAAAAAAAAAAAAAAA==;\
               PublicKey=aW5zZWN1cmUgdGVzdCBwdWJsaWMga2V5IDMyIGJ5dGU=;\
               TicketTimeHint=3600;BrowserSig=chrome;NumConn=4";

    let path = std::env::temp_dir().join(format!("veil-config-{}.json", std::process::id()));
    std::fs::write(&path, json).unwrap();

    let clock: veil_tunnel::client::ClockFn = Arc::new(SystemTime::now);
    let mut from_file = ClientState::init("127.0.0.1", "1984", "203.0.113.1", "443", clock.clone());
    from_file.parse_config(path.to_str().unwrap()).unwrap();
    std::fs::remove_file(&path).unwrap();

    let mut from_ssv = ClientState::init("127.0.0.1", "1984", "203.0.113.1", "443", clock);
    from_ssv.parse_config(ssv).unwrap();

    assert_eq!(from_file.encryption_method, 0x01);
    assert_eq!(from_file.encryption_method, from_ssv.encryption_method);
    assert_eq!(from_file.server_name, from_ssv.server_name);
    assert_eq!(from_file.proxy_method, from_ssv.proxy_method);
    assert_eq!(from_file.ticket_time_hint, from_ssv.ticket_time_hint);
    assert_eq!(from_file.browser_sig, from_ssv.browser_sig);
    assert_eq!(from_file.num_conn, from_ssv.num_conn);
    assert_eq!(from_file.uid(), from_ssv.uid());
    assert_eq!(
        from_file.static_pub().unwrap().as_bytes(),
        from_ssv.static_pub().unwrap().as_bytes()
    );
}
