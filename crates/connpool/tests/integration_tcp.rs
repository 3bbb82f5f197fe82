//! Pooled TCP connections against a mock line-protocol server.
//!
//! The test stack: `PoolManager` → `TcpConnectorFactory` → TCP → `MockServer`

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use connpool::{
    CheckinOutcome, ManagerSettings, PoolConfig, PoolError, PoolManager, TcpConnection,
    TcpConnectorFactory,
};

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── MockServer ───────────────────────────────────────────────────

/// Answers `PING\r\n` with `+PONG\r\n` and echoes any other line.
/// Counts accepted and finished connections.
struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl MockServer {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let (acc, fin) = (Arc::clone(&accepted), Arc::clone(&finished));
        thread::spawn(move || {
            while let Ok((stream, _)) = listener.accept() {
                acc.fetch_add(1, Ordering::SeqCst);
                let fin = Arc::clone(&fin);
                thread::spawn(move || {
                    Self::handle_connection(stream);
                    fin.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            accepted,
            finished,
        }
    }

    fn handle_connection(stream: TcpStream) {
        let Ok(mut writer) = stream.try_clone() else {
            return;
        };
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    let reply = if line == "PING\r\n" {
                        "+PONG\r\n".to_string()
                    } else {
                        line.clone()
                    };
                    if writer.write_all(reply.as_bytes()).is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn address(&self) -> String {
        self.addr.to_string()
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

/// An address nothing listens on.
fn refused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr.to_string()
}

fn ping(conn: &mut TcpConnection) -> String {
    conn.write_all(b"PING\r\n").expect("write ping");
    let mut buf = [0u8; 7];
    conn.read_exact(&mut buf).expect("read pong");
    String::from_utf8_lossy(&buf).into_owned()
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn test_config() -> PoolConfig {
    PoolConfig::default()
        .with_capacity(2)
        .with_connect_timeout(Duration::from_secs(2))
        .with_rw_timeout(Duration::from_secs(2))
}

// ── Tests ────────────────────────────────────────────────────────

#[test]
fn pooled_connection_is_reused() {
    init_tracing();
    let server = MockServer::start();
    let mgr = PoolManager::tcp(test_config());

    for _ in 0..5 {
        let mut conn = mgr.checkout(&server.address()).unwrap();
        assert_eq!(ping(&mut conn), "+PONG\r\n");
        assert_eq!(mgr.checkin(conn, true).unwrap(), CheckinOutcome::Idle);
    }

    assert_eq!(server.accepted(), 1);
    let stats = &mgr.stats()[0];
    assert_eq!(stats.opened, 1);
    assert_eq!(stats.total_used, 5);
    assert_eq!(stats.idle, 1);
}

#[test]
fn discarded_connection_is_closed_on_the_wire() {
    init_tracing();
    let server = MockServer::start();
    let mgr = PoolManager::tcp(test_config());

    let mut conn = mgr.checkout(&server.address()).unwrap();
    assert_eq!(ping(&mut conn), "+PONG\r\n");
    assert_eq!(mgr.checkin(conn, false).unwrap(), CheckinOutcome::Discarded);
    assert!(wait_for(|| server.finished() == 1));

    let mut conn = mgr.checkout(&server.address()).unwrap();
    assert_eq!(ping(&mut conn), "+PONG\r\n");
    mgr.checkin(conn, true).unwrap();
    assert!(wait_for(|| server.accepted() == 2));
}

#[test]
fn saturated_endpoint_refuses_without_connecting() {
    init_tracing();
    let server = MockServer::start();
    let mgr = PoolManager::tcp(test_config());

    let a = mgr.checkout(&server.address()).unwrap();
    let b = mgr.checkout(&server.address()).unwrap();
    let err = mgr.checkout(&server.address()).unwrap_err();
    assert!(matches!(err, PoolError::CapacityExceeded { capacity: 2, .. }));
    assert!(mgr.get(&server.address()).unwrap().is_alive());
    assert!(wait_for(|| server.accepted() == 2));

    mgr.checkin(a, true).unwrap();
    mgr.checkin(b, true).unwrap();
}

#[test]
fn refused_endpoint_backs_off() {
    init_tracing();
    let address = refused_address();
    let mgr = PoolManager::tcp(test_config().with_retry_interval(Some(Duration::from_millis(100))));

    let first = mgr.checkout(&address).unwrap_err();
    assert!(first.is_connect_failure());
    assert_eq!(first.address(), Some(address.as_str()));

    // Within the retry interval: refused without a connection attempt.
    let second = mgr.checkout(&address).unwrap_err();
    assert!(matches!(second, PoolError::EndpointDead { cause: None, .. }));
    assert_eq!(mgr.stats()[0].connect_failures, 1);

    thread::sleep(Duration::from_millis(150));
    let probe = mgr.checkout(&address).unwrap_err();
    assert!(probe.is_connect_failure());
    assert_eq!(mgr.stats()[0].connect_failures, 2);
}

#[test]
fn dead_endpoint_does_not_block_healthy_one() {
    init_tracing();
    let server = MockServer::start();
    let dead = refused_address();
    let mgr = PoolManager::tcp(test_config().with_retry_interval(None));

    mgr.register(&dead, None);
    mgr.register(&server.address(), None);
    assert!(mgr.checkout(&dead).is_err());

    for _ in 0..4 {
        let mut conn = mgr.checkout_any().unwrap();
        assert_eq!(conn.address(), server.address());
        assert_eq!(ping(&mut conn), "+PONG\r\n");
        mgr.checkin(conn, true).unwrap();
    }
    assert!(!mgr.get(&dead).unwrap().is_alive());
}

#[test]
fn reaping_closes_idle_sockets() {
    init_tracing();
    let server = MockServer::start();
    let mgr = PoolManager::tcp(test_config().with_idle_ttl(Some(Duration::ZERO)));

    let a = mgr.checkout(&server.address()).unwrap();
    let b = mgr.checkout(&server.address()).unwrap();
    mgr.checkin(a, true).unwrap();
    mgr.checkin(b, true).unwrap();

    assert_eq!(mgr.reap_idle_all(), 2);
    assert!(wait_for(|| server.finished() == 2));
    assert_eq!(mgr.get(&server.address()).unwrap().idle_count(), 0);
}

#[test]
fn settings_file_drives_tcp_manager() {
    init_tracing();
    let server = MockServer::start();
    let toml = format!(
        r#"
        [pool]
        capacity = 8
        connect_timeout = "2s"
        rw_timeout = "500ms"

        [[endpoints]]
        address = "{}"
        capacity = 1
        "#,
        server.address()
    );
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(toml.as_bytes()).unwrap();

    let settings = ManagerSettings::from_file(file.path()).unwrap();
    let mgr = PoolManager::with_settings(TcpConnectorFactory::new(), &settings).unwrap();

    assert_eq!(mgr.addresses(), vec![server.address()]);
    let pool = mgr.get(&server.address()).unwrap();
    assert_eq!(pool.capacity(), 1);
    assert_eq!(pool.rw_timeout(), Duration::from_millis(500));

    let mut conn = mgr.checkout(&server.address()).unwrap();
    assert_eq!(
        conn.stream().unwrap().read_timeout().unwrap(),
        Some(Duration::from_millis(500))
    );
    assert_eq!(ping(&mut conn), "+PONG\r\n");
    assert!(matches!(
        mgr.checkout(&server.address()),
        Err(PoolError::CapacityExceeded { capacity: 1, .. })
    ));
    mgr.checkin(conn, true).unwrap();
}
