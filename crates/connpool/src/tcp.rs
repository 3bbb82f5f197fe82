//! Plain TCP connections for byte-stream clients.
//!
//! [`TcpConnection`] implements [`Connection`] over `std::net::TcpStream`
//! and applies the pool's connect and read/write timeouts. It does no
//! protocol work: a client built on top speaks its protocol through the
//! [`Read`]/[`Write`] impls of the checked-out connection.
//!
//! ```text
//! PoolManager::tcp(config)
//!   → TcpConnectorFactory
//!     → TcpConnector per address, timeouts from the pool's config
//!       → TcpConnection::open() → resolve → connect_timeout → set timeouts
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::PoolConfig;
use crate::connection::{Connection, Connector, ConnectorFactory};
use crate::error::ConnectError;
use crate::manager::PoolManager;

/// A TCP connection to one `host:port` address.
#[derive(Debug)]
pub struct TcpConnection {
    address: String,
    connect_timeout: Duration,
    rw_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpConnection {
    /// An unopened connection to `address`.
    pub fn new(address: &str, connect_timeout: Duration, rw_timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            connect_timeout,
            rw_timeout,
            stream: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is not open"))
    }
}

impl Connection for TcpConnection {
    fn open(&mut self) -> Result<(), ConnectError> {
        let addrs: Vec<_> = self
            .address
            .to_socket_addrs()
            .map_err(|e| ConnectError::Resolve(format!("{}: {e}", self.address)))?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectError::Resolve(self.address.clone()));
        }

        let mut last_err = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.rw_timeout))?;
                    stream.set_write_timeout(Some(self.rw_timeout))?;
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(
                        address = %self.address,
                        peer = %addr,
                        "established tcp connection"
                    );
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) if e.kind() == io::ErrorKind::TimedOut => {
                Err(ConnectError::Timeout(self.connect_timeout))
            }
            Some(e) => Err(ConnectError::Io(e)),
            None => Err(ConnectError::Resolve(self.address.clone())),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream_mut()?.read(buf)
    }
}

impl Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream_mut()?.flush()
    }
}

/// Builds [`TcpConnection`]s for one address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
    rw_timeout: Duration,
}

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn create(&self) -> TcpConnection {
        TcpConnection::new(&self.address, self.connect_timeout, self.rw_timeout)
    }
}

/// Factory handing each new endpoint pool a [`TcpConnector`] that uses
/// the timeouts the pool was created with.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnectorFactory;

impl TcpConnectorFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ConnectorFactory for TcpConnectorFactory {
    type Connector = TcpConnector;

    fn create_connector(&self, address: &str, config: &PoolConfig, _slot: usize) -> TcpConnector {
        TcpConnector {
            address: address.to_string(),
            connect_timeout: config.connect_timeout,
            rw_timeout: config.rw_timeout,
        }
    }
}

impl PoolManager<TcpConnectorFactory> {
    /// A manager of plain TCP pools. Each pool's sockets use the timeouts
    /// in the defaults current when the pool is created.
    pub fn tcp(config: PoolConfig) -> Self {
        Self::new(TcpConnectorFactory, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf) {
                        if n == 0 || stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr.to_string()
    }

    fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn open_applies_timeouts() {
        let address = echo_server();
        let mut conn = TcpConnection::new(&address, Duration::from_secs(1), Duration::from_secs(2));
        assert!(!conn.is_open());
        conn.open().unwrap();
        assert!(conn.is_open());

        let stream = conn.stream().unwrap();
        assert_eq!(stream.read_timeout().unwrap(), Some(Duration::from_secs(2)));
        assert_eq!(stream.write_timeout().unwrap(), Some(Duration::from_secs(2)));

        conn.close();
        assert!(!conn.is_open());
    }

    #[test]
    fn echo_round_trip() {
        let address = echo_server();
        let mut conn = TcpConnection::new(&address, Duration::from_secs(1), Duration::from_secs(1));
        conn.open().unwrap();

        conn.write_all(b"PING\r\n").unwrap();
        let mut buf = [0u8; 6];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"PING\r\n");
    }

    #[test]
    fn io_on_unopened_connection_fails() {
        let mut conn =
            TcpConnection::new("127.0.0.1:1", Duration::from_secs(1), Duration::from_secs(1));
        let err = conn.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn refused_connect_is_an_io_error() {
        let mut conn = TcpConnection::new(
            &closed_port(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let err = conn.open().unwrap_err();
        assert!(matches!(err, ConnectError::Io(_) | ConnectError::Timeout(_)));
        assert!(!conn.is_open());
    }

    #[test]
    fn unresolvable_address_is_a_resolve_error() {
        let mut conn =
            TcpConnection::new("not an address", Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(conn.open(), Err(ConnectError::Resolve(_))));
    }

    #[test]
    fn factory_uses_config_timeouts() {
        let config = PoolConfig::default()
            .with_connect_timeout(Duration::from_secs(2))
            .with_rw_timeout(Duration::from_secs(3));
        let conn = TcpConnectorFactory::new()
            .create_connector("127.0.0.1:6379", &config, 0)
            .create();
        assert_eq!(conn.address(), "127.0.0.1:6379");
        assert_eq!(conn.connect_timeout, Duration::from_secs(2));
        assert_eq!(conn.rw_timeout, Duration::from_secs(3));
    }

    #[test]
    fn new_pools_pick_up_changed_default_timeouts() {
        let address = echo_server();
        let mgr = PoolManager::tcp(PoolConfig::default());
        mgr.set_default_config(PoolConfig::default().with_rw_timeout(Duration::from_secs(4)));

        let conn = mgr.checkout(&address).unwrap();
        assert_eq!(mgr.get(&address).unwrap().rw_timeout(), Duration::from_secs(4));
        assert_eq!(conn.rw_timeout, Duration::from_secs(4));
        assert_eq!(
            conn.stream().unwrap().read_timeout().unwrap(),
            Some(Duration::from_secs(4))
        );
        mgr.checkin(conn, true).unwrap();
    }

    #[test]
    fn tcp_manager_reuses_connections() {
        let address = echo_server();
        let mgr = PoolManager::tcp(PoolConfig::default().with_capacity(1));

        let mut conn = mgr.checkout(&address).unwrap();
        conn.write_all(b"a").unwrap();
        let mut buf = [0u8; 1];
        conn.read_exact(&mut buf).unwrap();
        let local = conn.stream().unwrap().local_addr().unwrap();
        mgr.checkin(conn, true).unwrap();

        let conn = mgr.checkout(&address).unwrap();
        assert_eq!(conn.stream().unwrap().local_addr().unwrap(), local);
        mgr.checkin(conn, true).unwrap();
    }
}
