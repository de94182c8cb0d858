use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Listening socket that hands out a single connection.
pub struct IngressListener {
    listener: TcpListener,
    read_timeout: Duration,
}

impl IngressListener {
    pub fn bind(addr: impl ToSocketAddrs, read_timeout: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(addr = %listener.local_addr()?, "listening for operator");
        Ok(Self {
            listener,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Block until a client connects. The listener is closed on return, so
    /// later connection attempts are refused.
    pub fn accept(self) -> io::Result<Connection> {
        let (stream, peer) = self.listener.accept()?;
        Connection::new(stream, peer, self.read_timeout)
    }

    /// Like [`accept`](Self::accept) but gives up with `Ok(None)` once
    /// `shutdown` is set.
    pub fn accept_until(self, shutdown: &AtomicBool) -> io::Result<Option<Connection>> {
        self.listener.set_nonblocking(true)?;
        loop {
            if shutdown.load(Ordering::SeqCst) {
                debug!("accept abandoned on shutdown");
                return Ok(None);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    return Connection::new(stream, peer, self.read_timeout).map(Some);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Accepted operator connection with a bounded read wait.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr, read_timeout: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;
        info!(%peer, "operator connected");
        Ok(Self { stream, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Shut down both directions; safe to call more than once.
    pub fn close(&self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!(%err, "connection already closed");
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn test_single_client_then_listener_closed() -> anyhow::Result<()> {
        let listener = IngressListener::bind("127.0.0.1:0", Duration::from_millis(100))?;
        let addr = listener.local_addr()?;
        let client = std::thread::spawn(move || -> io::Result<()> {
            let mut s = TcpStream::connect(addr)?;
            s.write_all(b"hello\n")?;
            Ok(())
        });
        let conn = listener.accept()?;
        client.join().unwrap()?;
        assert_eq!(conn.peer().ip(), addr.ip());
        assert!(TcpStream::connect(addr).is_err());
        Ok(())
    }

    #[test]
    fn test_accept_until_honours_shutdown() -> anyhow::Result<()> {
        let listener = IngressListener::bind("127.0.0.1:0", Duration::from_millis(100))?;
        let flag = Arc::new(AtomicBool::new(true));
        assert!(listener.accept_until(&flag)?.is_none());
        Ok(())
    }
}
