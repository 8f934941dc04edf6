//! TCP listener strategy

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use super::{Conduit, Listen, PeerAddr};

/// Listening TCP socket (v4 or v6).
#[derive(Debug)]
pub struct TcpListen {
    inner: TcpListener,
    addr: SocketAddr,
}

impl TcpListen {
    /// Resolves `host` and binds the first address with `SO_REUSEADDR` set,
    /// listening with the given backlog.
    pub fn bind(host: &str, port: u16, backlog: i32) -> io::Result<TcpListen> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no address")
        })?;

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;

        Self::from_listening(socket)
    }

    /// Adopts an already-bound socket: only `listen` is called, never `bind`.
    pub fn adopt(socket: Socket, backlog: i32) -> io::Result<TcpListen> {
        socket.set_nonblocking(true)?;
        socket.listen(backlog)?;
        Self::from_listening(socket)
    }

    fn from_listening(socket: Socket) -> io::Result<TcpListen> {
        let std_listener: std::net::TcpListener = socket.into();
        let addr = std_listener.local_addr()?;
        Ok(TcpListen {
            inner: TcpListener::from_std(std_listener),
            addr,
        })
    }

    /// The bound address, with the kernel-assigned port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Listen for TcpListen {
    fn accept(&mut self) -> io::Result<(Box<dyn Conduit>, PeerAddr)> {
        let (stream, peer) = self.inner.accept()?;
        Ok((Box::new(TcpConduit { stream }), PeerAddr::Inet(peer)))
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.inner, token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.inner)
    }

    fn applies_socket_options(&self) -> bool {
        true
    }

    fn effective_addr(&self) -> String {
        self.addr.to_string()
    }
}

/// Accepted TCP stream.
#[derive(Debug)]
pub struct TcpConduit {
    stream: TcpStream,
}

impl Read for TcpConduit {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpConduit {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Conduit for TcpConduit {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut self.stream, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::TcpListen;
    use crate::net::Listen;

    #[test]
    fn bind_port_zero_reports_assigned_port() {
        let listen = TcpListen::bind("127.0.0.1", 0, 1024).unwrap();
        assert_ne!(0, listen.local_addr().port());
        assert!(listen.effective_addr().starts_with("127.0.0.1:"));
    }

    #[test]
    fn accept_without_client_would_block() {
        let mut listen = TcpListen::bind("127.0.0.1", 0, 1024).unwrap();
        let err = listen.accept().unwrap_err();
        assert_eq!(std::io::ErrorKind::WouldBlock, err.kind());
    }

    #[test]
    fn accepted_sockets_take_options() {
        let listen = TcpListen::bind("127.0.0.1", 0, 1024).unwrap();
        assert!(listen.applies_socket_options());
    }

    #[test]
    fn adopt_listens_without_rebinding() {
        use socket2::{Domain, Protocol, Socket, Type};
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        socket
            .bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into())
            .unwrap();
        let listen = TcpListen::adopt(socket, 1024).unwrap();
        assert_ne!(0, listen.local_addr().port());
    }
}
