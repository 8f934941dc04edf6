//! VSOCK listener strategy (Linux)

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use socket2::{Domain, SockAddr, Socket, Type};

use super::{Conduit, Listen, PeerAddr};

/// Listening VSOCK socket.
#[derive(Debug)]
pub struct VsockListen {
    socket: Socket,
    cid: u32,
    port: u32,
}

impl VsockListen {
    /// Binds `cid:port` and listens with the given backlog.
    pub fn bind(cid: u32, port: u32, backlog: i32) -> io::Result<VsockListen> {
        let socket = Socket::new(Domain::VSOCK, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::vsock(cid, port))?;
        socket.listen(backlog)?;
        Self::from_listening(socket)
    }

    /// Adopts an already-bound socket: only `listen` is called, never `bind`.
    pub fn adopt(socket: Socket, backlog: i32) -> io::Result<VsockListen> {
        socket.set_nonblocking(true)?;
        socket.listen(backlog)?;
        Self::from_listening(socket)
    }

    fn from_listening(socket: Socket) -> io::Result<VsockListen> {
        let (cid, port) = socket
            .local_addr()?
            .as_vsock_address()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a vsock address"))?;
        Ok(VsockListen { socket, cid, port })
    }
}

impl Listen for VsockListen {
    fn accept(&mut self) -> io::Result<(Box<dyn Conduit>, PeerAddr)> {
        let (stream, addr) = self.socket.accept()?;
        stream.set_nonblocking(true)?;
        let peer = match addr.as_vsock_address() {
            Some((cid, port)) => PeerAddr::Vsock { cid, port },
            None => PeerAddr::Vsock { cid: 0, port: 0 },
        };
        Ok((Box::new(VsockConduit { stream }), peer))
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(
            &mut SourceFd(&self.socket.as_raw_fd()),
            token,
            Interest::READABLE,
        )
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut SourceFd(&self.socket.as_raw_fd()))
    }

    fn effective_addr(&self) -> String {
        format!("{}:{}", self.cid, self.port)
    }
}

/// Accepted VSOCK stream.
#[derive(Debug)]
pub struct VsockConduit {
    stream: Socket,
}

impl Read for VsockConduit {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }
}

impl Write for VsockConduit {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.stream).flush()
    }
}

impl Conduit for VsockConduit {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut SourceFd(&self.stream.as_raw_fd()), token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.reregister(&mut SourceFd(&self.stream.as_raw_fd()), token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut SourceFd(&self.stream.as_raw_fd()))
    }

    fn raw_fd(&self) -> std::os::fd::RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use socket2::{Domain, SockAddr};

    // binding a vsock socket needs a vsock transport in the kernel, which CI
    // containers rarely have; address construction is testable everywhere
    #[test]
    fn vsock_addresses_round_trip_family_and_parts() {
        let addr = SockAddr::vsock(2, 1234);
        assert_eq!(Domain::VSOCK, addr.domain());
        assert_eq!(Some((2, 1234)), addr.as_vsock_address());
    }
}
