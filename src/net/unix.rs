//! UNIX domain listener strategy

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Registry, Token};
use socket2::Socket;

use super::{Conduit, Listen, PeerAddr};

/// Listening UNIX domain socket.
///
/// When this strategy bound the path itself, the path is unlinked again on
/// cleanup; adopted sockets leave the filesystem alone.
#[derive(Debug)]
pub struct UnixListen {
    inner: UnixListener,
    path: PathBuf,
    created: bool,
}

impl UnixListen {
    /// Binds `path`, replacing a stale socket file, and applies the octal
    /// permission bits when given.
    pub fn bind(path: PathBuf, mode: Option<u32>) -> io::Result<UnixListen> {
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let inner = UnixListener::bind(&path)?;
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }
        Ok(UnixListen {
            inner,
            path,
            created: true,
        })
    }

    /// Adopts an already-bound socket: only `listen` is called, never `bind`.
    pub fn adopt(socket: Socket, backlog: i32) -> io::Result<UnixListen> {
        socket.set_nonblocking(true)?;
        socket.listen(backlog)?;
        let path = socket
            .local_addr()?
            .as_pathname()
            .map(PathBuf::from)
            .unwrap_or_default();
        let std_listener: std::os::unix::net::UnixListener = socket.into();
        Ok(UnixListen {
            inner: UnixListener::from_std(std_listener),
            path,
            created: false,
        })
    }
}

impl Listen for UnixListen {
    fn accept(&mut self) -> io::Result<(Box<dyn Conduit>, PeerAddr)> {
        let (stream, _) = self.inner.accept()?;
        Ok((Box::new(UnixConduit { stream }), PeerAddr::Unix))
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.inner, token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.inner)
    }

    fn cleanup(&mut self) {
        if self.created {
            let _ = fs::remove_file(&self.path);
        }
    }

    fn effective_addr(&self) -> String {
        self.path.display().to_string()
    }
}

/// Accepted UNIX domain stream.
#[derive(Debug)]
pub struct UnixConduit {
    stream: UnixStream,
}

impl Read for UnixConduit {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for UnixConduit {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Conduit for UnixConduit {
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
