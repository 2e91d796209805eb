//! TCP stream transport.

use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::net::{TcpListener as MioListener, TcpStream as MioStream};
use socket2::SockRef;

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::stream::{prop, PropValue, StreamDialer, StreamListener};
use crate::url::Url;

use super::conn::{Conn, ListenerCore, RawAcceptor, RawIo};

/// A TCP socket adapter for the shared connection core.
pub(crate) struct TcpIo {
    sock: MioStream,
}

impl TcpIo {
    fn new(sock: MioStream) -> TcpIo {
        TcpIo { sock }
    }
}

impl Read for TcpIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.read(buf)
    }
}

impl Write for TcpIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.write(buf)
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.sock.write_vectored(bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sock.flush()
    }
}

impl mio::event::Source for TcpIo {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.sock.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.sock.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.sock.deregister(registry)
    }
}

impl RawIo for TcpIo {
    fn check_connected(&mut self) -> io::Result<bool> {
        if let Some(err) = self.sock.take_error()? {
            return Err(err);
        }
        match self.sock.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn shutdown_both(&mut self) {
        let _ = self.sock.shutdown(Shutdown::Both);
    }

    fn prop(&self, name: &str) -> Result<PropValue> {
        match name {
            prop::LOCAL_ADDR => self
                .sock
                .local_addr()
                .map(PropValue::Addr)
                .map_err(|e| Error::from_io(&e)),
            prop::REMOTE_ADDR => self
                .sock
                .peer_addr()
                .map(PropValue::Addr)
                .map_err(|e| Error::from_io(&e)),
            prop::NO_DELAY => SockRef::from(&self.sock)
                .nodelay()
                .map(PropValue::Bool)
                .map_err(|e| Error::from_io(&e)),
            prop::KEEP_ALIVE => SockRef::from(&self.sock)
                .keepalive()
                .map(PropValue::Bool)
                .map_err(|e| Error::from_io(&e)),
            _ => Err(Error::NotSupported),
        }
    }

    fn set_prop(&self, name: &str, value: &PropValue) -> Result<()> {
        match (name, value) {
            (prop::NO_DELAY, PropValue::Bool(on)) => self
                .sock
                .set_nodelay(*on)
                .map_err(|e| Error::from_io(&e)),
            (prop::KEEP_ALIVE, PropValue::Bool(on)) => SockRef::from(&self.sock)
                .set_keepalive(*on)
                .map_err(|e| Error::from_io(&e)),
            (prop::NO_DELAY | prop::KEEP_ALIVE, _) => Err(Error::InvalidArgument),
            _ => Err(Error::NotSupported),
        }
    }
}

/// Options applied to every connection an endpoint produces.
#[derive(Clone, Copy)]
struct TcpOpts {
    no_delay: bool,
    keep_alive: bool,
}

impl Default for TcpOpts {
    fn default() -> TcpOpts {
        TcpOpts {
            no_delay: true,
            keep_alive: false,
        }
    }
}

impl TcpOpts {
    fn apply(&self, sock: &MioStream) {
        let _ = sock.set_nodelay(self.no_delay);
        if self.keep_alive {
            let _ = SockRef::from(sock).set_keepalive(true);
        }
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            prop::NO_DELAY => Ok(PropValue::Bool(self.no_delay)),
            prop::KEEP_ALIVE => Ok(PropValue::Bool(self.keep_alive)),
            _ => Err(Error::NotSupported),
        }
    }

    fn set(&mut self, name: &str, value: &PropValue) -> Result<()> {
        match (name, value) {
            (prop::NO_DELAY, PropValue::Bool(on)) => {
                self.no_delay = *on;
                Ok(())
            }
            (prop::KEEP_ALIVE, PropValue::Bool(on)) => {
                self.keep_alive = *on;
                Ok(())
            }
            (prop::NO_DELAY | prop::KEEP_ALIVE, _) => Err(Error::InvalidArgument),
            _ => Err(Error::NotSupported),
        }
    }
}

pub(crate) struct TcpDialer {
    url: Url,
    opts: std::sync::Mutex<TcpOpts>,
}

impl TcpDialer {
    pub(crate) fn new(url: Url) -> Result<TcpDialer> {
        Ok(TcpDialer {
            url,
            opts: std::sync::Mutex::new(TcpOpts::default()),
        })
    }
}

impl StreamDialer for TcpDialer {
    fn dial(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let addr = match self.url.resolve() {
            Ok(addr) => addr,
            Err(e) => {
                aio.finish_error(e);
                return;
            }
        };
        match MioStream::connect(addr) {
            Ok(sock) => {
                self.opts.lock().unwrap().apply(&sock);
                Conn::start_connecting(TcpIo::new(sock), aio);
            }
            Err(e) => aio.finish_error(Error::from_io(&e)),
        }
    }

    fn close(&self) {}

    fn get(&self, name: &str) -> Result<PropValue> {
        self.opts.lock().unwrap().get(name)
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.opts.lock().unwrap().set(name, &value)
    }
}

pub(crate) struct TcpAcceptor {
    sock: MioListener,
    opts: TcpOpts,
}

impl mio::event::Source for TcpAcceptor {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.sock.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.sock.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.sock.deregister(registry)
    }
}

impl RawAcceptor for TcpAcceptor {
    type Io = TcpIo;

    fn accept_io(&mut self) -> io::Result<TcpIo> {
        let (sock, _peer) = self.sock.accept()?;
        self.opts.apply(&sock);
        Ok(TcpIo::new(sock))
    }

    fn prop(&self, name: &str) -> Result<PropValue> {
        match name {
            prop::LOCAL_ADDR => self
                .sock
                .local_addr()
                .map(PropValue::Addr)
                .map_err(|e| Error::from_io(&e)),
            _ => self.opts.get(name),
        }
    }
}

pub(crate) struct TcpListener {
    url: Url,
    opts: std::sync::Mutex<TcpOpts>,
    core: std::sync::Arc<ListenerCore<TcpAcceptor>>,
}

impl TcpListener {
    pub(crate) fn new(url: Url) -> Result<TcpListener> {
        Ok(TcpListener {
            url,
            opts: std::sync::Mutex::new(TcpOpts::default()),
            core: ListenerCore::new(),
        })
    }
}

impl StreamListener for TcpListener {
    fn listen(&self) -> Result<()> {
        let addr = self.url.resolve_local()?;
        let sock = MioListener::bind(addr).map_err(|e| Error::from_io(&e))?;
        self.core.install(TcpAcceptor {
            sock,
            opts: *self.opts.lock().unwrap(),
        })
    }

    fn accept(&self, aio: &Aio) {
        self.core.accept(aio);
    }

    fn close(&self) {
        self.core.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        if self.core.is_listening() {
            self.core.get_prop(name)
        } else {
            self.opts.lock().unwrap().get(name)
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        if self.core.is_listening() {
            return Err(Error::Busy);
        }
        self.opts.lock().unwrap().set(name, &value)
    }
}
