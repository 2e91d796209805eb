//! IPC stream transport over Unix domain sockets.
//!
//! `ipc://` and `unix://` name filesystem sockets; `abstract://` names
//! Linux abstract-namespace sockets (no filesystem entry, no unlink).

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::path::PathBuf;

use mio::net::{UnixListener as MioListener, UnixStream as MioStream};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::stream::{prop, PropValue, StreamDialer, StreamListener};
use crate::url::Url;

use super::conn::{Conn, ListenerCore, RawAcceptor, RawIo};

pub(crate) struct IpcIo {
    sock: MioStream,
    path: String,
}

impl Read for IpcIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.read(buf)
    }
}

impl Write for IpcIo {
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

impl mio::event::Source for IpcIo {
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

impl RawIo for IpcIo {
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
            prop::LOCAL_ADDR | prop::REMOTE_ADDR => Ok(PropValue::Str(self.path.clone())),
            _ => Err(Error::NotSupported),
        }
    }

    fn set_prop(&self, name: &str, _value: &PropValue) -> Result<()> {
        match name {
            prop::LOCAL_ADDR | prop::REMOTE_ADDR => Err(Error::InvalidArgument),
            _ => Err(Error::NotSupported),
        }
    }
}

fn connect(url: &Url) -> io::Result<MioStream> {
    if url.scheme() == "abstract" {
        return connect_abstract(url.path());
    }
    MioStream::connect(url.path())
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<MioStream> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    MioStream::connect_addr(&addr)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_name: &str) -> io::Result<MioStream> {
    Err(io::ErrorKind::Unsupported.into())
}

fn bind(url: &Url) -> io::Result<MioListener> {
    if url.scheme() == "abstract" {
        return bind_abstract(url.path());
    }
    MioListener::bind(url.path())
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<MioListener> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    MioListener::bind_addr(&addr)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> io::Result<MioListener> {
    Err(io::ErrorKind::Unsupported.into())
}

pub(crate) struct IpcDialer {
    url: Url,
}

impl IpcDialer {
    pub(crate) fn new(url: Url) -> Result<IpcDialer> {
        Ok(IpcDialer { url })
    }
}

impl StreamDialer for IpcDialer {
    fn dial(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        match connect(&self.url) {
            Ok(sock) => Conn::start_connecting(
                IpcIo {
                    sock,
                    path: self.url.path().to_string(),
                },
                aio,
            ),
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                aio.finish_error(Error::NotSupported)
            }
            Err(e) => aio.finish_error(Error::from_io(&e)),
        }
    }

    fn close(&self) {}

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            prop::LOCAL_ADDR | prop::REMOTE_ADDR => Ok(PropValue::Str(self.url.path().to_string())),
            _ => Err(Error::NotSupported),
        }
    }

    fn set(&self, _name: &str, _value: PropValue) -> Result<()> {
        Err(Error::NotSupported)
    }
}

pub(crate) struct IpcAcceptor {
    sock: MioListener,
    path: String,
    unlink: Option<PathBuf>,
}

impl mio::event::Source for IpcAcceptor {
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

impl RawAcceptor for IpcAcceptor {
    type Io = IpcIo;

    fn accept_io(&mut self) -> io::Result<IpcIo> {
        let (sock, _peer) = self.sock.accept()?;
        Ok(IpcIo {
            sock,
            path: self.path.clone(),
        })
    }

    fn prop(&self, name: &str) -> Result<PropValue> {
        match name {
            prop::LOCAL_ADDR => Ok(PropValue::Str(self.path.clone())),
            _ => Err(Error::NotSupported),
        }
    }

    fn cleanup(&mut self) {
        if let Some(path) = self.unlink.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub(crate) struct IpcListener {
    url: Url,
    core: std::sync::Arc<ListenerCore<IpcAcceptor>>,
}

impl IpcListener {
    pub(crate) fn new(url: Url) -> Result<IpcListener> {
        Ok(IpcListener {
            url,
            core: ListenerCore::new(),
        })
    }
}

impl StreamListener for IpcListener {
    fn listen(&self) -> Result<()> {
        let sock = bind(&self.url).map_err(|e| {
            if e.kind() == io::ErrorKind::Unsupported {
                Error::NotSupported
            } else {
                Error::from_io(&e)
            }
        })?;
        let unlink = if self.url.scheme() == "abstract" {
            None
        } else {
            Some(PathBuf::from(self.url.path()))
        };
        self.core.install(IpcAcceptor {
            sock,
            path: self.url.path().to_string(),
            unlink,
        })
    }

    fn accept(&self, aio: &Aio) {
        self.core.accept(aio);
    }

    fn close(&self) {
        self.core.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            prop::LOCAL_ADDR => Ok(PropValue::Str(self.url.path().to_string())),
            _ => Err(Error::NotSupported),
        }
    }

    fn set(&self, _name: &str, _value: PropValue) -> Result<()> {
        Err(Error::NotSupported)
    }
}
