//! The byte stream abstraction.
//!
//! Every transport bottoms out on these three object-safe traits: a
//! duplex [`Stream`], a [`StreamDialer`] that produces streams by
//! connecting out, and a [`StreamListener`] that produces them by
//! accepting. All I/O is submitted through AIOs; a dial or accept hands
//! the new stream back in output slot 0.

pub(crate) mod inproc;

use bytes::{Bytes, BytesMut};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::url::Url;

/// Property values exchanged through `get`/`set`.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Size(usize),
    Str(String),
    Addr(std::net::SocketAddr),
    /// A TLS configuration bound to a dialer or listener.
    Tls(crate::tls::TlsConfig),
}

/// Well-known property names.
pub mod prop {
    /// Local socket address (`PropValue::Addr`), or path/name string for
    /// ipc and inproc.
    pub const LOCAL_ADDR: &str = "local-address";
    /// Remote socket address.
    pub const REMOTE_ADDR: &str = "remote-address";
    /// Disable Nagle batching on TCP (`PropValue::Bool`).
    pub const NO_DELAY: &str = "tcp-nodelay";
    /// Enable TCP keepalive probes (`PropValue::Bool`).
    pub const KEEP_ALIVE: &str = "tcp-keepalive";
}

/// A byte-oriented duplex channel.
///
/// `send` transmits the AIO's segments and finishes with the count
/// actually written; short writes are legal and the caller resumes.
/// `recv` appends into the AIO's receive buffer and finishes with the
/// count read; zero-byte reads never complete successfully (EOF surfaces
/// as `Closed`).
pub trait Stream: Send + Sync {
    fn send(&self, aio: &Aio);
    fn recv(&self, aio: &Aio);
    /// Closes the stream; pending and future operations finish `Closed`.
    fn close(&self);
    /// Closes and quiesces; after return no new completions are produced.
    fn stop(&self);
    fn get(&self, name: &str) -> Result<PropValue>;
    fn set(&self, name: &str, value: PropValue) -> Result<()>;
}

/// Outgoing connector. `dial` finishes with a boxed [`Stream`] in output
/// slot 0.
pub trait StreamDialer: Send + Sync {
    fn dial(&self, aio: &Aio);
    fn close(&self);
    fn get(&self, name: &str) -> Result<PropValue>;
    fn set(&self, name: &str, value: PropValue) -> Result<()>;
}

/// Incoming acceptor. `listen` binds synchronously (this is where
/// `AddressInUse` surfaces); `accept` finishes with a boxed [`Stream`]
/// in output slot 0.
pub trait StreamListener: Send + Sync {
    fn listen(&self) -> Result<()>;
    fn accept(&self, aio: &Aio);
    fn close(&self);
    fn get(&self, name: &str) -> Result<PropValue>;
    fn set(&self, name: &str, value: PropValue) -> Result<()>;
}

/// Creates a stream dialer for the URL's scheme.
pub fn dialer(url: &Url) -> Result<Box<dyn StreamDialer>> {
    match url.scheme() {
        "tcp" | "tcp4" | "tcp6" => Ok(Box::new(crate::platform::tcp::TcpDialer::new(
            url.clone(),
        )?)),
        #[cfg(unix)]
        "ipc" | "unix" | "abstract" => {
            Ok(Box::new(crate::platform::ipc::IpcDialer::new(url.clone())?))
        }
        #[cfg(not(unix))]
        "ipc" | "unix" | "abstract" => Err(Error::NotSupported),
        "inproc" => Ok(Box::new(inproc::InprocDialer::new(url.clone()))),
        "tls+tcp" | "tls+tcp4" | "tls+tcp6" => {
            Ok(Box::new(crate::tls::TlsDialer::over_tcp(url.clone())?))
        }
        "ws" | "ws4" | "ws6" | "wss" | "wss4" | "wss6" => {
            Ok(Box::new(crate::ws::WsDialer::new(url.clone())?))
        }
        _ => Err(Error::InvalidAddress),
    }
}

/// Creates a stream listener for the URL's scheme.
pub fn listener(url: &Url) -> Result<Box<dyn StreamListener>> {
    match url.scheme() {
        "tcp" | "tcp4" | "tcp6" => Ok(Box::new(crate::platform::tcp::TcpListener::new(
            url.clone(),
        )?)),
        #[cfg(unix)]
        "ipc" | "unix" | "abstract" => Ok(Box::new(crate::platform::ipc::IpcListener::new(
            url.clone(),
        )?)),
        #[cfg(not(unix))]
        "ipc" | "unix" | "abstract" => Err(Error::NotSupported),
        "inproc" => Ok(Box::new(inproc::InprocListener::new(url.clone()))),
        "tls+tcp" | "tls+tcp4" | "tls+tcp6" => {
            Ok(Box::new(crate::tls::TlsListener::over_tcp(url.clone())?))
        }
        "ws" | "ws4" | "ws6" | "wss" | "wss4" | "wss6" => {
            Ok(Box::new(crate::ws::WsListener::new(url.clone())?))
        }
        _ => Err(Error::InvalidAddress),
    }
}

// ---- synchronous wrappers ---------------------------------------------
//
// These issue an internal AIO and block on it; the calling thread never
// blocks inside a provider.

pub fn dial_wait(d: &dyn StreamDialer) -> Result<Box<dyn Stream>> {
    let aio = Aio::silent();
    d.dial(&aio);
    aio.wait();
    aio.result()?;
    aio.take_output::<Box<dyn Stream>>(0).ok_or(Error::Closed)
}

pub fn accept_wait(l: &dyn StreamListener) -> Result<Box<dyn Stream>> {
    let aio = Aio::silent();
    l.accept(&aio);
    aio.wait();
    aio.result()?;
    aio.take_output::<Box<dyn Stream>>(0).ok_or(Error::Closed)
}

/// Sends all of `data`, looping over short writes.
pub fn send_all(s: &dyn Stream, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let mut segs = vec![Bytes::copy_from_slice(data)];
    let aio = Aio::silent();
    while !segs.is_empty() {
        aio.set_tx(segs.clone());
        s.send(&aio);
        aio.wait();
        aio.result()?;
        advance_segs(&mut segs, aio.count());
    }
    Ok(())
}

/// Receives exactly `n` bytes, looping over short reads.
pub fn recv_exact(s: &dyn Stream, n: usize) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(n);
    let aio = Aio::silent();
    while buf.len() < n {
        aio.set_rx(buf, n);
        s.recv(&aio);
        aio.wait();
        let res = aio.result();
        buf = aio.take_rx().unwrap_or_default();
        res?;
    }
    Ok(buf)
}

/// Drops `count` transmitted bytes off the front of a segment list.
pub(crate) fn advance_segs(segs: &mut Vec<Bytes>, mut count: usize) {
    while count > 0 {
        let Some(head) = segs.first_mut() else {
            return;
        };
        if head.len() > count {
            *head = head.slice(count..);
            return;
        }
        count -= head.len();
        segs.remove(0);
    }
    segs.retain(|b| !b.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_across_segments() {
        let mut segs = vec![
            Bytes::from_static(b"abc"),
            Bytes::from_static(b"de"),
            Bytes::from_static(b"fgh"),
        ];
        advance_segs(&mut segs, 4);
        assert_eq!(segs.len(), 2);
        assert_eq!(&segs[0][..], b"e");
        assert_eq!(&segs[1][..], b"fgh");
        advance_segs(&mut segs, 4);
        assert!(segs.is_empty());
    }

    #[test]
    fn advance_exact_boundary() {
        let mut segs = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")];
        advance_segs(&mut segs, 3);
        assert_eq!(segs.len(), 1);
        assert_eq!(&segs[0][..], b"def");
    }
}
