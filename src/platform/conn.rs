//! The shared connection and listener cores used by the socket
//! transports (TCP, IPC).
//!
//! A `Conn` owns one non-blocking socket plus FIFO send/receive AIO
//! queues. Readiness is cached per direction: an edge-triggered
//! notification sets the flag, a `WouldBlock` clears it, and queue
//! drains may run on either the poller thread (after an event) or the
//! submitting thread (when readiness is already cached).
//!
//! Lock order within this module: connection state, then AIO, then the
//! socket itself. Cancel functions take the connection state first and
//! never run under an AIO lock.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::stream::{PropValue, Stream};

/// Per-read scratch ceiling. Reads are copied out of the kernel through
/// this buffer and appended to the AIO's receive target.
const SCRATCH_MAX: usize = 64 * 1024;

/// A non-blocking socket usable by the shared core.
pub(crate) trait RawIo: Source + Read + Write + Send + 'static {
    /// Poll the outcome of a non-blocking connect: `Ok(true)` when
    /// established, `Ok(false)` while still pending.
    fn check_connected(&mut self) -> io::Result<bool>;
    fn shutdown_both(&mut self);
    fn prop(&self, name: &str) -> Result<PropValue>;
    fn set_prop(&self, name: &str, value: &PropValue) -> Result<()>;
}

enum Phase {
    /// Outbound connect in flight; holds the dial AIO.
    Connecting(Option<Aio>),
    Ready,
    Closed,
}

struct ConnState {
    phase: Phase,
    sendq: VecDeque<Aio>,
    recvq: VecDeque<Aio>,
    can_read: bool,
    can_write: bool,
    scratch: Vec<u8>,
}

pub(crate) struct Conn<S: RawIo> {
    io: Mutex<S>,
    st: Mutex<ConnState>,
    token: Mutex<Option<Token>>,
}

impl<S: RawIo> Conn<S> {
    fn new(io: S, phase: Phase) -> Arc<Conn<S>> {
        Arc::new(Conn {
            io: Mutex::new(io),
            st: Mutex::new(ConnState {
                phase,
                sendq: VecDeque::new(),
                recvq: VecDeque::new(),
                can_read: false,
                can_write: false,
                scratch: Vec::new(),
            }),
            token: Mutex::new(None),
        })
    }

    /// Adopts a freshly connected (accepted) socket.
    pub(crate) fn adopt(io: S) -> Arc<Conn<S>> {
        let conn = Conn::new(io, Phase::Ready);
        conn.attach();
        conn
    }

    fn attach(self: &Arc<Self>) {
        let poller = super::poller::get();
        let token = poller.alloc_token();
        *self.token.lock().unwrap() = Some(token);
        poller.submit(token, self.clone() as Arc<dyn super::poller::Pollable>);
    }

    /// Adopts an in-flight non-blocking connect; `aio` (already begun)
    /// finishes with the stream handle once the connect resolves.
    pub(crate) fn start_connecting(io: S, aio: &Aio) {
        let conn = Conn::new(io, Phase::Connecting(None));
        {
            let mut st = conn.st.lock().unwrap();
            let c = conn.clone();
            if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: crate::error::Result<()>| {
                c.cancel_dial(a, res.err().unwrap_or(Error::Canceled));
            })) {
                drop(st);
                aio.finish_error(rv);
                return;
            }
            st.phase = Phase::Connecting(Some(aio.clone()));
        }
        conn.attach();
    }

    fn cancel_dial(self: &Arc<Self>, aio: &Aio, err: Error) {
        let pending = {
            let mut st = self.st.lock().unwrap();
            match &mut st.phase {
                Phase::Connecting(slot @ Some(_)) if slot.as_ref().unwrap().same(aio) => {
                    slot.take()
                }
                _ => None,
            }
        };
        if let Some(a) = pending {
            a.finish_error(err);
            self.close();
        }
    }

    fn cancel_send(self: &Arc<Self>, aio: &Aio, err: Error) {
        let found = {
            let mut st = self.st.lock().unwrap();
            match st.sendq.iter().position(|a| a.same(aio)) {
                Some(pos) => {
                    st.sendq.remove(pos);
                    true
                }
                None => false,
            }
        };
        if found {
            aio.finish_error(err);
        }
    }

    fn cancel_recv(self: &Arc<Self>, aio: &Aio, err: Error) {
        let found = {
            let mut st = self.st.lock().unwrap();
            match st.recvq.iter().position(|a| a.same(aio)) {
                Some(pos) => {
                    st.recvq.remove(pos);
                    true
                }
                None => false,
            }
        };
        if found {
            aio.finish_error(err);
        }
    }

    pub(crate) fn send(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.st.lock().unwrap();
        if matches!(st.phase, Phase::Closed) {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        let c = self.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            c.cancel_send(a, res.err().unwrap_or(Error::Canceled));
        })) {
            drop(st);
            aio.finish_error(rv);
            return;
        }
        st.sendq.push_back(aio.clone());
        if st.can_write {
            self.drive_send(&mut st);
        }
    }

    pub(crate) fn recv(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.st.lock().unwrap();
        if matches!(st.phase, Phase::Closed) {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        let c = self.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            c.cancel_recv(a, res.err().unwrap_or(Error::Canceled));
        })) {
            drop(st);
            aio.finish_error(rv);
            return;
        }
        st.recvq.push_back(aio.clone());
        if st.can_read {
            self.drive_recv(&mut st);
        }
    }

    /// Writes for the head of the send queue until it drains or the
    /// socket pushes back.
    fn drive_send(&self, st: &mut ConnState) {
        while st.can_write {
            let Some(aio) = st.sendq.front().cloned() else {
                return;
            };
            let segs = aio.tx();
            let slices: Vec<IoSlice<'_>> = segs
                .iter()
                .filter(|b| !b.is_empty())
                .map(|b| IoSlice::new(b))
                .collect();
            if slices.is_empty() {
                st.sendq.pop_front();
                aio.finish(Ok(()), 0);
                continue;
            }
            let res = self.io.lock().unwrap().write_vectored(&slices);
            match res {
                Ok(0) => {
                    st.sendq.pop_front();
                    aio.finish_error(Error::ConnShutdown);
                }
                Ok(n) => {
                    trace!("wrote {} bytes", n);
                    st.sendq.pop_front();
                    aio.finish(Ok(()), n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    st.can_write = false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("send failed: {}", e);
                    st.sendq.pop_front();
                    aio.finish_error(Error::from_io(&e));
                }
            }
        }
    }

    /// Reads for the head of the receive queue until it drains or the
    /// socket runs dry.
    fn drive_recv(&self, st: &mut ConnState) {
        while st.can_read {
            let Some(aio) = st.recvq.front().cloned() else {
                return;
            };
            let Some((mut buf, want)) = aio.take_rx_full() else {
                st.recvq.pop_front();
                aio.finish_error(Error::InvalidArgument);
                continue;
            };
            let need = want.saturating_sub(buf.len());
            if need == 0 {
                aio.set_rx(buf, want);
                st.recvq.pop_front();
                aio.finish(Ok(()), 0);
                continue;
            }
            let n = need.min(SCRATCH_MAX);
            if st.scratch.len() < n {
                st.scratch.resize(n, 0);
            }
            let res = self.io.lock().unwrap().read(&mut st.scratch[..n]);
            match res {
                Ok(0) => {
                    aio.set_rx(buf, want);
                    st.recvq.pop_front();
                    aio.finish_error(Error::Closed);
                }
                Ok(k) => {
                    trace!("read {} bytes", k);
                    buf.extend_from_slice(&st.scratch[..k]);
                    aio.set_rx(buf, want);
                    st.recvq.pop_front();
                    aio.finish(Ok(()), k);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    aio.set_rx(buf, want);
                    st.can_read = false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    aio.set_rx(buf, want);
                }
                Err(e) => {
                    debug!("recv failed: {}", e);
                    aio.set_rx(buf, want);
                    st.recvq.pop_front();
                    aio.finish_error(Error::from_io(&e));
                }
            }
        }
    }

    fn finish_connect(self: &Arc<Self>, st: &mut ConnState) {
        let outcome = self.io.lock().unwrap().check_connected();
        match outcome {
            Ok(false) => {}
            Ok(true) => {
                let aio = match &mut st.phase {
                    Phase::Connecting(slot) => slot.take(),
                    _ => None,
                };
                st.phase = Phase::Ready;
                if let Some(aio) = aio {
                    let handle: Box<dyn Stream> = Box::new(ConnHandle(self.clone()));
                    aio.set_output(0, handle);
                    aio.finish(Ok(()), 0);
                }
            }
            Err(e) => {
                debug!("connect failed: {}", e);
                let aio = match &mut st.phase {
                    Phase::Connecting(slot) => slot.take(),
                    _ => None,
                };
                st.phase = Phase::Closed;
                if let Some(aio) = aio {
                    aio.finish_error(Error::from_io(&e));
                }
                self.teardown();
            }
        }
    }

    pub(crate) fn close(self: &Arc<Self>) {
        let (dial, sends, recvs) = {
            let mut st = self.st.lock().unwrap();
            if matches!(st.phase, Phase::Closed) {
                return;
            }
            let dial = match &mut st.phase {
                Phase::Connecting(slot) => slot.take(),
                _ => None,
            };
            st.phase = Phase::Closed;
            st.can_read = false;
            st.can_write = false;
            (
                dial,
                std::mem::take(&mut st.sendq),
                std::mem::take(&mut st.recvq),
            )
        };
        if let Some(aio) = dial {
            aio.finish_error(Error::Closed);
        }
        for aio in sends {
            aio.finish_error(Error::Closed);
        }
        for aio in recvs {
            aio.finish_error(Error::Closed);
        }
        self.teardown();
    }

    fn teardown(&self) {
        self.io.lock().unwrap().shutdown_both();
        if let Some(token) = self.token.lock().unwrap().take() {
            super::poller::get().deregister(token);
        }
    }

    pub(crate) fn get_prop(&self, name: &str) -> Result<PropValue> {
        self.io.lock().unwrap().prop(name)
    }

    pub(crate) fn set_prop(&self, name: &str, value: &PropValue) -> Result<()> {
        self.io.lock().unwrap().set_prop(name, value)
    }
}

impl<S: RawIo> super::poller::Pollable for Conn<S> {
    fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        if matches!(self.st.lock().unwrap().phase, Phase::Closed) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut io = self.io.lock().unwrap();
        io.register(registry, token, Interest::READABLE | Interest::WRITABLE)
    }

    fn deregister(&self, registry: &Registry) {
        let mut io = self.io.lock().unwrap();
        let _ = io.deregister(registry);
    }

    fn register_failed(&self, err: io::Error) {
        debug!("registration failed: {}", err);
        let dial = {
            let mut st = self.st.lock().unwrap();
            let dial = match &mut st.phase {
                Phase::Connecting(slot) => slot.take(),
                _ => None,
            };
            st.phase = Phase::Closed;
            dial
        };
        if let Some(aio) = dial {
            aio.finish_error(Error::from_io(&err));
        }
    }

    fn ready(self: Arc<Self>, readable: bool, writable: bool) {
        let mut st = self.st.lock().unwrap();
        if readable {
            st.can_read = true;
        }
        if writable {
            st.can_write = true;
        }
        match st.phase {
            Phase::Closed => return,
            Phase::Connecting(_) => {
                if st.can_write || st.can_read {
                    self.finish_connect(&mut st);
                }
                if !matches!(st.phase, Phase::Ready) {
                    return;
                }
            }
            Phase::Ready => {}
        }
        self.drive_send(&mut st);
        self.drive_recv(&mut st);
    }
}

/// The `Stream` face of a connection, handed to callers through dial and
/// accept AIOs. Dropping the handle closes the connection.
pub(crate) struct ConnHandle<S: RawIo>(pub(crate) Arc<Conn<S>>);

impl<S: RawIo> Stream for ConnHandle<S> {
    fn send(&self, aio: &Aio) {
        self.0.send(aio);
    }

    fn recv(&self, aio: &Aio) {
        self.0.recv(aio);
    }

    fn close(&self) {
        self.0.close();
    }

    fn stop(&self) {
        self.0.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        self.0.get_prop(name)
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.0.set_prop(name, &value)
    }
}

impl<S: RawIo> Drop for ConnHandle<S> {
    fn drop(&mut self) {
        self.0.close();
    }
}

// ---- listener core -----------------------------------------------------

/// A non-blocking acceptor usable by the shared listener core.
pub(crate) trait RawAcceptor: Source + Send + 'static {
    type Io: RawIo;
    fn accept_io(&mut self) -> io::Result<Self::Io>;
    fn prop(&self, name: &str) -> Result<PropValue>;
    /// Invoked when the listener shuts down (unlink socket files here).
    fn cleanup(&mut self) {}
}

struct ListenState {
    acceptq: VecDeque<Aio>,
    can_read: bool,
    closed: bool,
}

pub(crate) struct ListenerCore<L: RawAcceptor> {
    io: Mutex<Option<L>>,
    st: Mutex<ListenState>,
    token: Mutex<Option<Token>>,
}

impl<L: RawAcceptor> ListenerCore<L> {
    pub(crate) fn new() -> Arc<ListenerCore<L>> {
        Arc::new(ListenerCore {
            io: Mutex::new(None),
            st: Mutex::new(ListenState {
                acceptq: VecDeque::new(),
                can_read: false,
                closed: false,
            }),
            token: Mutex::new(None),
        })
    }

    /// Installs the bound acceptor and registers it with the poller.
    pub(crate) fn install(self: &Arc<Self>, acceptor: L) -> Result<()> {
        {
            let st = self.st.lock().unwrap();
            if st.closed {
                return Err(Error::Closed);
            }
            let mut io = self.io.lock().unwrap();
            if io.is_some() {
                return Err(Error::Busy);
            }
            *io = Some(acceptor);
        }
        let poller = super::poller::get();
        let token = poller.alloc_token();
        *self.token.lock().unwrap() = Some(token);
        poller.submit(token, self.clone() as Arc<dyn super::poller::Pollable>);
        Ok(())
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.io.lock().unwrap().is_some()
    }

    pub(crate) fn accept(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.st.lock().unwrap();
        if st.closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        if self.io.lock().unwrap().is_none() {
            drop(st);
            aio.finish_error(Error::InvalidArgument);
            return;
        }
        let me = self.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            me.cancel_accept(a, res.err().unwrap_or(Error::Canceled));
        })) {
            drop(st);
            aio.finish_error(rv);
            return;
        }
        st.acceptq.push_back(aio.clone());
        if st.can_read {
            self.drive_accept(&mut st);
        }
    }

    fn cancel_accept(self: &Arc<Self>, aio: &Aio, err: Error) {
        let found = {
            let mut st = self.st.lock().unwrap();
            match st.acceptq.iter().position(|a| a.same(aio)) {
                Some(pos) => {
                    st.acceptq.remove(pos);
                    true
                }
                None => false,
            }
        };
        if found {
            aio.finish_error(err);
        }
    }

    fn drive_accept(&self, st: &mut ListenState) {
        while st.can_read {
            if st.acceptq.is_empty() {
                return;
            }
            let res = {
                let mut io = self.io.lock().unwrap();
                match io.as_mut() {
                    Some(l) => l.accept_io(),
                    None => return,
                }
            };
            match res {
                Ok(sock) => {
                    let aio = st.acceptq.pop_front().unwrap();
                    let conn = Conn::adopt(sock);
                    let handle: Box<dyn Stream> = Box::new(ConnHandle(conn));
                    aio.set_output(0, handle);
                    aio.finish(Ok(()), 0);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    st.can_read = false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("accept failed: {}", e);
                    let aio = st.acceptq.pop_front().unwrap();
                    aio.finish_error(Error::from_io(&e));
                }
            }
        }
    }

    pub(crate) fn close(&self) {
        let pending = {
            let mut st = self.st.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            std::mem::take(&mut st.acceptq)
        };
        for aio in pending {
            aio.finish_error(Error::Closed);
        }
        if let Some(token) = self.token.lock().unwrap().take() {
            super::poller::get().deregister(token);
        }
        if let Some(mut l) = self.io.lock().unwrap().take() {
            l.cleanup();
        }
    }

    pub(crate) fn get_prop(&self, name: &str) -> Result<PropValue> {
        match self.io.lock().unwrap().as_ref() {
            Some(l) => l.prop(name),
            None => Err(Error::Closed),
        }
    }
}

impl<L: RawAcceptor> super::poller::Pollable for ListenerCore<L> {
    fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        if self.st.lock().unwrap().closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut io = self.io.lock().unwrap();
        match io.as_mut() {
            Some(l) => l.register(registry, token, Interest::READABLE),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn deregister(&self, registry: &Registry) {
        let mut io = self.io.lock().unwrap();
        if let Some(l) = io.as_mut() {
            let _ = l.deregister(registry);
        }
    }

    fn register_failed(&self, err: io::Error) {
        debug!("listener registration failed: {}", err);
        let pending = {
            let mut st = self.st.lock().unwrap();
            std::mem::take(&mut st.acceptq)
        };
        for aio in pending {
            aio.finish_error(Error::from_io(&err));
        }
    }

    fn ready(self: Arc<Self>, readable: bool, _writable: bool) {
        let mut st = self.st.lock().unwrap();
        if readable {
            st.can_read = true;
        }
        if st.closed {
            return;
        }
        self.drive_accept(&mut st);
    }
}
