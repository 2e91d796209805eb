//! The TLS stream wrapper.
//!
//! Sits between user AIOs and any lower byte stream. Two fixed record
//! buffers carry ciphertext: an outbound ring the engine writes into
//! (returning `Busy` when full, which is the back-pressure signal) and
//! an inbound slab the engine reads from. Every lower-stream completion
//! re-runs the service loop: handshake first, then the head of the user
//! send queue, then the head of the user receive queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::stream::{advance_segs, PropValue, Stream};

use super::{TlsChannel, TlsEngineConn, PROP_PEER_CN, PROP_VERIFIED};

/// Size of each ciphertext buffer; one full TLS record fits.
const RECORD_BUF: usize = 16 * 1024;

struct Chan<'a> {
    out: &'a mut VecDeque<u8>,
    inb: &'a mut VecDeque<u8>,
}

impl TlsChannel for Chan<'_> {
    fn put_ciphertext(&mut self, buf: &[u8]) -> Result<usize> {
        let space = RECORD_BUF - self.out.len();
        if space == 0 || buf.is_empty() {
            return Err(Error::Busy);
        }
        let n = space.min(buf.len());
        self.out.extend(&buf[..n]);
        Ok(n)
    }

    fn get_ciphertext(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.inb.is_empty() || buf.is_empty() {
            return Err(Error::Busy);
        }
        let n = self.inb.len().min(buf.len());
        for (i, byte) in self.inb.drain(..n).enumerate() {
            buf[i] = byte;
        }
        Ok(n)
    }
}

struct TlsSt {
    conn: Box<dyn TlsEngineConn>,
    hs_done: bool,
    closed: bool,
    failed: Option<Error>,

    out_ring: VecDeque<u8>,
    in_slab: VecDeque<u8>,

    lower_tx_busy: bool,
    lower_tx_segs: Vec<Bytes>,
    lower_rx_busy: bool,
    lower_eof: bool,

    sendq: VecDeque<Aio>,
    recvq: VecDeque<Aio>,
    scratch: Vec<u8>,
}

pub(crate) struct TlsStream {
    inner: Arc<TlsInner>,
}

struct TlsInner {
    lower: Box<dyn Stream>,
    st: Mutex<TlsSt>,
    tx_aio: Aio,
    rx_aio: Aio,
}

impl TlsStream {
    pub(crate) fn new(lower: Box<dyn Stream>, conn: Box<dyn TlsEngineConn>) -> TlsStream {
        let inner = Arc::new_cyclic(|weak: &Weak<TlsInner>| {
            let wt = weak.clone();
            let tx_aio = Aio::new(move |aio| {
                if let Some(inner) = wt.upgrade() {
                    TlsInner::lower_tx_done(&inner, aio);
                }
            });
            let wr = weak.clone();
            let rx_aio = Aio::new(move |aio| {
                if let Some(inner) = wr.upgrade() {
                    TlsInner::lower_rx_done(&inner, aio);
                }
            });
            TlsInner {
                lower,
                st: Mutex::new(TlsSt {
                    conn,
                    hs_done: false,
                    closed: false,
                    failed: None,
                    out_ring: VecDeque::with_capacity(RECORD_BUF),
                    in_slab: VecDeque::with_capacity(RECORD_BUF),
                    lower_tx_busy: false,
                    lower_tx_segs: Vec::new(),
                    lower_rx_busy: false,
                    lower_eof: false,
                    sendq: VecDeque::new(),
                    recvq: VecDeque::new(),
                    scratch: Vec::new(),
                }),
                tx_aio,
                rx_aio,
            }
        });
        // Kick the handshake so servers that speak first make progress
        // before any user operation arrives.
        {
            let mut st = inner.st.lock().unwrap();
            TlsInner::service(&inner, &mut st);
        }
        TlsStream { inner }
    }
}

impl TlsInner {
    /// Runs engine progress to a fixed point, then re-arms lower I/O.
    fn service(self: &Arc<Self>, st: &mut MutexGuard<'_, TlsSt>) {
        if st.closed {
            return;
        }
        loop {
            let mut progress = false;

            if st.failed.is_none() && !st.hs_done {
                let hs = {
                    let s = &mut **st;
                    let mut chan = Chan {
                        out: &mut s.out_ring,
                        inb: &mut s.in_slab,
                    };
                    s.conn.handshake(&mut chan)
                };
                match hs {
                    Ok(true) => {
                        debug!("tls handshake complete");
                        st.hs_done = true;
                        progress = true;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        debug!("tls handshake failed: {}", e);
                        st.failed = Some(e);
                        self.fail_all(st, e);
                    }
                }
            }

            if st.failed.is_none() && st.hs_done {
                progress |= self.pump_send(st);
                progress |= self.pump_recv(st);
            }

            if !progress {
                break;
            }
        }
        self.flush_lower(st);
        self.fill_lower(st);
    }

    /// Feeds the head of the user send queue to the engine. A send
    /// completes as soon as the engine accepts bytes, even though the
    /// ciphertext may still sit in the ring.
    fn pump_send(self: &Arc<Self>, st: &mut MutexGuard<'_, TlsSt>) -> bool {
        let Some(aio) = st.sendq.front().cloned() else {
            return false;
        };
        let segs = aio.tx();
        let Some(seg) = segs.iter().find(|s| !s.is_empty()) else {
            st.sendq.pop_front();
            aio.finish(Ok(()), 0);
            return true;
        };
        let res = {
            let s = &mut **st;
            let mut chan = Chan {
                out: &mut s.out_ring,
                inb: &mut s.in_slab,
            };
            s.conn.send(&mut chan, seg)
        };
        match res {
            Ok(n) if n > 0 => {
                st.sendq.pop_front();
                aio.finish(Ok(()), n);
                true
            }
            Ok(_) => false,
            Err(Error::Busy) => false,
            Err(e) => {
                st.sendq.pop_front();
                aio.finish_error(e);
                true
            }
        }
    }

    /// Asks the engine for plaintext for the head of the user receive
    /// queue. The first non-empty chunk completes the AIO.
    fn pump_recv(self: &Arc<Self>, st: &mut MutexGuard<'_, TlsSt>) -> bool {
        let Some(aio) = st.recvq.front().cloned() else {
            return false;
        };
        let Some((mut buf, want)) = aio.take_rx_full() else {
            st.recvq.pop_front();
            aio.finish_error(Error::InvalidArgument);
            return true;
        };
        let need = want.saturating_sub(buf.len());
        if need == 0 {
            aio.set_rx(buf, want);
            st.recvq.pop_front();
            aio.finish(Ok(()), 0);
            return true;
        }
        let limit = need.min(RECORD_BUF);
        let res = {
            let s = &mut **st;
            if s.scratch.len() < limit {
                s.scratch.resize(limit, 0);
            }
            let mut chan = Chan {
                out: &mut s.out_ring,
                inb: &mut s.in_slab,
            };
            s.conn.recv(&mut chan, &mut s.scratch[..limit])
        };
        match res {
            Ok(0) => {
                // clean TLS closure
                aio.set_rx(buf, want);
                st.recvq.pop_front();
                aio.finish_error(Error::Closed);
                true
            }
            Ok(n) => {
                buf.extend_from_slice(&st.scratch[..n]);
                aio.set_rx(buf, want);
                st.recvq.pop_front();
                aio.finish(Ok(()), n);
                true
            }
            Err(Error::Busy) => {
                aio.set_rx(buf, want);
                if st.lower_eof {
                    st.recvq.pop_front();
                    aio.finish_error(Error::Closed);
                    return true;
                }
                false
            }
            Err(e) => {
                aio.set_rx(buf, want);
                st.recvq.pop_front();
                aio.finish_error(e);
                true
            }
        }
    }

    /// Pushes ring ciphertext down the lower stream.
    fn flush_lower(self: &Arc<Self>, st: &mut MutexGuard<'_, TlsSt>) {
        if st.lower_tx_busy || st.closed {
            return;
        }
        if st.lower_tx_segs.is_empty() {
            if st.out_ring.is_empty() {
                return;
            }
            let bytes: Bytes = Bytes::from(st.out_ring.drain(..).collect::<Vec<u8>>());
            st.lower_tx_segs = vec![bytes];
        }
        st.lower_tx_busy = true;
        self.tx_aio.set_tx(st.lower_tx_segs.clone());
        self.lower.send(&self.tx_aio);
    }

    /// Pulls ciphertext from the lower stream while the slab has room
    /// and someone could consume it.
    fn fill_lower(self: &Arc<Self>, st: &mut MutexGuard<'_, TlsSt>) {
        if st.lower_rx_busy || st.closed || st.lower_eof || st.failed.is_some() {
            return;
        }
        let space = RECORD_BUF - st.in_slab.len();
        if space == 0 {
            return;
        }
        let wanted = !st.hs_done || !st.recvq.is_empty();
        if !wanted {
            return;
        }
        st.lower_rx_busy = true;
        self.rx_aio.set_rx(BytesMut::with_capacity(space), space);
        self.lower.recv(&self.rx_aio);
    }

    fn lower_tx_done(self: &Arc<Self>, aio: &Aio) {
        let res = aio.result();
        let count = aio.count();
        let mut st = self.st.lock().unwrap();
        st.lower_tx_busy = false;
        match res {
            Ok(()) => {
                advance_segs(&mut st.lower_tx_segs, count);
                self.service(&mut st);
            }
            Err(e) => {
                debug!("tls lower send failed: {}", e);
                st.failed = Some(e);
                self.fail_all(&mut st, e);
            }
        }
    }

    fn lower_rx_done(self: &Arc<Self>, aio: &Aio) {
        let res = aio.result();
        let mut st = self.st.lock().unwrap();
        st.lower_rx_busy = false;
        let buf = aio.take_rx().unwrap_or_default();
        match res {
            Ok(()) => {
                st.in_slab.extend(buf.iter());
                self.service(&mut st);
            }
            Err(Error::Closed) | Err(Error::ConnShutdown) => {
                st.lower_eof = true;
                self.service(&mut st);
                // anything the engine cannot satisfy now never arrives
                let pending: Vec<Aio> = st.recvq.drain(..).collect();
                drop(st);
                for aio in pending {
                    aio.finish_error(Error::Closed);
                }
            }
            Err(e) => {
                st.failed = Some(e);
                self.fail_all(&mut st, e);
            }
        }
    }

    /// Fails every queued user operation; used for handshake and lower
    /// transport failures.
    fn fail_all(self: &Arc<Self>, st: &mut MutexGuard<'_, TlsSt>, err: Error) {
        let mut pending: Vec<Aio> = st.sendq.drain(..).collect();
        pending.extend(st.recvq.drain(..));
        for aio in pending {
            aio.finish_error(err);
        }
    }

    fn submit_send(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.st.lock().unwrap();
        if st.closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        if let Some(e) = st.failed {
            drop(st);
            aio.finish_error(e);
            return;
        }
        let me = self.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            let err = res.err().unwrap_or(Error::Canceled);
            let found = {
                let mut st = me.st.lock().unwrap();
                match st.sendq.iter().position(|q| q.same(a)) {
                    Some(pos) => {
                        st.sendq.remove(pos);
                        true
                    }
                    None => false,
                }
            };
            if found {
                a.finish_error(err);
            }
        })) {
            drop(st);
            aio.finish_error(rv);
            return;
        }
        st.sendq.push_back(aio.clone());
        self.service(&mut st);
    }

    fn submit_recv(self: &Arc<Self>, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let mut st = self.st.lock().unwrap();
        if st.closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        if let Some(e) = st.failed {
            drop(st);
            aio.finish_error(e);
            return;
        }
        let me = self.clone();
        if let Err(rv) = aio.schedule(Box::new(move |a: &Aio, res: Result<()>| {
            let err = res.err().unwrap_or(Error::Canceled);
            let found = {
                let mut st = me.st.lock().unwrap();
                match st.recvq.iter().position(|q| q.same(a)) {
                    Some(pos) => {
                        st.recvq.remove(pos);
                        true
                    }
                    None => false,
                }
            };
            if found {
                a.finish_error(err);
            }
        })) {
            drop(st);
            aio.finish_error(rv);
            return;
        }
        st.recvq.push_back(aio.clone());
        self.service(&mut st);
    }

    fn close_all(self: &Arc<Self>) {
        let pending = {
            let mut st = self.st.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            {
                let s = &mut *st;
                let mut chan = Chan {
                    out: &mut s.out_ring,
                    inb: &mut s.in_slab,
                };
                s.conn.close(&mut chan);
            }
            let mut pending: Vec<Aio> = st.sendq.drain(..).collect();
            pending.extend(st.recvq.drain(..));
            pending
        };
        for aio in pending {
            aio.finish_error(Error::Closed);
        }
        self.lower.close();
    }
}

impl Stream for TlsStream {
    fn send(&self, aio: &Aio) {
        self.inner.submit_send(aio);
    }

    fn recv(&self, aio: &Aio) {
        self.inner.submit_recv(aio);
    }

    fn close(&self) {
        self.inner.close_all();
    }

    fn stop(&self) {
        self.inner.close_all();
        self.inner.tx_aio.stop();
        self.inner.rx_aio.stop();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            PROP_VERIFIED => {
                let st = self.inner.st.lock().unwrap();
                Ok(PropValue::Bool(st.conn.verified()))
            }
            PROP_PEER_CN => {
                let st = self.inner.st.lock().unwrap();
                st.conn
                    .peer_cn()
                    .map(PropValue::Str)
                    .ok_or(Error::NotSupported)
            }
            _ => self.inner.lower.get(name),
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.inner.lower.set(name, value)
    }
}

impl Drop for TlsStream {
    fn drop(&mut self) {
        self.inner.close_all();
    }
}
