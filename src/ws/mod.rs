//! WebSocket transport: RFC 6455 framing over TCP or TLS, bootstrapped
//! by an HTTP upgrade.
//!
//! Connections run in stream mode by default (the SP transport layers
//! its own framing over the byte stream) or in message mode, where each
//! send and receive is one whole WebSocket message.

pub(crate) mod frame;
pub(crate) mod handshake;
pub(crate) mod stream;

use std::sync::{Arc, Mutex};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::platform::tcp::{TcpDialer, TcpListener};
use crate::stream::{PropValue, Stream, StreamDialer, StreamListener};
use crate::tls::{TlsDialer, TlsListener};
use crate::url::Url;

pub use self::handshake::{UpgradeRequest, UpgradeResponse};
use self::stream::WsConn;

/// Whole-message send/receive instead of byte-stream semantics (`Bool`).
pub const PROP_MSGMODE: &str = "ws-msgmode";
/// Send text frames instead of binary (`Bool`).
pub const PROP_SEND_TEXT: &str = "ws-send-text";
/// Maximum payload bytes per transmitted frame (`Size`).
pub const PROP_FRAGSIZE: &str = "ws-fragsize";
/// Maximum accepted inbound frame payload (`Size`).
pub const PROP_MAXFRAME: &str = "ws-maxframe";
/// Maximum accepted inbound message, message mode only (`Size`).
pub const PROP_RECVMAX: &str = "ws-recvmax";
/// Subprotocol: offered by a dialer, supported list on a listener
/// (`Str`, comma separated). On a connection, the selected one.
pub const PROP_PROTOCOL: &str = "ws-protocol";

/// A hook a listener may install to inspect the upgrade request and
/// override the response (auth, extra headers, refusal).
pub type Hook = dyn Fn(&UpgradeRequest, &mut UpgradeResponse) + Send + Sync;

#[derive(Clone, Copy, PartialEq)]
pub(crate) enum Role {
    Client,
    Server,
}

#[derive(Clone, Copy, PartialEq)]
pub(crate) enum Mode {
    Stream,
    Message,
}

#[derive(Clone)]
pub(crate) struct WsOpts {
    pub(crate) mode: Mode,
    pub(crate) text: bool,
    pub(crate) fragsize: usize,
    pub(crate) maxframe: usize,
    pub(crate) recvmax: usize,
    pub(crate) protocol: Option<String>,
}

impl Default for WsOpts {
    fn default() -> WsOpts {
        WsOpts {
            mode: Mode::Stream,
            text: false,
            fragsize: 64 * 1024,
            maxframe: 1024 * 1024,
            recvmax: 1024 * 1024,
            protocol: None,
        }
    }
}

impl WsOpts {
    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            PROP_MSGMODE => Ok(PropValue::Bool(self.mode == Mode::Message)),
            PROP_SEND_TEXT => Ok(PropValue::Bool(self.text)),
            PROP_FRAGSIZE => Ok(PropValue::Size(self.fragsize)),
            PROP_MAXFRAME => Ok(PropValue::Size(self.maxframe)),
            PROP_RECVMAX => Ok(PropValue::Size(self.recvmax)),
            PROP_PROTOCOL => self
                .protocol
                .clone()
                .map(PropValue::Str)
                .ok_or(Error::NotSupported),
            _ => Err(Error::NotSupported),
        }
    }

    fn set(&mut self, name: &str, value: &PropValue) -> Result<()> {
        match (name, value) {
            (PROP_MSGMODE, PropValue::Bool(on)) => {
                self.mode = if *on { Mode::Message } else { Mode::Stream };
                Ok(())
            }
            (PROP_SEND_TEXT, PropValue::Bool(on)) => {
                self.text = *on;
                Ok(())
            }
            (PROP_FRAGSIZE, PropValue::Size(n)) if *n > 0 => {
                self.fragsize = *n;
                Ok(())
            }
            (PROP_MAXFRAME, PropValue::Size(n)) if *n > 0 => {
                self.maxframe = *n;
                Ok(())
            }
            (PROP_RECVMAX, PropValue::Size(n)) if *n > 0 => {
                self.recvmax = *n;
                Ok(())
            }
            (PROP_PROTOCOL, PropValue::Str(s)) => {
                self.protocol = Some(s.clone());
                Ok(())
            }
            (
                PROP_MSGMODE | PROP_SEND_TEXT | PROP_FRAGSIZE | PROP_MAXFRAME | PROP_RECVMAX
                | PROP_PROTOCOL,
                _,
            ) => Err(Error::InvalidArgument),
            _ => Err(Error::NotSupported),
        }
    }
}

fn lower_dialer(url: &Url) -> Result<Box<dyn StreamDialer>> {
    if url.is_tls() {
        Ok(Box::new(TlsDialer::over_tcp(url.clone())?))
    } else {
        Ok(Box::new(TcpDialer::new(url.clone())?))
    }
}

fn lower_listener(url: &Url) -> Result<Box<dyn StreamListener>> {
    if url.is_tls() {
        Ok(Box::new(TlsListener::over_tcp(url.clone())?))
    } else {
        Ok(Box::new(TcpListener::new(url.clone())?))
    }
}

/// The connect-or-upgrade stage a cancel has to reach.
enum ChainTarget {
    Lower(Aio),
    Upgrade(WsConn),
    Done,
}

fn chain_cancel(target: &Arc<Mutex<ChainTarget>>, err: Error) {
    let t = std::mem::replace(&mut *target.lock().unwrap(), ChainTarget::Done);
    match t {
        ChainTarget::Lower(aio) => aio.abort(err),
        ChainTarget::Upgrade(conn) => conn.abort_handshake(err),
        ChainTarget::Done => {}
    }
}

pub struct WsDialer {
    url: Url,
    lower: Box<dyn StreamDialer>,
    opts: Mutex<WsOpts>,
}

impl WsDialer {
    pub fn new(url: Url) -> Result<WsDialer> {
        let lower = lower_dialer(&url)?;
        Ok(WsDialer {
            url,
            lower,
            opts: Mutex::new(WsOpts::default()),
        })
    }

    fn host_header(&self) -> Result<String> {
        let port = self.url.effective_port()?;
        let host = self.url.host();
        if host.contains(':') {
            Ok(format!("[{}]:{}", host, port))
        } else {
            Ok(format!("{}:{}", host, port))
        }
    }
}

impl StreamDialer for WsDialer {
    fn dial(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let host = match self.host_header() {
            Ok(h) => h,
            Err(e) => {
                aio.finish_error(e);
                return;
            }
        };
        let path = self.url.path().to_string();
        let opts = self.opts.lock().unwrap().clone();
        let user = aio.clone();
        let target = Arc::new(Mutex::new(ChainTarget::Done));

        let t = target.clone();
        let inner_aio = Aio::new(move |ia: &Aio| match ia.result() {
            Ok(()) => match ia.take_output::<Box<dyn Stream>>(0) {
                Some(lower) => {
                    let conn =
                        WsConn::client(lower, host.clone(), path.clone(), opts.clone(), user.clone());
                    *t.lock().unwrap() = ChainTarget::Upgrade(conn);
                }
                None => user.finish_error(Error::Closed),
            },
            Err(e) => user.finish_error(e),
        });

        *target.lock().unwrap() = ChainTarget::Lower(inner_aio.clone());
        let t = target.clone();
        if let Err(rv) = aio.schedule(Box::new(move |_a: &Aio, res: Result<()>| {
            chain_cancel(&t, res.err().unwrap_or(Error::Canceled));
        })) {
            aio.finish_error(rv);
            return;
        }
        self.lower.dial(&inner_aio);
    }

    fn close(&self) {
        self.lower.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match self.opts.lock().unwrap().get(name) {
            Err(Error::NotSupported) => self.lower.get(name),
            other => other,
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        match self.opts.lock().unwrap().set(name, &value) {
            Err(Error::NotSupported) => self.lower.set(name, value),
            other => other,
        }
    }
}

pub struct WsListener {
    lower: Box<dyn StreamListener>,
    opts: Mutex<WsOpts>,
    hook: Mutex<Option<Arc<Hook>>>,
}

impl WsListener {
    pub fn new(url: Url) -> Result<WsListener> {
        let lower = lower_listener(&url)?;
        Ok(WsListener {
            lower,
            opts: Mutex::new(WsOpts::default()),
            hook: Mutex::new(None),
        })
    }

    /// Installs the upgrade hook. Must happen before `listen`.
    pub fn set_hook<F>(&self, hook: F)
    where
        F: Fn(&UpgradeRequest, &mut UpgradeResponse) + Send + Sync + 'static,
    {
        *self.hook.lock().unwrap() = Some(Arc::new(hook));
    }
}

impl StreamListener for WsListener {
    fn listen(&self) -> Result<()> {
        self.lower.listen()
    }

    fn accept(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let opts = self.opts.lock().unwrap().clone();
        let hook = self.hook.lock().unwrap().clone();
        let user = aio.clone();
        let target = Arc::new(Mutex::new(ChainTarget::Done));

        let t = target.clone();
        let inner_aio = Aio::new(move |ia: &Aio| match ia.result() {
            Ok(()) => match ia.take_output::<Box<dyn Stream>>(0) {
                Some(lower) => {
                    let conn = WsConn::server(lower, opts.clone(), hook.clone(), user.clone());
                    *t.lock().unwrap() = ChainTarget::Upgrade(conn);
                }
                None => user.finish_error(Error::Closed),
            },
            Err(e) => user.finish_error(e),
        });

        *target.lock().unwrap() = ChainTarget::Lower(inner_aio.clone());
        let t = target.clone();
        if let Err(rv) = aio.schedule(Box::new(move |_a: &Aio, res: Result<()>| {
            chain_cancel(&t, res.err().unwrap_or(Error::Canceled));
        })) {
            aio.finish_error(rv);
            return;
        }
        self.lower.accept(&inner_aio);
    }

    fn close(&self) {
        self.lower.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match self.opts.lock().unwrap().get(name) {
            Err(Error::NotSupported) => self.lower.get(name),
            other => other,
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        match self.opts.lock().unwrap().set(name, &value) {
            Err(Error::NotSupported) => self.lower.set(name, value),
            other => other,
        }
    }
}
