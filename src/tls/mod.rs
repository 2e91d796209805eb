//! TLS: the pluggable engine contract, the reference-counted
//! configuration object, and dialer/listener wrappers that layer the
//! stream wrapper over TCP.
//!
//! The cryptography itself lives in an engine registered by the
//! application (or a test); this crate only moves ciphertext between the
//! engine and the lower stream.

pub(crate) mod stream;

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::platform::tcp::{TcpDialer, TcpListener};
use crate::stream::{PropValue, Stream, StreamDialer, StreamListener};
use crate::url::Url;

use self::stream::TlsStream;

/// Property name binding a [`TlsConfig`] to a dialer or listener.
pub const PROP_CONFIG: &str = "tls-config";
/// Whether the peer presented a verified certificate (`Bool`).
pub const PROP_VERIFIED: &str = "tls-verified";
/// The peer certificate's common name (`Str`).
pub const PROP_PEER_CN: &str = "tls-peer-cn";

/// TLS protocol versions this crate permits. Anything older is refused
/// at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// Peer authentication policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No verification; connections proceed regardless.
    None,
    /// Verify when a certificate is presented.
    Optional,
    /// Require a verified certificate.
    Required,
}

/// Which side of the handshake a configuration drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Client,
    Server,
}

/// An own-certificate entry (PEM blobs are opaque to the core).
#[derive(Clone)]
pub struct CertKey {
    pub cert: String,
    pub key: String,
    pub passwd: Option<String>,
}

/// A pre-shared key identity.
#[derive(Clone)]
pub struct Psk {
    pub identity: String,
    pub key: Vec<u8>,
}

pub(crate) struct ConfigSt {
    busy: bool,
    pub(crate) server_name: Option<String>,
    pub(crate) auth_mode: AuthMode,
    pub(crate) ca_chain: Option<String>,
    pub(crate) own_certs: Vec<CertKey>,
    pub(crate) psks: Vec<Psk>,
    pub(crate) min_version: TlsVersion,
    pub(crate) max_version: TlsVersion,
}

struct ConfigInner {
    mode: TlsMode,
    st: Mutex<ConfigSt>,
}

/// A reference-counted TLS configuration. Once bound to an endpoint or
/// used to start a connection it becomes busy and setters fail.
#[derive(Clone)]
pub struct TlsConfig {
    inner: Arc<ConfigInner>,
}

impl TlsConfig {
    pub fn new(mode: TlsMode) -> TlsConfig {
        TlsConfig {
            inner: Arc::new(ConfigInner {
                mode,
                st: Mutex::new(ConfigSt {
                    busy: false,
                    server_name: None,
                    auth_mode: match mode {
                        TlsMode::Client => AuthMode::Required,
                        TlsMode::Server => AuthMode::None,
                    },
                    ca_chain: None,
                    own_certs: Vec::new(),
                    psks: Vec::new(),
                    min_version: TlsVersion::Tls12,
                    max_version: TlsVersion::Tls13,
                }),
            }),
        }
    }

    pub fn mode(&self) -> TlsMode {
        self.inner.mode
    }

    fn mutate<F: FnOnce(&mut ConfigSt) -> Result<()>>(&self, f: F) -> Result<()> {
        let mut st = self.inner.st.lock().unwrap();
        if st.busy {
            return Err(Error::Busy);
        }
        f(&mut st)
    }

    /// The server name sent (client) or answered (server) in SNI.
    pub fn set_server_name(&self, name: &str) -> Result<()> {
        self.mutate(|st| {
            st.server_name = Some(name.to_string());
            Ok(())
        })
    }

    pub fn set_auth_mode(&self, mode: AuthMode) -> Result<()> {
        self.mutate(|st| {
            st.auth_mode = mode;
            Ok(())
        })
    }

    /// CA chain (and optional CRL) in PEM form.
    pub fn set_ca_chain(&self, pem: &str) -> Result<()> {
        self.mutate(|st| {
            st.ca_chain = Some(pem.to_string());
            Ok(())
        })
    }

    /// Adds an own certificate/key pair. Servers may carry several (for
    /// different key algorithms); clients one.
    pub fn set_own_cert(&self, cert: &str, key: &str, passwd: Option<&str>) -> Result<()> {
        let mode = self.inner.mode;
        self.mutate(|st| {
            if mode == TlsMode::Client && !st.own_certs.is_empty() {
                return Err(Error::Busy);
            }
            st.own_certs.push(CertKey {
                cert: cert.to_string(),
                key: key.to_string(),
                passwd: passwd.map(str::to_string),
            });
            Ok(())
        })
    }

    /// Adds a PSK identity: several on a server (looked up at handshake
    /// time), exactly one on a client.
    pub fn set_psk(&self, identity: &str, key: &[u8]) -> Result<()> {
        let mode = self.inner.mode;
        self.mutate(|st| {
            if mode == TlsMode::Client && !st.psks.is_empty() {
                return Err(Error::Busy);
            }
            st.psks.push(Psk {
                identity: identity.to_string(),
                key: key.to_vec(),
            });
            Ok(())
        })
    }

    /// Restricts the permitted protocol versions. Only 1.2 and 1.3
    /// exist here; anything else never parses into a [`TlsVersion`].
    pub fn set_version(&self, min: TlsVersion, max: TlsVersion) -> Result<()> {
        if min > max {
            return Err(Error::InvalidArgument);
        }
        self.mutate(|st| {
            st.min_version = min;
            st.max_version = max;
            Ok(())
        })
    }

    /// Marks the configuration immutable; called when it is bound or
    /// first used.
    pub(crate) fn mark_busy(&self) {
        self.inner.st.lock().unwrap().busy = true;
    }

    /// Read access for engines building a session.
    pub fn with<R>(&self, f: impl FnOnce(&TlsConfigView<'_>) -> R) -> R {
        let st = self.inner.st.lock().unwrap();
        f(&TlsConfigView {
            mode: self.inner.mode,
            st: &st,
        })
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl PartialEq for TlsConfig {
    fn eq(&self, other: &TlsConfig) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Borrowed view of a configuration's contents.
pub struct TlsConfigView<'a> {
    pub mode: TlsMode,
    st: &'a ConfigSt,
}

impl TlsConfigView<'_> {
    pub fn server_name(&self) -> Option<&str> {
        self.st.server_name.as_deref()
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.st.auth_mode
    }

    pub fn ca_chain(&self) -> Option<&str> {
        self.st.ca_chain.as_deref()
    }

    pub fn own_certs(&self) -> &[CertKey] {
        &self.st.own_certs
    }

    pub fn psks(&self) -> &[Psk] {
        &self.st.psks
    }

    pub fn versions(&self) -> (TlsVersion, TlsVersion) {
        (self.st.min_version, self.st.max_version)
    }
}

// ---- engine contract ---------------------------------------------------

/// The ciphertext channel the wrapper hands to every engine call. The
/// engine writes records out through it and reads records in; `Busy`
/// signals back-pressure (full outbound ring) or starvation (empty
/// inbound slab).
pub trait TlsChannel {
    fn put_ciphertext(&mut self, buf: &[u8]) -> Result<usize>;
    fn get_ciphertext(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// One TLS session.
pub trait TlsEngineConn: Send {
    /// Advances the handshake. `Ok(true)` when complete; errors are
    /// fatal for the connection.
    fn handshake(&mut self, chan: &mut dyn TlsChannel) -> Result<bool>;
    /// Encrypts plaintext into the channel. `Busy` when no progress is
    /// possible.
    fn send(&mut self, chan: &mut dyn TlsChannel, buf: &[u8]) -> Result<usize>;
    /// Decrypts plaintext out of the channel. `Busy` when starved,
    /// `Ok(0)` on clean TLS closure.
    fn recv(&mut self, chan: &mut dyn TlsChannel, buf: &mut [u8]) -> Result<usize>;
    /// Sends the close notification if the engine supports one.
    fn close(&mut self, chan: &mut dyn TlsChannel);
    fn verified(&self) -> bool;
    fn peer_cn(&self) -> Option<String>;
    fn peer_alt_names(&self) -> Vec<String>;
}

/// A TLS implementation. One engine serves the whole process.
pub trait TlsEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn fips_mode(&self) -> bool;
    fn conn(&self, config: &TlsConfig) -> Result<Box<dyn TlsEngineConn>>;
}

fn engine_slot() -> &'static Mutex<Option<Arc<dyn TlsEngine>>> {
    static ENGINE: OnceLock<Mutex<Option<Arc<dyn TlsEngine>>>> = OnceLock::new();
    ENGINE.get_or_init(|| Mutex::new(None))
}

/// Registers the process-wide TLS engine, replacing any prior one.
pub fn register_engine(engine: Arc<dyn TlsEngine>) {
    *engine_slot().lock().unwrap() = Some(engine);
}

pub(crate) fn engine() -> Result<Arc<dyn TlsEngine>> {
    engine_slot()
        .lock()
        .unwrap()
        .clone()
        .ok_or(Error::NotSupported)
}

// ---- endpoint wrappers -------------------------------------------------

pub(crate) struct TlsDialer {
    tcp: TcpDialer,
    config: Mutex<TlsConfig>,
}

impl TlsDialer {
    pub(crate) fn over_tcp(url: Url) -> Result<TlsDialer> {
        let config = TlsConfig::new(TlsMode::Client);
        if !url.host().is_empty() {
            let _ = config.set_server_name(url.host());
        }
        Ok(TlsDialer {
            tcp: TcpDialer::new(url)?,
            config: Mutex::new(config),
        })
    }
}

impl StreamDialer for TlsDialer {
    fn dial(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let engine = match engine() {
            Ok(e) => e,
            Err(e) => {
                aio.finish_error(e);
                return;
            }
        };
        let config = self.config.lock().unwrap().clone();
        config.mark_busy();
        let conn = match engine.conn(&config) {
            Ok(c) => c,
            Err(e) => {
                aio.finish_error(e);
                return;
            }
        };
        chain_wrap(aio, conn, |inner_aio| self.tcp.dial(inner_aio));
    }

    fn close(&self) {
        self.tcp.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            PROP_CONFIG => Ok(PropValue::Tls(self.config.lock().unwrap().clone())),
            _ => self.tcp.get(name),
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        match (name, value) {
            (PROP_CONFIG, PropValue::Tls(cfg)) => {
                if cfg.mode() != TlsMode::Client {
                    return Err(Error::InvalidArgument);
                }
                *self.config.lock().unwrap() = cfg;
                Ok(())
            }
            (PROP_CONFIG, _) => Err(Error::InvalidArgument),
            (name, value) => self.tcp.set(name, value),
        }
    }
}

pub(crate) struct TlsListener {
    tcp: TcpListener,
    config: Mutex<TlsConfig>,
}

impl TlsListener {
    pub(crate) fn over_tcp(url: Url) -> Result<TlsListener> {
        Ok(TlsListener {
            tcp: TcpListener::new(url)?,
            config: Mutex::new(TlsConfig::new(TlsMode::Server)),
        })
    }
}

impl StreamListener for TlsListener {
    fn listen(&self) -> Result<()> {
        engine()?;
        self.config.lock().unwrap().mark_busy();
        self.tcp.listen()
    }

    fn accept(&self, aio: &Aio) {
        if !aio.begin() {
            return;
        }
        let engine = match engine() {
            Ok(e) => e,
            Err(e) => {
                aio.finish_error(e);
                return;
            }
        };
        let config = self.config.lock().unwrap().clone();
        let conn = match engine.conn(&config) {
            Ok(c) => c,
            Err(e) => {
                aio.finish_error(e);
                return;
            }
        };
        chain_wrap(aio, conn, |inner_aio| self.tcp.accept(inner_aio));
    }

    fn close(&self) {
        self.tcp.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            PROP_CONFIG => Ok(PropValue::Tls(self.config.lock().unwrap().clone())),
            _ => self.tcp.get(name),
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        match (name, value) {
            (PROP_CONFIG, PropValue::Tls(cfg)) => {
                if cfg.mode() != TlsMode::Server {
                    return Err(Error::InvalidArgument);
                }
                *self.config.lock().unwrap() = cfg;
                Ok(())
            }
            (PROP_CONFIG, _) => Err(Error::InvalidArgument),
            (name, value) => self.tcp.set(name, value),
        }
    }
}

/// Chains a lower dial/accept behind `aio` (already begun) and wraps the
/// produced stream in TLS before completing it.
fn chain_wrap<F>(aio: &Aio, conn: Box<dyn TlsEngineConn>, issue: F)
where
    F: FnOnce(&Aio),
{
    let user = aio.clone();
    let conn = Mutex::new(Some(conn));
    let inner_aio = Aio::new(move |ia: &Aio| {
        match ia.result() {
            Ok(()) => match (ia.take_output::<Box<dyn Stream>>(0), conn.lock().unwrap().take()) {
                (Some(lower), Some(conn)) => {
                    let tls: Box<dyn Stream> = Box::new(TlsStream::new(lower, conn));
                    user.set_output(0, tls);
                    user.finish(Ok(()), 0);
                }
                _ => user.finish_error(Error::Closed),
            },
            Err(e) => user.finish_error(e),
        }
    });
    let chained = inner_aio.clone();
    if let Err(rv) = aio.schedule(Box::new(move |_a: &Aio, res: crate::error::Result<()>| {
        chained.abort(res.err().unwrap_or(Error::Canceled));
    })) {
        aio.finish_error(rv);
        return;
    }
    issue(&inner_aio);
}
