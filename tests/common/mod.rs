//! Shared test support: socket pairs over arbitrary URLs, synchronous
//! message helpers, and a pass-through TLS engine.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use braid::sp::{proto_id, ProtocolInfo};
use braid::stream::{prop, PropValue};
use braid::tls::{self, TlsChannel, TlsConfig, TlsEngine, TlsEngineConn};
use braid::{Aio, Error, Listener, Message, Pipe, Result, Socket};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn pair_info() -> ProtocolInfo {
    ProtocolInfo::new(proto_id::PAIR, "pair", proto_id::PAIR, "pair")
}

/// Rewrites a `:0` bind URL into the concrete dialable URL once the
/// listener reports its ephemeral port.
pub fn dial_url(bind_url: &str, listener: &Listener) -> String {
    if !bind_url.contains(":0") {
        return bind_url.to_string();
    }
    match listener.get(prop::LOCAL_ADDR) {
        Ok(PropValue::Addr(addr)) => {
            let scheme = bind_url.split("://").next().unwrap();
            let path = bind_url
                .splitn(2, "://")
                .nth(1)
                .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
                .unwrap_or("");
            format!("{}://{}{}", scheme, addr, path)
        }
        _ => bind_url.to_string(),
    }
}

pub struct SocketPair {
    pub client: Socket,
    pub server: Socket,
    pub client_pipe: Pipe,
    pub server_pipe: Pipe,
    pub listener: Listener,
}

/// Listens, dials, and waits until both sides hold a negotiated pipe.
pub fn connect_pair(bind_url: &str) -> Result<SocketPair> {
    connect_pair_with(bind_url, |_c, _s| {})
}

pub fn connect_pair_with<F>(bind_url: &str, setup: F) -> Result<SocketPair>
where
    F: FnOnce(&Socket, &Socket),
{
    let server = Socket::new(pair_info());
    let client = Socket::new(pair_info());
    setup(&client, &server);

    let listener = server.listen(bind_url)?;
    let url = dial_url(bind_url, &listener);

    let server_accept = Aio::new(|_| {});
    server.accept_pipe(&server_accept);

    let _dialer = client.dial_sync(&url)?;

    let client_accept = Aio::new(|_| {});
    client.accept_pipe(&client_accept);
    client_accept.wait();
    client_accept.result()?;
    let client_pipe = client_accept.take_output::<Pipe>(0).ok_or(Error::Closed)?;

    server_accept.wait();
    server_accept.result()?;
    let server_pipe = server_accept.take_output::<Pipe>(0).ok_or(Error::Closed)?;

    Ok(SocketPair {
        client,
        server,
        client_pipe,
        server_pipe,
        listener,
    })
}

pub fn send_msg(pipe: &Pipe, msg: Message) -> Result<()> {
    let aio = Aio::new(|_| {});
    aio.set_msg(msg);
    pipe.send(&aio);
    aio.wait();
    aio.result()
}

pub fn recv_msg(pipe: &Pipe) -> Result<Message> {
    let aio = Aio::new(|_| {});
    pipe.recv(&aio);
    aio.wait();
    aio.result()?;
    aio.take_msg().ok_or(Error::Closed)
}

// ---- pass-through TLS engine ------------------------------------------
//
// Carries plaintext through unchanged after a four-byte hello exchange,
// which is enough to exercise the record rings, the handshake
// interleaving, and back-pressure.

const CLIENT_HELLO: &[u8; 4] = b"BRD?";
const SERVER_HELLO: &[u8; 4] = b"BRD!";

pub struct NullEngine;

struct NullConn {
    server: bool,
    hello_sent: usize,
    hello_got: usize,
    done: bool,
}

impl TlsEngineConn for NullConn {
    fn handshake(&mut self, chan: &mut dyn TlsChannel) -> Result<bool> {
        if self.done {
            return Ok(true);
        }
        let (expect, reply): (&[u8; 4], &[u8; 4]) = if self.server {
            (CLIENT_HELLO, SERVER_HELLO)
        } else {
            (SERVER_HELLO, CLIENT_HELLO)
        };
        // a client speaks first; a server answers after hearing it
        if !self.server && self.hello_sent < reply.len() {
            if let Ok(n) = chan.put_ciphertext(&reply[self.hello_sent..]) {
                self.hello_sent += n;
            }
        }
        while self.hello_got < expect.len() {
            let mut byte = [0u8; 1];
            match chan.get_ciphertext(&mut byte) {
                Ok(_) => {
                    if byte[0] != expect[self.hello_got] {
                        return Err(Error::ProtocolError);
                    }
                    self.hello_got += 1;
                }
                Err(Error::Busy) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        if self.server && self.hello_sent < reply.len() {
            match chan.put_ciphertext(&reply[self.hello_sent..]) {
                Ok(n) => self.hello_sent += n,
                Err(Error::Busy) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        if self.hello_sent == reply.len() && self.hello_got == expect.len() {
            self.done = true;
            return Ok(true);
        }
        Ok(false)
    }

    fn send(&mut self, chan: &mut dyn TlsChannel, buf: &[u8]) -> Result<usize> {
        chan.put_ciphertext(buf)
    }

    fn recv(&mut self, chan: &mut dyn TlsChannel, buf: &mut [u8]) -> Result<usize> {
        chan.get_ciphertext(buf)
    }

    fn close(&mut self, _chan: &mut dyn TlsChannel) {}

    fn verified(&self) -> bool {
        false
    }

    fn peer_cn(&self) -> Option<String> {
        None
    }

    fn peer_alt_names(&self) -> Vec<String> {
        Vec::new()
    }
}

impl TlsEngine for NullEngine {
    fn name(&self) -> &'static str {
        "null"
    }

    fn description(&self) -> &'static str {
        "pass-through test engine"
    }

    fn version(&self) -> &'static str {
        "0"
    }

    fn fips_mode(&self) -> bool {
        false
    }

    fn conn(&self, config: &TlsConfig) -> Result<Box<dyn TlsEngineConn>> {
        Ok(Box::new(NullConn {
            server: config.mode() == tls::TlsMode::Server,
            hello_sent: 0,
            hello_got: 0,
            done: false,
        }))
    }
}

pub fn register_null_engine() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tls::register_engine(Arc::new(NullEngine));
    });
}
