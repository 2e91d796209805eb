//! The poller thread.
//!
//! One thread owns the `mio::Poll`. Other threads request registration
//! and deregistration through a command queue flushed by a `Waker`;
//! readiness events are delivered to the owning object on the poller
//! thread itself.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use log::{error, warn};
use mio::{Events, Poll, Registry, Token, Waker};

/// Reserved token for the waker.
const WAKE: Token = Token(usize::MAX);

/// An object registered with the poller. Callbacks run on the poller
/// thread; implementations must not block.
pub(crate) trait Pollable: Send + Sync {
    /// Attach to the selector. Returning an error (including when the
    /// object was closed before the command was processed) keeps it out
    /// of the dispatch table.
    fn register(&self, registry: &Registry, token: Token) -> io::Result<()>;
    fn deregister(&self, registry: &Registry);
    /// Registration was requested but failed; fail pending operations.
    fn register_failed(&self, err: io::Error);
    /// Readiness (or initial) notification.
    fn ready(self: Arc<Self>, readable: bool, writable: bool);
}

enum Cmd {
    Register(Token, Arc<dyn Pollable>),
    Deregister(Token),
}

pub(crate) struct Poller {
    waker: Waker,
    cmds: Mutex<Vec<Cmd>>,
    next_token: AtomicUsize,
}

pub(crate) fn get() -> &'static Poller {
    static POLLER: OnceLock<Poller> = OnceLock::new();
    POLLER.get_or_init(|| {
        let poll = Poll::new().expect("create poll instance");
        let waker = Waker::new(poll.registry(), WAKE).expect("create poll waker");
        thread::Builder::new()
            .name("braid-poll".into())
            .spawn(move || run(poll))
            .expect("spawn poller thread");
        Poller {
            waker,
            cmds: Mutex::new(Vec::new()),
            next_token: AtomicUsize::new(1),
        }
    })
}

impl Poller {
    /// Reserves a token ahead of registration so the owner can record it
    /// before events (or a concurrent close) can race the submission.
    pub(crate) fn alloc_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn submit(&self, token: Token, target: Arc<dyn Pollable>) {
        self.push(Cmd::Register(token, target));
    }

    pub(crate) fn deregister(&self, token: Token) {
        self.push(Cmd::Deregister(token));
    }

    fn push(&self, cmd: Cmd) {
        self.cmds.lock().unwrap().push(cmd);
        if let Err(e) = self.waker.wake() {
            warn!("poller wake failed: {}", e);
        }
    }
}

fn run(mut poll: Poll) {
    let mut events = Events::with_capacity(128);
    let mut handlers: HashMap<Token, Arc<dyn Pollable>> = HashMap::new();

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("poller failed, I/O dispatch halted: {}", e);
            return;
        }

        for ev in events.iter() {
            let token = ev.token();
            if token == WAKE {
                continue;
            }
            if let Some(h) = handlers.get(&token) {
                h.clone().ready(ev.is_readable(), ev.is_writable());
            }
        }

        let cmds: Vec<Cmd> = std::mem::take(&mut *get().cmds.lock().unwrap());
        for cmd in cmds {
            match cmd {
                Cmd::Register(token, target) => match target.register(poll.registry(), token) {
                    Ok(()) => {
                        handlers.insert(token, target);
                    }
                    Err(e) => target.register_failed(e),
                },
                Cmd::Deregister(token) => {
                    if let Some(h) = handlers.remove(&token) {
                        h.deregister(poll.registry());
                    }
                }
            }
        }
    }
}
