//! Platform I/O: the mio poller and the concrete socket transports.
//!
//! Everything here runs the same shape: a single poller thread owns the
//! `mio::Poll`, connections cache edge-triggered readiness and drain
//! their AIO queues with non-blocking syscalls, and completions fan out
//! through the AIO worker pool.

pub(crate) mod conn;
#[cfg(unix)]
pub(crate) mod ipc;
pub(crate) mod poller;
pub(crate) mod tcp;
