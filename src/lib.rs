//! # braid
//!
//! A message-oriented scalability-protocols (SP) socket core.
//!
//! Applications open a [`Socket`] with a protocol identity, attach
//! dialers and listeners by URL, and exchange framed messages with
//! remote peers over pipes. Underneath, every operation is a one-shot
//! asynchronous [`Aio`] with timeouts and cancellation; transports
//! (TCP, IPC, in-process, TLS, WebSocket) plug in as byte streams and
//! are negotiated into pipes with the 8-byte SP header.
//!
//! The pattern policies themselves (REQ/REP, PUB/SUB, BUS, ...) are
//! built on top of this crate through the [`sp::Protocol`] seam; the
//! core validates peer identity, frames messages, and manages the
//! lifecycle of connections.
//!
//! ## Example
//!
//! ```no_run
//! use braid::{Aio, Message, Socket};
//! use braid::sp::{proto_id, ProtocolInfo};
//!
//! # fn main() -> braid::Result<()> {
//! let info = ProtocolInfo::new(proto_id::PAIR, "pair", proto_id::PAIR, "pair");
//! let server = Socket::new(info);
//! let _listener = server.listen("tcp://127.0.0.1:7711")?;
//!
//! let client = Socket::new(info);
//! let _dialer = client.dial_sync("tcp://127.0.0.1:7711")?;
//!
//! // collect the negotiated pipe and greet the peer
//! let aio = Aio::new(|_| {});
//! server.accept_pipe(&aio);
//! aio.wait();
//! aio.result()?;
//! let pipe = aio.take_output::<braid::Pipe>(0).expect("pipe");
//!
//! aio.reset();
//! aio.set_msg(Message::from_body(b"hello"));
//! pipe.send(&aio);
//! aio.wait();
//! aio.result()?;
//! # Ok(())
//! # }
//! ```

pub mod aio;
pub mod endpoint;
mod error;
mod msg;
pub mod pipe;
mod platform;
mod reap;
pub mod socket;
pub mod sp;
pub mod stream;
pub mod tls;
mod url;
pub mod ws;

pub use crate::aio::Aio;
pub use crate::endpoint::{Dialer, Listener};
pub use crate::error::{Error, Result};
pub use crate::msg::Message;
pub use crate::pipe::{Pipe, PipeEvent, PipeStats};
pub use crate::socket::Socket;
pub use crate::url::Url;
