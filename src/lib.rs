//! Stream multiplexing over a single ordered byte transport.
//!
//! A [`Session`] wraps one connection (TCP, a Unix socket, an in-memory
//! duplex, ...) and carries any number of independent, bidirectional
//! [`Stream`]s over it. Frames of different streams are interleaved on the
//! wire with an 8-byte header; control frames are written ahead of queued
//! data, and data from streams that have sent less is preferred.
//!
//! Two flow-control disciplines are available through [`Config::version`]:
//! version 1 bounds the receiver's memory with one token bucket per session,
//! version 2 adds a per-stream sliding window so one slow reader cannot
//! stall the others.

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod io;
pub mod session;
pub mod stream;
pub mod stream_id;

mod flow;
mod scheduler;

pub use codec::Codec;
pub use command::Command;
pub use config::{Config, ConfigBuilder};
pub use error::{Result, SmuxError};
pub use frame::{Frame, HEADER_SIZE};
pub use io::StreamIo;
pub use session::Session;
pub use stream::Stream;
pub use stream_id::StreamIdGenerator;
