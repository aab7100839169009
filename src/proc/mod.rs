//! Host-transparent process execution.
//!
//! A [`Connection`] runs commands either on the controller or on a remote SUT through the
//! `ssh` client, and hands out a [`CommandHandle`] per spawned process. Every handle drains
//! stdout and stderr in background tasks into one queue, so callers can wait with a
//! timeout, poll with a zero timeout and keep collecting output across calls without the
//! process ever stalling on a full pipe.
//!
//! Remote commands are wrapped so that the remote shell first prints its PID and then
//! exec's the real command; the PID is therefore the one of the command itself and can be
//! signalled later through the [`crate::supervisor`].
mod connection;
mod error;
mod handle;
mod quote;
mod remote;

pub use connection::{Connection, DEFAULT_TIMEOUT, RunOptions};
pub use error::{Error, Result};
pub(crate) use error::format_output;
pub use handle::{CmdOutput, CommandHandle, DEFAULT_WAIT_TIMEOUT, StreamId};
pub use quote::{quote, quote_path};
pub use remote::RemoteTarget;
