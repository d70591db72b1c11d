//! Byte-stream links to the remote interpreter.
//!
//! A [`Link`] is the raw duplex channel underneath a
//! [`Session`](crate::session::Session). It knows nothing about prompts or
//! patterns: it moves bytes and reports when the far end has gone away.
//!
//! - [`ProcessLink`]: a transport process (e.g. a BLE console bridge)
//!   running in a pseudo-terminal
//! - [`SimulatedWatch`]: an in-memory interpreter that follows the same
//!   prompt protocol, used by tests and `--simulate`

mod process;
mod sim;

use std::io;
use std::time::Duration;

pub use process::ProcessLink;
pub use sim::{SimLink, SimulatedWatch};

/// Result of a single receive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    /// Some bytes arrived.
    Data(Vec<u8>),
    /// Nothing arrived within the wait.
    Idle,
    /// The far end closed the stream; no more data will arrive.
    Closed,
}

/// A duplex byte stream to the interpreter.
pub trait Link: Send {
    /// Write all of `data` to the stream.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Wait up to `wait` for incoming bytes.
    fn recv(&mut self, wait: Duration) -> io::Result<Recv>;
}
