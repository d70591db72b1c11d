//! Remote control of a watch's Python prompt over a byte-stream transport.
//!
//! - [`link`]: raw byte streams (a bridge process, or a simulated device)
//! - [`session::Session`]: expect-style matching on top of a link
//! - [`repl::sync::Synchronizer`]: interrupt the device and prove we own the prompt
//! - [`repl::paste`]: line-by-line paste mode, split at top-level classes
//! - [`repl::ReplClient`]: evaluate, execute, upload, reset and clock operations

pub mod error;
pub mod link;
pub mod protocol;
pub mod repl;
pub mod session;

pub use error::ReplError;
pub use repl::{OpResponse, ReplClient, ReplConfig};
