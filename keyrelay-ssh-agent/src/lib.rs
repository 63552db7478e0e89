//! SSH agent protocol for keyrelay.
//!
//! # Architecture
//!
//! ```text
//! transport ── BoxedStream ──► AgentSession ──► Multiplexer
//!                                 (proto)           │
//!                                         ┌─────────┼──────────┐
//!                                      Keyring  CapiBackend  ForwardedBackend
//!                                                              │
//!                                   ssh_agent_lib::client ─► remote agent
//! ```
//!
//! [`proto`] owns framing and the glue to `ssh-agent-lib`'s message types,
//! [`session`] serves one connection.  The [`keyring`] is the volatile
//! primary backend; [`keyfile`] and [`ppk`] load private keys from disk for
//! it.

pub mod forwarded;
pub mod keyfile;
pub mod keyring;
pub mod ppk;
pub mod proto;
pub mod session;

pub use forwarded::ForwardedBackend;
pub use keyfile::{KeyFileError, load_key_file};
pub use keyring::Keyring;
pub use session::{AgentSession, SessionError};
