//! scanguard: authorization and safety control plane for scan platforms.
//!
//! Decides whether a scan may start, keeps a platform-wide emergency stop,
//! revalidates sessions against an external authority, and signs every
//! decision into a tamper-evident audit chain. All authoritative state lives
//! in one shared SQLite database so stateless replicas agree.
//!
//! See `DESIGN.md` for the component map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;

pub mod audit;
pub mod authz;
pub mod emergency;
pub mod pulse;

pub mod gate;
pub mod service;

pub use error::{ControlError, ErrorKind};
