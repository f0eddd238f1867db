//! The §7 error taxonomy given a concrete shape.
//!
//! `anyhow` carries configuration-fatal and loop-fatal errors all the way
//! out to `main` (see `shadow::core::main::run_shadow` for the pattern this
//! mirrors). Per-candidate faults are the two variants below: they never
//! escape the event loop's dispatch step, they only cause that one
//! candidate's record to be unregistered.

use std::fmt;

/// A fault local to a single candidate or inbound connection.
///
/// Both variants are handled identically by the event loop (unregister the
/// record and move on) — the distinction exists so log lines can say
/// whether the candidate merely dropped the connection or actively violated
/// the protocol.
#[derive(Debug)]
pub enum EngineFault {
    /// Socket hangup, error, invalid fd, or refused connect.
    Io(std::io::Error),
    /// A protocol violation: non-200 status, malformed header, wrong-length
    /// or unrecognized nonce.
    Discord(String),
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineFault::Io(e) => write!(f, "{e}"),
            EngineFault::Discord(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for EngineFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineFault::Io(e) => Some(e),
            EngineFault::Discord(_) => None,
        }
    }
}

impl From<std::io::Error> for EngineFault {
    fn from(e: std::io::Error) -> Self {
        EngineFault::Io(e)
    }
}

impl From<nix::Error> for EngineFault {
    fn from(e: nix::Error) -> Self {
        EngineFault::Io(e.into())
    }
}

impl EngineFault {
    pub fn discord(msg: impl Into<String>) -> Self {
        EngineFault::Discord(msg.into())
    }

    pub fn is_discord(&self) -> bool {
        matches!(self, EngineFault::Discord(_))
    }
}
