//! C6 — correlation and tunnel proof: the token-based pairing that turns a
//! connect-back into a "discovered" result (§4.6).
//!
//! IP-based correlation (SAME_BACK vs DIFF_BACK routing) lives in
//! `engine::listener` because it only ever runs at accept time. This module
//! is the authoritative path: it owns the decision of whether a byte string
//! arriving on an inbound socket is *the* nonce a live outbound candidate
//! minted.

use super::record::Record;
use super::registry::Registry;
use super::state::State;
use crate::error::EngineFault;

const NONCE_LEN: usize = 64;

/// The result of inspecting an inbound record's accumulated read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum NonceRead {
    /// Fewer than 64 bytes seen so far; keep buffering.
    Incomplete,
    /// Exactly 64 bytes, syntactically a candidate nonce.
    Candidate(String),
    /// More than 64 bytes arrived with no delimiter — too long to be the
    /// nonce (§8 boundary: length other than 64 is discord).
    TooLong,
}

/// Classifies an inbound socket's accumulated buffer per §4.5/§4.6/§8.
///
/// Pure and side-effect free so the length boundaries (63, 64, 65 bytes)
/// can be exercised directly in unit tests without any real sockets.
pub fn inspect_buffer(buf: &[u8]) -> NonceRead {
    match buf.len().cmp(&NONCE_LEN) {
        std::cmp::Ordering::Less => NonceRead::Incomplete,
        std::cmp::Ordering::Equal => match std::str::from_utf8(buf) {
            Ok(s) if s.bytes().all(|b| b.is_ascii_graphic() || b == b' ') => {
                NonceRead::Candidate(s.to_string())
            }
            _ => NonceRead::TooLong,
        },
        std::cmp::Ordering::Greater => NonceRead::TooLong,
    }
}

/// Looks `candidate` up in `by_token`. On a match, marks both the inbound
/// record (`inbound_fd`) and the outbound record it pairs with as
/// `DISCOVERED`, half-closes both sockets, and returns the outbound
/// endpoint's fd plus the two descriptions used for logging (§4.6: "logs
/// the pair... and half-closes both sockets").
pub fn try_pair(
    registry: &mut Registry,
    inbound_fd: i32,
    candidate: &str,
) -> Result<(i32, String, String), EngineFault> {
    let outbound_fd = registry
        .fd_by_token(candidate)
        .ok_or_else(|| EngineFault::discord("nonce not recognized"))?;

    let outbound_desc = match registry.get(outbound_fd) {
        Some(Record::Outbound(r)) => r.endpoint.to_string(),
        _ => return Err(EngineFault::discord("token pointed at a non-outbound record")),
    };

    let inbound_desc = match registry.get(inbound_fd) {
        Some(Record::Inbound(r)) => r.peer.to_string(),
        _ => return Err(EngineFault::discord("inbound record vanished mid-pairing")),
    };

    if let Some(Record::Outbound(r)) = registry.get_mut(outbound_fd) {
        r.state = State::Discovered;
        let _ = r.stream.shutdown(std::net::Shutdown::Write);
    }
    if let Some(Record::Inbound(r)) = registry.get_mut(inbound_fd) {
        r.state = State::Discovered;
        let _ = r.stream.shutdown(std::net::Shutdown::Write);
    }

    Ok((outbound_fd, outbound_desc, inbound_desc))
}
