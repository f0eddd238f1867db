//! Record polymorphism (§9 redesign note): rather than the original's
//! inheritance hierarchy (`Client` base class, specialized into `Fifo` and
//! `Listener`), every fd the engine owns is one variant of the `Record`
//! tagged union below. `Engine::dispatch` becomes a single match instead of
//! a virtual call.

use std::fs::File;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use nix::poll::PollFlags;

use crate::endpoint::Endpoint;

use super::state::State;

/// Readable + hangup + error + invalid — the interest mask used whenever a
/// record just wants to be told about activity or teardown on its fd.
pub const PASSIVE_WATCH: PollFlags = PollFlags::from_bits_truncate(
    PollFlags::POLLHUP.bits() | PollFlags::POLLERR.bits() | PollFlags::POLLNVAL.bits(),
);

pub struct IngestRecord {
    pub file: File,
    /// Bytes read but not yet terminated by a newline, carried across reads
    /// (§4.3 partial-line handling).
    pub pending: String,
}

pub struct ListenerRecord {
    pub listener: TcpListener,
}

pub struct OutboundRecord {
    pub stream: TcpStream,
    pub endpoint: Endpoint,
    pub state: State,
    pub http_code: u16,
    pub token: Option<String>,
    pub interest: PollFlags,
    pub deadline: Instant,
    /// Bytes read so far while waiting for the CONNECT response's first
    /// CRLF-delimited line (§4.5). Bounded at 128 bytes per spec.md §4.3's
    /// sibling rule for the ingest line buffer.
    pub buf: Vec<u8>,
}

pub struct InboundRecord {
    pub stream: TcpStream,
    pub peer: SocketAddrV4,
    pub state: State,
    pub interest: PollFlags,
    /// Bytes read so far while waiting for the 64-byte nonce (§4.6).
    pub buf: Vec<u8>,
}

pub enum Record {
    Ingest(IngestRecord),
    Listener(ListenerRecord),
    Outbound(OutboundRecord),
    Inbound(InboundRecord),
}

impl Record {
    pub fn fd(&self) -> RawFd {
        match self {
            Record::Ingest(r) => r.file.as_raw_fd(),
            Record::Listener(r) => r.listener.as_raw_fd(),
            Record::Outbound(r) => r.stream.as_raw_fd(),
            Record::Inbound(r) => r.stream.as_raw_fd(),
        }
    }

    pub fn interest(&self) -> PollFlags {
        match self {
            Record::Ingest(_) => PollFlags::POLLIN | PASSIVE_WATCH,
            Record::Listener(_) => PollFlags::POLLIN | PASSIVE_WATCH,
            Record::Outbound(r) => r.interest,
            Record::Inbound(r) => r.interest,
        }
    }

    /// The source IP this record is indexed under in `by_ip`, if any. Only
    /// outbound candidate records are IP-indexed (§3: "`by_ip`: source
    /// IP → fd for outbound client records only").
    pub fn endpoint_ip(&self) -> Option<Ipv4Addr> {
        match self {
            Record::Outbound(r) => Some(r.endpoint.ip),
            _ => None,
        }
    }

    /// The token this record minted, if any. Only outbound records mint
    /// tokens.
    pub fn token(&self) -> Option<&str> {
        match self {
            Record::Outbound(r) => r.token.as_deref(),
            _ => None,
        }
    }

    pub fn as_outbound(&self) -> Option<&OutboundRecord> {
        match self {
            Record::Outbound(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_outbound_mut(&mut self) -> Option<&mut OutboundRecord> {
        match self {
            Record::Outbound(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_inbound(&self) -> Option<&InboundRecord> {
        match self {
            Record::Inbound(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_inbound_mut(&mut self) -> Option<&mut InboundRecord> {
        match self {
            Record::Inbound(r) => Some(r),
            _ => None,
        }
    }

    /// A one-line description for logging, mirroring the original's
    /// `Client.__str__` (fd, mask, state, remote).
    pub fn describe(&self) -> String {
        match self {
            Record::Ingest(_) => "ingest".to_string(),
            Record::Listener(_) => "listener".to_string(),
            Record::Outbound(r) => format!("{} [{} {}]", r.endpoint, r.http_code, r.state),
            Record::Inbound(r) => format!("{} [{}]", r.peer, r.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(http_code: u16, state: State) -> Record {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        Record::Outbound(OutboundRecord {
            stream,
            endpoint: Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 80),
            state,
            http_code,
            token: None,
            interest: PollFlags::POLLOUT | PASSIVE_WATCH,
            deadline: Instant::now(),
            buf: Vec::new(),
        })
    }

    /// §8 scenario S2 expects the status code ("RECV_CODE with
    /// `http_code=403`") to be an observable fact, not write-only state.
    #[test]
    fn describe_surfaces_the_stored_http_code() {
        let record = outbound(403, State::RecvCode);
        assert_eq!(record.describe(), "1.2.3.4:80 [403 RECV_CODE]");
    }

    #[test]
    fn as_outbound_and_as_inbound_discriminate_variants() {
        let record = outbound(200, State::SentToken);
        assert!(record.as_outbound().is_some());
        assert!(record.as_inbound().is_none());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let peer = match stream.peer_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };
        let inbound = Record::Inbound(InboundRecord {
            stream,
            peer,
            state: State::DiffBack,
            interest: PollFlags::POLLIN | PASSIVE_WATCH,
            buf: Vec::new(),
        });
        assert!(inbound.as_outbound().is_none());
        assert!(inbound.as_inbound().is_some());
    }
}
