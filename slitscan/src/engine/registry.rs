//! C1 — the registry: the authoritative `by_fd` map plus the two
//! non-owning secondary indexes `by_ip` and `by_token` (§3, §4.1).
//!
//! Unlike the teacher's `DescriptorTable` (which hands out its own index
//! namespace and talks to a C-backed multiplexer via FFI), this registry's
//! keys are real OS file descriptors and there is no separate multiplexer
//! object to notify: the reactor (§4.7) rebuilds its `pollfd` list from
//! `by_fd` every iteration, so "registering interest" is just storing the
//! record here.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use crate::endpoint::Endpoint;

use super::record::Record;

#[derive(Default)]
pub struct Registry {
    by_fd: HashMap<RawFd, Record>,
    by_ip: HashMap<Ipv4Addr, RawFd>,
    by_token: HashMap<String, RawFd>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record` into `by_fd`, and into `by_ip`/`by_token` if those
    /// keys are populated on the record. A duplicate IP silently overwrites
    /// the older `by_ip` entry (§4.1 — intentional; see DESIGN.md for the
    /// resolved Open Question on same-IP candidates).
    pub fn register(&mut self, record: Record) {
        let fd = record.fd();
        if let Some(ip) = record.endpoint_ip() {
            self.by_ip.insert(ip, fd);
        }
        if let Some(token) = record.token() {
            self.by_token.insert(token.to_string(), fd);
        }
        self.by_fd.insert(fd, record);
    }

    /// Registers a token minted after the owning record was already
    /// registered (the common case: a candidate mints its nonce only once
    /// it reaches `SENT_TOKEN`, well after `register` was first called).
    pub fn index_token(&mut self, fd: RawFd, token: String) {
        self.by_token.insert(token, fd);
    }

    /// Removes `fd` from every index it appears in. A no-op on the
    /// secondary indexes if they don't currently point at `fd` (e.g. a
    /// stale `by_ip` entry from an older same-IP candidate that has since
    /// been overwritten by a newer one — removing the newer one must not
    /// clobber the mapping it owns).
    pub fn unregister(&mut self, fd: RawFd) -> Option<Record> {
        let record = self.by_fd.remove(&fd)?;

        if let Some(ip) = record.endpoint_ip() {
            if self.by_ip.get(&ip) == Some(&fd) {
                self.by_ip.remove(&ip);
            }
        }
        if let Some(token) = record.token() {
            if self.by_token.get(token) == Some(&fd) {
                self.by_token.remove(token);
            }
        }

        Some(record)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Record> {
        self.by_fd.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Record> {
        self.by_fd.get_mut(&fd)
    }

    pub fn fd_by_ip(&self, ip: &Ipv4Addr) -> Option<RawFd> {
        self.by_ip.get(ip).copied()
    }

    pub fn fd_by_token(&self, token: &str) -> Option<RawFd> {
        self.by_token.get(token).copied()
    }

    /// True iff some live outbound record already targets `endpoint`
    /// (exact ip+port match, not just ip — mirrors the original's
    /// `registered(remote)`).
    pub fn has_endpoint(&self, endpoint: &Endpoint) -> bool {
        self.by_fd
            .values()
            .any(|r| matches!(r, Record::Outbound(o) if o.endpoint == *endpoint))
    }

    pub fn len(&self) -> usize {
        self.by_fd.len()
    }

    pub fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.by_fd.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RawFd, &Record)> {
        self.by_fd.iter()
    }

    /// `(fds, ips, tokens)` — the tally logged when the engine aborts
    /// (§4.7 fault isolation, §6 exit codes).
    pub fn tally(&self) -> (usize, usize, usize) {
        (self.by_fd.len(), self.by_ip.len(), self.by_token.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::record::{InboundRecord, OutboundRecord, PASSIVE_WATCH};
    use crate::engine::state::State;
    use nix::poll::PollFlags;
    use std::net::{SocketAddrV4, TcpListener, TcpStream};
    use std::time::Instant;

    fn outbound(fd_source: &TcpListener, endpoint: Endpoint) -> Record {
        // Connect a real loopback pair so we have a genuine fd to exercise.
        let stream = TcpStream::connect(fd_source.local_addr().unwrap()).unwrap();
        Record::Outbound(OutboundRecord {
            stream,
            endpoint,
            state: State::Initiated,
            http_code: 0,
            token: None,
            interest: PollFlags::POLLOUT | PASSIVE_WATCH,
            deadline: Instant::now(),
            buf: Vec::new(),
        })
    }

    #[test]
    fn duplicate_ip_overwrites_by_ip_but_keeps_both_in_by_fd() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ep = Endpoint::new("127.0.0.1".parse().unwrap(), 1);

        let mut reg = Registry::new();
        let first = outbound(&listener, ep);
        let first_fd = first.fd();
        reg.register(first);

        let second = outbound(&listener, ep);
        let second_fd = second.fd();
        reg.register(second);

        assert_eq!(reg.len(), 2);
        assert_eq!(reg.fd_by_ip(&ep.ip), Some(second_fd));
        assert_ne!(first_fd, second_fd);
    }

    #[test]
    fn unregister_older_duplicate_does_not_clobber_newer_ip_mapping() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ep = Endpoint::new("127.0.0.1".parse().unwrap(), 1);

        let mut reg = Registry::new();
        let first = outbound(&listener, ep);
        let first_fd = first.fd();
        reg.register(first);

        let second = outbound(&listener, ep);
        let second_fd = second.fd();
        reg.register(second);

        reg.unregister(first_fd);

        assert_eq!(reg.fd_by_ip(&ep.ip), Some(second_fd));
    }

    #[test]
    fn token_index_points_back_to_minting_fd() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ep = Endpoint::new("127.0.0.1".parse().unwrap(), 2);

        let mut reg = Registry::new();
        let record = outbound(&listener, ep);
        let fd = record.fd();
        reg.register(record);
        reg.index_token(fd, "tok-abc".to_string());

        assert_eq!(reg.fd_by_token("tok-abc"), Some(fd));

        reg.unregister(fd);
        assert_eq!(reg.fd_by_token("tok-abc"), None);
    }

    #[test]
    fn has_endpoint_matches_ip_and_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let ep = Endpoint::new("127.0.0.1".parse().unwrap(), 3);
        let other = Endpoint::new("127.0.0.1".parse().unwrap(), 4);

        let mut reg = Registry::new();
        reg.register(outbound(&listener, ep));

        assert!(reg.has_endpoint(&ep));
        assert!(!reg.has_endpoint(&other));
    }

    #[test]
    fn inbound_records_are_not_ip_indexed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let peer: SocketAddrV4 = match stream.peer_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let mut reg = Registry::new();
        reg.register(Record::Inbound(InboundRecord {
            stream,
            peer,
            state: State::DiffBack,
            interest: PASSIVE_WATCH | PollFlags::POLLIN,
            buf: Vec::new(),
        }));

        assert_eq!(reg.fd_by_ip(peer.ip()), None);
        assert_eq!(reg.len(), 1);
    }
}
