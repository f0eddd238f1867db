//! C4 — the callback listener: accepts inbound connect-backs and routes
//! each one to either a new `DIFF_BACK` inbound record or an existing
//! candidate's `SAME_BACK` transition (§4.4).

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

use nix::sys::socket::{bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn};

use crate::error::EngineFault;

use super::record::{InboundRecord, ListenerRecord, PASSIVE_WATCH};
use super::registry::Registry;
use super::state::State;

use nix::poll::PollFlags;

/// Binds `(bind_ip, bind_port)` with `SO_REUSEADDR` and a listen backlog of
/// `backlog` (§4.4: "backlog `MAX_CONCURRENT`").
pub fn bind_listener(bind_ip: Ipv4Addr, bind_port: u16, backlog: usize) -> anyhow::Result<ListenerRecord> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(|e| anyhow::anyhow!("creating listener socket: {e}"))?;

    setsockopt(&fd, sockopt::ReuseAddr, &true)
        .map_err(|e| anyhow::anyhow!("setting SO_REUSEADDR: {e}"))?;

    let addr = SockaddrIn::from(SocketAddrV4::new(bind_ip, bind_port));
    bind(fd.as_raw_fd(), &addr)
        .map_err(|e| anyhow::anyhow!("binding {bind_ip}:{bind_port}: {e}"))?;

    let backlog =
        Backlog::new(backlog as i32).map_err(|e| anyhow::anyhow!("invalid backlog: {e}"))?;
    listen(&fd, backlog).map_err(|e| anyhow::anyhow!("listen on {bind_ip}:{bind_port}: {e}"))?;

    // SAFETY: `fd` was just created above and is handed off to
    // `TcpListener` as its sole owner.
    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    Ok(ListenerRecord { listener })
}

/// Outcome of a single accept, for the event loop to log (§8 scenarios
/// S3/S4 reference these exact log lines).
pub enum AcceptOutcome {
    /// A cross-IP connect-back; a new `InboundRecord` was registered.
    DiffBack,
    /// A same-IP connect-back; the matching outbound record advanced to
    /// `SAME_BACK` and both sockets were half-closed.
    SameBack { endpoint_desc: String },
}

/// Drains every pending connection on `listener`, routing each per §4.4.
/// Returns one `AcceptOutcome` per accepted connection, in order.
pub fn drain_accepts(
    listener: &TcpListener,
    registry: &mut Registry,
) -> Result<Vec<AcceptOutcome>, EngineFault> {
    let mut outcomes = Vec::new();
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                let peer_v4 = match peer {
                    std::net::SocketAddr::V4(v4) => v4,
                    std::net::SocketAddr::V6(_) => {
                        // The listener only binds an IPv4 address; an IPv6
                        // peer can't happen in practice, but treat it like
                        // any other unmatched source IP rather than panic.
                        continue;
                    }
                };

                if let Some(outbound_fd) = registry.fd_by_ip(peer_v4.ip()) {
                    if let Some(super::record::Record::Outbound(o)) = registry.get_mut(outbound_fd)
                    {
                        o.state = State::SameBack;
                        let _ = o.stream.shutdown(std::net::Shutdown::Write);
                        let desc = o.endpoint.to_string();
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        drop(stream);
                        outcomes.push(AcceptOutcome::SameBack { endpoint_desc: desc });
                    }
                } else {
                    registry.register(super::record::Record::Inbound(InboundRecord {
                        stream,
                        peer: peer_v4,
                        state: State::DiffBack,
                        interest: PollFlags::POLLIN | PASSIVE_WATCH,
                        buf: Vec::new(),
                    }));
                    outcomes.push(AcceptOutcome::DiffBack);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(EngineFault::from(e)),
        }
    }
    Ok(outcomes)
}
