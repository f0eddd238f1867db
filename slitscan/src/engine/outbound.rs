//! C5 — the outbound client: non-blocking connector plus the CONNECT/nonce
//! protocol driver for a single candidate (§4.5).

use std::net::{SocketAddrV4, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::time::{Duration, Instant};

use nix::sys::socket::{connect, getsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn};

use crate::endpoint::Endpoint;
use crate::error::EngineFault;

use super::nonce;
use super::record::{OutboundRecord, PASSIVE_WATCH};
use super::registry::Registry;
use super::state::State;

use nix::poll::PollFlags;

const MAX_RESPONSE_LINE: usize = 128;

/// Opens a non-blocking socket and kicks off a connect to `endpoint`
/// (§4.5: "creates a non-blocking TCP socket, initiates a connect... sets
/// readiness = writable + readable + error + hangup + invalid").
///
/// A synchronous connect failure (e.g. no route, immediate ECONNREFUSED) is
/// surfaced as an `EngineFault::Io` so the caller can log it and move on —
/// admission errors are "logged and swallowed", per §4.7.
pub fn dial(endpoint: Endpoint, timeout: Duration) -> Result<OutboundRecord, EngineFault> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(EngineFault::from)?;

    let addr = SockaddrIn::from(SocketAddrV4::new(endpoint.ip, endpoint.port));
    match connect(fd.as_raw_fd(), &addr) {
        Ok(()) | Err(nix::Error::EINPROGRESS) | Err(nix::Error::EWOULDBLOCK) => {}
        Err(e) => return Err(EngineFault::from(e)),
    }

    // SAFETY: `fd` was just created above and is handed off to `TcpStream`
    // as its sole owner.
    let stream = unsafe { TcpStream::from_raw_fd(fd.into_raw_fd()) };

    Ok(OutboundRecord {
        stream,
        endpoint,
        state: State::Initiated,
        http_code: 0,
        token: None,
        interest: PollFlags::POLLOUT | PASSIVE_WATCH,
        deadline: Instant::now() + timeout,
        buf: Vec::new(),
    })
}

/// `INITIATED --writable--> ESTABLISHED --(send CONNECT)--> SENT_CONNECT`.
///
/// The connect(2) completion status is only knowable via `SO_ERROR`
/// (POLLOUT alone doesn't distinguish success from a deferred failure).
pub fn on_writable(record: &mut OutboundRecord, callback: SocketAddrV4) -> Result<(), EngineFault> {
    let err = getsockopt(&record.stream, sockopt::SocketError).map_err(EngineFault::from)?;
    if err != 0 {
        return Err(EngineFault::Io(std::io::Error::from_raw_os_error(err)));
    }

    record.state = State::Established;

    let request = format!(
        "CONNECT {}:{} HTTP/1.0\r\n\r\n",
        callback.ip(),
        callback.port()
    );
    use std::io::Write;
    record.stream.write_all(request.as_bytes())?;

    record.state = State::SentConnect;
    record.interest = PollFlags::POLLIN | PASSIVE_WATCH;
    Ok(())
}

/// Outcome of a readable event on a `SENT_CONNECT` outbound socket.
pub enum ConnectResponse {
    /// Not enough data yet for a full status line.
    Pending,
    /// A well-formed `200` response; the record has minted and sent its
    /// nonce and moved to `SENT_TOKEN`.
    Accepted,
}

/// `SENT_CONNECT --readable--> RECV_CODE --(mint + send token)--> SENT_TOKEN`.
///
/// Reads up to 128 bytes (accumulated across calls in `record.buf`),
/// extracts the first CRLF-delimited line, and parses `PROTO CODE REASON`
/// per §4.5/§6. A non-200 status or malformed line is a discord fault.
pub fn on_readable(
    record: &mut OutboundRecord,
    registry_collides: impl FnMut(&str) -> bool,
) -> Result<ConnectResponse, EngineFault> {
    let mut chunk = [0u8; MAX_RESPONSE_LINE];
    loop {
        use std::io::Read;
        match record.stream.read(&mut chunk) {
            Ok(0) => return Err(EngineFault::discord("peer closed before sending a status line")),
            Ok(n) => {
                record.buf.extend_from_slice(&chunk[..n]);
                if record.buf.len() > MAX_RESPONSE_LINE {
                    return Err(EngineFault::discord("CONNECT response line too long"));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(EngineFault::from(e)),
        }
    }

    let Some(line_end) = find_crlf(&record.buf) else {
        return Ok(ConnectResponse::Pending);
    };

    let line = String::from_utf8_lossy(&record.buf[..line_end]).into_owned();
    let mut parts = line.splitn(3, ' ');
    let (Some(proto), Some(code), Some(_reason)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(EngineFault::discord(format!(
            "malformed CONNECT response: {line:?}"
        )));
    };

    if proto != "HTTP/1.0" && proto != "HTTP/1.1" {
        return Err(EngineFault::discord(format!("unexpected protocol: {proto}")));
    }
    let code: u16 = code
        .parse()
        .map_err(|_| EngineFault::discord(format!("non-numeric status code: {code}")))?;
    record.http_code = code;
    record.state = State::RecvCode;

    if code != 200 {
        return Err(EngineFault::discord(format!(
            "CONNECT refused with status {code}"
        )));
    }

    let token = nonce::mint(registry_collides);
    use std::io::Write;
    record.stream.write_all(token.as_bytes())?;
    record.token = Some(token);
    record.state = State::SentToken;
    record.interest = PASSIVE_WATCH;
    record.buf.clear();

    Ok(ConnectResponse::Accepted)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Convenience wrapper used by the event loop: mints the token via
/// `nonce::mint`, checking collisions against the registry's `by_token`
/// index, then indexes it there too.
pub fn finish_token_exchange(
    registry: &mut Registry,
    fd: i32,
    record: &mut OutboundRecord,
) -> Result<(), EngineFault> {
    match on_readable(record, |candidate| registry.fd_by_token(candidate).is_some()) {
        Ok(ConnectResponse::Accepted) => {
            if let Some(token) = record.token.clone() {
                registry.index_token(fd, token);
            }
            Ok(())
        }
        Ok(ConnectResponse::Pending) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{Ipv4Addr, TcpListener};

    #[test]
    fn find_crlf_locates_delimiter() {
        assert_eq!(find_crlf(b"HTTP/1.0 200 OK\r\n\r\n"), Some(15));
    }

    #[test]
    fn find_crlf_none_without_delimiter() {
        assert_eq!(find_crlf(b"HTTP/1.0 200 OK"), None);
    }

    fn record_pair() -> (OutboundRecord, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let record = OutboundRecord {
            stream: client,
            endpoint: Endpoint::new(Ipv4Addr::LOCALHOST, 1),
            state: State::SentConnect,
            http_code: 0,
            token: None,
            interest: PollFlags::POLLIN | PASSIVE_WATCH,
            deadline: Instant::now() + Duration::from_secs(5),
            buf: Vec::new(),
        };
        (record, server)
    }

    /// §3/§4.5: a candidate must actually visit `RECV_CODE` with its status
    /// code stored, even on a non-200 (discord) response.
    #[test]
    fn non_200_response_visits_recv_code_with_status_stored() {
        let (mut record, mut server) = record_pair();
        server.write_all(b"HTTP/1.0 403 Forbidden\r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let err = on_readable(&mut record, |_| false).unwrap_err();
        assert!(err.is_discord());
        assert_eq!(record.state, State::RecvCode);
        assert_eq!(record.http_code, 403);
    }

    #[test]
    fn accepted_response_visits_recv_code_before_sent_token() {
        let (mut record, mut server) = record_pair();
        server.write_all(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        on_readable(&mut record, |_| false).unwrap();
        assert_eq!(record.http_code, 200);
        assert_eq!(record.state, State::SentToken);
    }
}
