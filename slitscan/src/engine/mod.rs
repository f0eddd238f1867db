//! C7 — the event loop, and the glue that ties the other six components
//! together into one `Engine` value (§4.7, §9 "global mutable indexes").
//!
//! Handlers here take `&mut self` rather than reaching into process-global
//! state, per the redesign note in spec.md §9.

pub mod correlation;
pub mod ingest;
pub mod listener;
pub mod nonce;
pub mod outbound;
pub mod queue;
pub mod record;
pub mod registry;
pub mod state;

use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Instant;

use anyhow::Context;
use nix::poll::{poll, PollFd, PollFlags};

use crate::config::EngineConfig;
use crate::error::EngineFault;

use queue::CandidateQueue;
use record::Record;
use registry::Registry;
use state::State;

/// The reactor wakes at least this often even with nothing ready, so
/// candidate deadlines (§4.5) get serviced promptly without a dedicated
/// timer fd.
const POLL_TIMEOUT_MS: i32 = 1000;

pub struct Engine {
    config: EngineConfig,
    registry: Registry,
    queue: CandidateQueue,
    ingest_fd: RawFd,
    listener_fd: RawFd,
    callback: SocketAddrV4,
}

impl Engine {
    /// Sets up the ingest pipe and callback listener and registers both
    /// (§4.3, §4.4). Any failure here is configuration-fatal (§7).
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let ingest_record = ingest::create(&config.fifo_path).context("setting up ingest pipe")?;
        let ingest_fd = ingest_record.file.as_raw_fd();

        let listener_record =
            listener::bind_listener(config.bind_ip, config.bind_port, config.max_concurrent)
                .context("binding callback listener")?;
        let listener_fd = listener_record.listener.as_raw_fd();

        let callback = SocketAddrV4::new(config.callback_ip, config.callback_port);

        let mut registry = Registry::new();
        registry.register(Record::Ingest(ingest_record));
        registry.register(Record::Listener(listener_record));

        log::info!("callback listener bound, advertising {callback}");
        log::info!("reading candidates from {:?}", config.fifo_path);

        Ok(Self {
            config,
            registry,
            queue: CandidateQueue::new(),
            ingest_fd,
            listener_fd,
            callback,
        })
    }

    /// Runs forever (§6: "`0` is not defined"). Returns only on a
    /// loop-fatal condition (§7), with the error already logged and the
    /// tally already printed to stderr.
    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.admit();
            self.scan_timeouts();
            for (fd, revents) in self.poll_once()? {
                self.dispatch(fd, revents)?;
            }
        }
    }

    /// §4.7 step 1: admit oldest-first while under the fd budget, skipping
    /// (not re-enqueuing) endpoints already under test.
    fn admit(&mut self) {
        while self.registry.len() < self.config.max_concurrent + 2 {
            let Some(endpoint) = self.queue.poll_oldest() else {
                break;
            };
            if self.registry.has_endpoint(&endpoint) {
                continue;
            }
            let timeout = std::time::Duration::from_secs(self.config.timeout_secs);
            match outbound::dial(endpoint, timeout) {
                Ok(record) => {
                    log::info!("Attempting connect to {endpoint}");
                    self.registry.register(Record::Outbound(record));
                }
                Err(e) => {
                    log::warn!("{endpoint}: admission failed: {e}");
                }
            }
        }
    }

    /// §4.5 timeout scan: unregisters any non-`DISCOVERED` candidate past
    /// its deadline.
    fn scan_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<RawFd> = self
            .registry
            .iter()
            .filter_map(|(fd, r)| match r {
                Record::Outbound(o) if o.state != State::Discovered && now >= o.deadline => {
                    Some(*fd)
                }
                _ => None,
            })
            .collect();

        for fd in expired {
            if let Some(record) = self.registry.unregister(fd) {
                log::info!("{}: timed out", record.describe());
            }
        }
    }

    /// §4.7 step 2: block on readiness. The timeout is a servicing tick
    /// for `scan_timeouts`, not a protocol requirement.
    fn poll_once(&self) -> anyhow::Result<Vec<(RawFd, PollFlags)>> {
        let fds: Vec<RawFd> = self.registry.fds().collect();
        let borrowed: Vec<BorrowedFd> = fds
            .iter()
            // SAFETY: every fd here is currently owned by a live record in
            // `self.registry`, which outlives this borrow.
            .map(|&fd| unsafe { BorrowedFd::borrow_raw(fd) })
            .collect();
        let mut pollfds: Vec<PollFd> = borrowed
            .iter()
            .zip(fds.iter())
            .map(|(bfd, &fd)| {
                let interest = self
                    .registry
                    .get(fd)
                    .expect("fd was just listed from the same registry")
                    .interest();
                PollFd::new(*bfd, interest)
            })
            .collect();

        let n = poll(&mut pollfds, POLL_TIMEOUT_MS)
            .map_err(|e| anyhow::anyhow!("poll(2) failed: {e}"))?;
        if n <= 0 {
            return Ok(Vec::new());
        }

        Ok(fds
            .iter()
            .zip(pollfds.iter())
            .filter_map(|(&fd, pfd)| pfd.revents().filter(|r| !r.is_empty()).map(|r| (fd, r)))
            .collect())
    }

    /// §4.7 step 3: route by fd identity. §4.7 step 4: an I/O-class fault
    /// on a candidate unregisters only that candidate; a fault on the
    /// listener or ingest fd is loop-fatal.
    fn dispatch(&mut self, fd: RawFd, revents: PollFlags) -> anyhow::Result<()> {
        if fd == self.listener_fd {
            return self
                .dispatch_listener(revents)
                .map_err(|e| self.abort("listener", e));
        }
        if fd == self.ingest_fd {
            return self
                .dispatch_ingest(revents)
                .map_err(|e| self.abort("ingest", e));
        }

        let result = match self.registry.get(fd) {
            Some(Record::Outbound(_)) => self.handle_outbound_event(fd, revents),
            Some(Record::Inbound(_)) => self.handle_inbound_event(fd, revents),
            _ => Ok(()),
        };
        if let Err(fault) = result {
            if let Some(record) = self.registry.unregister(fd) {
                let kind = if fault.is_discord() { "discord" } else { "io" };
                log::warn!("{}: {kind} fault: {fault}", record.describe());
            }
        }
        Ok(())
    }

    fn dispatch_listener(&mut self, revents: PollFlags) -> Result<(), EngineFault> {
        if revents.intersects(record::PASSIVE_WATCH) {
            return Err(EngineFault::discord("listener socket fault"));
        }
        if !revents.contains(PollFlags::POLLIN) {
            return Ok(());
        }

        // The listener record's `TcpListener` can't be borrowed alongside a
        // `&mut Registry` (it lives inside the registry), so it's pulled
        // out for the duration of the accept loop and put back after.
        let Some(Record::Listener(listener_record)) = self.registry.unregister(self.listener_fd)
        else {
            return Err(EngineFault::discord("listener fd missing its own record"));
        };
        let outcomes = listener::drain_accepts(&listener_record.listener, &mut self.registry);
        self.registry.register(Record::Listener(listener_record));

        for outcome in outcomes? {
            match outcome {
                listener::AcceptOutcome::DiffBack => {
                    log::debug!("accepted cross-IP connect-back");
                }
                listener::AcceptOutcome::SameBack { endpoint_desc } => {
                    log::info!("{endpoint_desc}: same-IP connect-back (weak evidence)");
                }
            }
        }
        Ok(())
    }

    fn dispatch_ingest(&mut self, revents: PollFlags) -> Result<(), EngineFault> {
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            return Err(EngineFault::discord("ingest fd fault"));
        }

        if revents.contains(PollFlags::POLLIN) {
            let Some(Record::Ingest(ingest)) = self.registry.get_mut(self.ingest_fd) else {
                return Err(EngineFault::discord("ingest fd missing its own record"));
            };
            let lines = ingest.drain_lines().map_err(EngineFault::from)?;
            for line in lines {
                if let Some(endpoint) = ingest::parse_line(&line) {
                    self.queue.offer(endpoint);
                }
            }
        }

        if revents.contains(PollFlags::POLLHUP) {
            let Some(Record::Ingest(ingest)) = self.registry.get_mut(self.ingest_fd) else {
                return Err(EngineFault::discord("ingest fd missing its own record"));
            };
            ingest
                .reopen(&self.config.fifo_path)
                .map_err(|e| EngineFault::discord(e.to_string()))?;
            log::debug!("ingest pipe reopened after writer hangup");
        }
        Ok(())
    }

    fn handle_outbound_event(&mut self, fd: RawFd, revents: PollFlags) -> Result<(), EngineFault> {
        let Some(state) = self.registry.get(fd).and_then(Record::as_outbound).map(|o| o.state)
        else {
            return Ok(());
        };

        match state {
            State::Initiated if revents.contains(PollFlags::POLLOUT) => {
                let callback = self.callback;
                if let Some(o) = self.registry.get_mut(fd).and_then(Record::as_outbound_mut) {
                    outbound::on_writable(o, callback)?;
                    log::debug!("{}: CONNECT sent", o.endpoint);
                }
            }
            State::SentConnect if revents.contains(PollFlags::POLLIN) => {
                let Some(Record::Outbound(mut record)) = self.registry.unregister(fd) else {
                    return Ok(());
                };
                let result = outbound::finish_token_exchange(&mut self.registry, fd, &mut record);
                let accepted = record.state == State::SentToken;
                let endpoint = record.endpoint;
                self.registry.register(Record::Outbound(record));
                result?;
                if accepted {
                    log::info!("{endpoint}: CONNECT accepted (200), nonce sent");
                }
            }
            _ => {}
        }

        if revents.intersects(record::PASSIVE_WATCH) {
            self.teardown_outbound(fd);
        }
        Ok(())
    }

    fn teardown_outbound(&mut self, fd: RawFd) {
        let Some(o) = self.registry.get(fd).and_then(Record::as_outbound) else {
            return;
        };
        let discovered = o.state == State::Discovered;
        let desc = o.endpoint.to_string();
        self.registry.unregister(fd);
        if discovered {
            log::info!("{desc}: session closed after discovery");
        } else {
            log::info!("{desc}: not a proxy");
        }
    }

    fn handle_inbound_event(&mut self, fd: RawFd, revents: PollFlags) -> Result<(), EngineFault> {
        let Some(state) = self.registry.get(fd).and_then(Record::as_inbound).map(|r| r.state)
        else {
            return Ok(());
        };

        if state == State::DiffBack && revents.contains(PollFlags::POLLIN) {
            self.read_inbound_token(fd)?;
        }

        if revents.intersects(record::PASSIVE_WATCH) {
            self.teardown_inbound(fd);
        }
        Ok(())
    }

    fn read_inbound_token(&mut self, fd: RawFd) -> Result<(), EngineFault> {
        let Some(r) = self.registry.get_mut(fd).and_then(Record::as_inbound_mut) else {
            return Ok(());
        };

        let mut chunk = [0u8; 128];
        loop {
            use std::io::Read;
            match r.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => r.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(EngineFault::from(e)),
            }
        }

        let buf = r.buf.clone();
        match correlation::inspect_buffer(&buf) {
            correlation::NonceRead::Incomplete => Ok(()),
            correlation::NonceRead::TooLong => Err(EngineFault::discord("wrong-length nonce")),
            correlation::NonceRead::Candidate(candidate) => {
                let (_, outbound_desc, inbound_desc) =
                    correlation::try_pair(&mut self.registry, fd, &candidate)?;
                log::info!("{outbound_desc}: discovered tunnel to {inbound_desc}");
                log::info!("{inbound_desc}: discovered tunnel from {outbound_desc}");
                Ok(())
            }
        }
    }

    fn teardown_inbound(&mut self, fd: RawFd) {
        let Some(r) = self.registry.get(fd).and_then(Record::as_inbound) else {
            return;
        };
        let discovered = r.state == State::Discovered;
        let desc = r.peer.to_string();
        self.registry.unregister(fd);
        if discovered {
            log::debug!("{desc}: inbound session closed after discovery");
        } else {
            log::debug!("{desc}: inbound connection closed");
        }
    }

    /// Logs the fd/ip/token tally (§6 exit codes, §4.7 fault isolation)
    /// and wraps `fault` into the `anyhow::Error` that aborts `run()`.
    fn abort(&self, what: &str, fault: EngineFault) -> anyhow::Error {
        let (fds, ips, tokens) = self.registry.tally();
        log::error!("{what} fault: {fault}");
        eprintln!(
            "slitscan aborting: queue={} fds={fds} ips={ips} tokens={tokens}",
            self.queue.len()
        );
        anyhow::anyhow!("{what} fault: {fault}")
    }
}
