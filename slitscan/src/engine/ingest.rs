//! C3 — the ingest endpoint: a named pipe read non-blocking, line by line.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::endpoint::Endpoint;

use super::record::IngestRecord;

static LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d{1,5}$").unwrap());

/// Creates the harvest directory and FIFO if either is missing, and opens
/// the FIFO read-only, non-blocking. Configuration-fatal (§7) if the path
/// exists and is not a FIFO.
pub fn create(path: &Path) -> anyhow::Result<IngestRecord> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow::anyhow!("creating harvest directory {dir:?}: {e}"))?;
        }
    }

    if !path.exists() {
        nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o600))
            .map_err(|e| anyhow::anyhow!("creating FIFO {path:?}: {e}"))?;
    }

    let meta = std::fs::metadata(path)
        .map_err(|e| anyhow::anyhow!("statting ingest path {path:?}: {e}"))?;
    if !meta.file_type().is_fifo() {
        anyhow::bail!("{path:?} exists and is not a FIFO");
    }

    let file = open_nonblocking(path)?;
    Ok(IngestRecord {
        file,
        pending: String::new(),
    })
}

fn open_nonblocking(path: &Path) -> anyhow::Result<File> {
    let raw_fd = fcntl::open(path, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())
        .map_err(|e| anyhow::anyhow!("opening FIFO {path:?}: {e}"))?;
    // SAFETY: `raw_fd` was just opened above and isn't owned elsewhere.
    Ok(unsafe { File::from_raw_fd(raw_fd) })
}

impl IngestRecord {
    /// Reopens the FIFO onto the *same* fd number so the reactor's
    /// registration stays stable across writer churn (§4.3 hangup
    /// handling). Any buffered partial line is discarded along with the
    /// stale pipe.
    pub fn reopen(&mut self, path: &Path) -> anyhow::Result<()> {
        let existing_fd = self.file.as_raw_fd();
        let new_fd = fcntl::open(path, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())
            .map_err(|e| anyhow::anyhow!("reopening FIFO {path:?}: {e}"))?;
        nix::unistd::dup2(new_fd, existing_fd)
            .map_err(|e| anyhow::anyhow!("dup2 onto ingest fd: {e}"))?;
        nix::unistd::close(new_fd).ok();
        self.pending.clear();
        Ok(())
    }

    /// Drains every currently-available line (§4.3), buffering a trailing
    /// fragment without a terminating newline across calls.
    pub fn drain_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut buf = [0u8; 8192];
        loop {
            match self.file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.pending.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            lines.push(self.pending[..pos].to_string());
            self.pending.drain(..=pos);
        }
        Ok(lines)
    }
}

/// Validates a raw ingest line against `^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d{1,5}$`
/// and parses it into an `Endpoint`. Malformed lines (bad shape, a port out
/// of `1..=65535`, octets over 255) are dropped silently by returning
/// `None` — never logged, per §4.3/§8.
pub fn parse_line(line: &str) -> Option<Endpoint> {
    if !LINE_RE.is_match(line) {
        return None;
    }
    line.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn accepts_well_formed_line() {
        let ep = parse_line("1.2.3.4:8080").unwrap();
        assert_eq!(ep, Endpoint::new(Ipv4Addr::new(1, 2, 3, 4), 8080));
    }

    #[test]
    fn rejects_empty_line() {
        assert!(parse_line("").is_none());
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(parse_line("1.2.3.4").is_none());
    }

    #[test]
    fn rejects_port_zero() {
        assert!(parse_line("1.2.3.4:0").is_none());
    }

    #[test]
    fn rejects_port_over_65535() {
        assert!(parse_line("1.2.3.4:100000").is_none());
    }

    #[test]
    fn rejects_octet_over_255() {
        assert!(parse_line("999.2.3.4:80").is_none());
    }

    #[test]
    fn rejects_non_ascii() {
        assert!(parse_line("1.2.3.4:80é").is_none());
    }

    #[test]
    fn creates_fifo_and_directory_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("harvest.fifo");
        let record = create(&path).unwrap();
        assert!(path.exists());
        drop(record);
    }

    #[test]
    fn rejects_path_that_exists_and_is_not_a_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_fifo");
        std::fs::write(&path, b"hello").unwrap();
        assert!(create(&path).is_err());
    }

    #[test]
    fn buffers_partial_line_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.fifo");
        let mut record = create(&path).unwrap();

        // Open a writer and send a line split across two writes.
        let writer_fd =
            fcntl::open(&path, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()).unwrap();
        let mut writer = unsafe { File::from_raw_fd(writer_fd) };
        use std::io::Write;
        write!(writer, "1.2.3.4:80").unwrap();

        let lines = record.drain_lines().unwrap();
        assert!(lines.is_empty());
        assert_eq!(record.pending, "1.2.3.4:80");

        writeln!(writer).unwrap();
        let lines = record.drain_lines().unwrap();
        assert_eq!(lines, vec!["1.2.3.4:80".to_string()]);
        assert!(record.pending.is_empty());
    }
}
