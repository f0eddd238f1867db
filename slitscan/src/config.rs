//! Command-line surface, grounded in `shadow`'s `clap::Parser`-derived
//! `CliOptions` (see `core::support::configuration`). This engine has no
//! per-host configuration matrix to express, so unlike the teacher there is
//! no separate YAML config-file layer — every tunable is a CLI flag with a
//! sensible default, resolved once at startup into an `EngineConfig`.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

/// Probe candidate endpoints for open HTTP CONNECT tunneling.
#[derive(Debug, Parser)]
#[command(name = "slitscan", version, about)]
pub struct Cli {
    /// Path to the named pipe that harvesters write `ip:port` lines into.
    #[arg(long, default_value = "harvest/harvest.fifo")]
    pub fifo_path: PathBuf,

    /// Local address the callback listener binds to.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_ip: Ipv4Addr,

    /// Local port the callback listener binds to.
    #[arg(long, default_value_t = 16667)]
    pub bind_port: u16,

    /// Address proxies are told to CONNECT back to. Defaults to `bind-ip`;
    /// override when the bind address isn't publicly routable.
    #[arg(long)]
    pub callback_ip: Option<Ipv4Addr>,

    /// Port proxies are told to CONNECT back to. Defaults to `bind-port`.
    #[arg(long)]
    pub callback_port: Option<u16>,

    /// Maximum number of in-flight candidates.
    #[arg(long, default_value_t = 32)]
    pub max_concurrent: usize,

    /// Seconds before an unresolved candidate is timed out.
    #[arg(long, default_value_t = 15)]
    pub timeout_secs: u64,

    /// Append-only results log.
    #[arg(long, default_value = "slitscan.log")]
    pub log_file: PathBuf,

    /// Minimum level of log message to emit.
    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

/// Fully resolved engine configuration. Constructing one can fail
/// (configuration-fatal, per §7) if the CLI gave contradictory settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fifo_path: PathBuf,
    pub bind_ip: Ipv4Addr,
    pub bind_port: u16,
    pub callback_ip: Ipv4Addr,
    pub callback_port: u16,
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    pub log_file: PathBuf,
    pub log_level: log::LevelFilter,
}

impl Cli {
    pub fn into_engine_config(self) -> anyhow::Result<EngineConfig> {
        if self.max_concurrent == 0 {
            anyhow::bail!("--max-concurrent must be at least 1");
        }
        let callback_port = self.callback_port.unwrap_or(self.bind_port);
        if callback_port == 0 {
            anyhow::bail!("--callback-port must be nonzero");
        }

        Ok(EngineConfig {
            fifo_path: self.fifo_path,
            bind_ip: self.bind_ip,
            bind_port: self.bind_port,
            callback_ip: self.callback_ip.unwrap_or(self.bind_ip),
            callback_port,
            max_concurrent: self.max_concurrent,
            timeout_secs: self.timeout_secs,
            log_file: self.log_file,
            log_level: self.log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Cli {
        Cli::parse_from(["slitscan"])
    }

    #[test]
    fn defaults_resolve() {
        let cfg = base().into_engine_config().unwrap();
        assert_eq!(cfg.bind_port, 16667);
        assert_eq!(cfg.callback_port, 16667);
        assert_eq!(cfg.callback_ip, Ipv4Addr::UNSPECIFIED);
        assert_eq!(cfg.max_concurrent, 32);
        assert_eq!(cfg.timeout_secs, 15);
    }

    #[test]
    fn callback_defaults_follow_bind() {
        let mut cli = base();
        cli.bind_port = 9000;
        let cfg = cli.into_engine_config().unwrap();
        assert_eq!(cfg.callback_port, 9000);
    }

    #[test]
    fn rejects_zero_max_concurrent() {
        let mut cli = base();
        cli.max_concurrent = 0;
        assert!(cli.into_engine_config().is_err());
    }

    #[test]
    fn rejects_zero_callback_port() {
        let mut cli = base();
        cli.callback_port = Some(0);
        assert!(cli.into_engine_config().is_err());
    }
}
