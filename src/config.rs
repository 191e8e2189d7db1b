//! Process configuration: flag / environment variable / default precedence
//! (spec §4.I), realized directly by `clap`'s own resolution order instead of
//! hand-written precedence code.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "demarkusd", about = "Mark Protocol document server")]
pub struct Config {
    /// Content directory; must exist and be a directory.
    #[arg(long, env = "DEMARKUS_ROOT")]
    pub root: PathBuf,

    /// UDP port to bind.
    #[arg(long, env = "DEMARKUS_PORT", default_value_t = 6309)]
    pub port: u16,

    /// TLS certificate path. Leave unset (with `tls_key`) for dev mode.
    #[arg(long = "tls-cert", env = "DEMARKUS_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key path. Leave unset (with `tls_cert`) for dev mode.
    #[arg(long = "tls-key", env = "DEMARKUS_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Capability tokens file (TOML). Empty means no tokens are authorized.
    #[arg(long, env = "DEMARKUS_TOKENS")]
    pub tokens: Option<PathBuf>,

    /// Maximum concurrent streams accepted per connection.
    #[arg(long = "max-streams", env = "DEMARKUS_MAX_STREAMS", default_value_t = 10)]
    pub max_streams: u32,

    /// QUIC idle timeout, in seconds.
    #[arg(long = "idle-timeout", env = "DEMARKUS_IDLE_TIMEOUT", default_value_t = 30)]
    pub idle_timeout_secs: u64,

    /// Per-stream request read timeout, in seconds.
    #[arg(
        long = "request-timeout",
        env = "DEMARKUS_REQUEST_TIMEOUT",
        default_value_t = 10
    )]
    pub request_timeout_secs: u64,

    /// Requests/sec allowed per source host; 0 disables rate limiting.
    #[arg(long = "rate-limit", env = "DEMARKUS_RATE_LIMIT", default_value_t = 0)]
    pub rate_limit: u32,

    /// Burst capacity for the rate limiter's token bucket.
    #[arg(long = "rate-burst", env = "DEMARKUS_RATE_BURST", default_value_t = 0)]
    pub rate_burst: u32,

    /// Maximum stored/served file size, in bytes.
    #[arg(
        long = "max-size",
        env = "DEMARKUS_MAX_SIZE",
        default_value_t = 10 * 1024 * 1024
    )]
    pub max_size: u64,
}

impl Config {
    /// Fails fast if the content directory doesn't exist or isn't a
    /// directory, and if exactly one of the TLS paths is set (spec §4.H,
    /// §4.I).
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.root.is_dir() {
            anyhow::bail!("content root {:?} does not exist or is not a directory", self.root);
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            anyhow::bail!("tls-cert and tls-key must both be set, or both left unset for dev mode");
        }
        Ok(())
    }
}
