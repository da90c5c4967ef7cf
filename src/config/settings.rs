//! Configuration settings for the rendezvous engine
//!
//! Defines the policy knobs a caller sets before a negotiation starts, the
//! per-strategy timeout table, and the CLI arguments of the `rendezvous`
//! binary.

use crate::error::{IoResultExt, Result, RendezvousError};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port of the rendezvous proxy
pub const DEFAULT_PROXY_PORT: u16 = 5190;

/// Rendezvous - peer-to-peer connection negotiation and resumable file transfer
#[derive(Parser, Debug, Clone)]
#[command(name = "rendezvous")]
#[command(author = "Rendezvous Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Negotiate direct or proxied peer connections and transfer files")]
#[command(long_about = r#"
Rendezvous negotiates a byte-stream connection between two peers, trying
direct LAN, direct Internet and proxied transports in turn, and runs a
resumable file transfer over whichever one succeeds.

Examples:
  rendezvous proxy --bind 0.0.0.0:5190            # Run a rendezvous proxy
  rendezvous loopback big.iso --dest /tmp/in      # Send a file to yourself
  rendezvous loopback a b --dest out --proxy-policy only
  rendezvous checksum big.iso --length 4M         # Prefix checksum
"#)]
pub struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "PATH", env = "RENDEZVOUS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Proxy usage policy
    #[arg(long, value_enum, value_name = "POLICY")]
    pub proxy_policy: Option<ProxyPolicy>,

    /// Refuse proxy redirects proposed by the peer
    #[arg(long)]
    pub untrusted_proxy: bool,

    /// Rendezvous proxy host
    #[arg(long, value_name = "HOST")]
    pub proxy_host: Option<String>,

    /// Rendezvous proxy port
    #[arg(long, value_name = "PORT")]
    pub proxy_port: Option<u16>,

    /// Default strategy timeout (e.g. 30s, 1m)
    #[arg(long, value_name = "DURATION")]
    pub timeout: Option<String>,

    /// Per-strategy timeout override, repeatable (e.g. direct-lan=2s)
    #[arg(long = "strategy-timeout", value_name = "KIND=DURATION")]
    pub strategy_timeouts: Vec<String>,

    /// Buffer size for streaming (e.g. 64K, 1M)
    #[arg(short = 'b', long, value_name = "SIZE")]
    pub buffer_size: Option<String>,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a rendezvous proxy server
    #[command(name = "proxy")]
    Proxy {
        /// Bind address
        #[arg(short, long, default_value = "0.0.0.0:5190")]
        bind: SocketAddr,
        /// Address announced to clients in relay acknowledgements
        #[arg(long, value_name = "IP")]
        public_ip: Option<std::net::Ipv4Addr>,
    },

    /// Transfer files between two in-process peers over a loopback control channel
    #[command(name = "loopback")]
    Loopback {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Destination directory for the receiving peer
        #[arg(short, long)]
        dest: PathBuf,
        /// Use the proxy at --proxy-host instead of starting an embedded one
        #[arg(long)]
        external_proxy: bool,
    },

    /// Compute the transfer checksum of a file or a prefix of it
    #[command(name = "checksum")]
    Checksum {
        /// File to checksum
        file: PathBuf,
        /// Prefix length (e.g. 4M); whole file when omitted
        #[arg(long, value_name = "SIZE")]
        length: Option<String>,
    },
}

/// Which strategies may use the rendezvous proxy
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyPolicy {
    /// Never use a proxy
    Never,
    /// Use a proxy when direct strategies fail
    #[default]
    Allow,
    /// Only use proxied strategies
    Only,
}

impl ProxyPolicy {
    /// Whether direct (non-proxied) strategies may run
    pub fn allows_direct(&self) -> bool {
        !matches!(self, Self::Only)
    }

    /// Whether proxied strategies may run
    pub fn allows_proxy(&self) -> bool {
        !matches!(self, Self::Never)
    }
}

/// Timeout class of a connection strategy
#[derive(
    ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutKind {
    /// Direct connection to the peer's LAN address
    DirectLan,
    /// Direct connection to the peer's Internet address
    DirectInternet,
    /// Waiting for the peer to connect to our listener
    Passive,
    /// Joining a relay the peer set up on a proxy
    ProxyRelay,
    /// Setting up our own relay on a proxy
    ProxyRedirect,
}

impl TimeoutKind {
    /// Parse a `kind=duration` override
    pub fn parse_override(spec: &str) -> Result<(Self, Duration)> {
        let (kind, duration) = spec
            .split_once('=')
            .ok_or_else(|| RendezvousError::config(format!("Expected KIND=DURATION, got '{}'", spec)))?;
        let kind = <Self as ValueEnum>::from_str(kind.trim(), true)
            .map_err(|e| RendezvousError::config(format!("Unknown strategy '{}': {}", kind, e)))?;
        Ok((kind, parse_duration(duration)?))
    }
}

/// Deadline table for strategy controllers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Deadline applied when no override exists, in milliseconds
    pub default_ms: u64,
    /// Per-strategy overrides, in milliseconds
    #[serde(default)]
    pub overrides_ms: BTreeMap<TimeoutKind, u64>,
}

impl TimeoutSettings {
    /// Create settings with a default deadline and no overrides
    pub fn new(default: Duration) -> Self {
        Self {
            default_ms: default.as_millis() as u64,
            overrides_ms: BTreeMap::new(),
        }
    }

    /// Builder-style override
    pub fn with_override(mut self, kind: TimeoutKind, deadline: Duration) -> Self {
        self.set_override(kind, deadline);
        self
    }

    /// Set the deadline for one strategy class
    pub fn set_override(&mut self, kind: TimeoutKind, deadline: Duration) {
        self.overrides_ms.insert(kind, deadline.as_millis() as u64);
    }

    /// Default deadline
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_ms)
    }

    /// Deadline for a strategy class
    pub fn deadline_for(&self, kind: TimeoutKind) -> Duration {
        Duration::from_millis(self.overrides_ms.get(&kind).copied().unwrap_or(self.default_ms))
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
            .with_override(TimeoutKind::DirectLan, Duration::from_secs(5))
            .with_override(TimeoutKind::DirectInternet, Duration::from_secs(10))
            .with_override(TimeoutKind::Passive, Duration::from_secs(60))
    }
}

/// Runtime configuration of a connection manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Our own party identifier, announced to proxies
    pub screen_name: String,
    /// Proxy usage policy
    pub proxy_policy: ProxyPolicy,
    /// Honour proxy redirects proposed by the peer
    pub proxy_trusted: bool,
    /// Rendezvous proxy host used when we set up a relay
    pub proxy_host: String,
    /// Rendezvous proxy port
    pub proxy_port: u16,
    /// Local address for passive listeners
    pub listen_addr: SocketAddr,
    /// LAN address announced to peers (auto-detected when unset)
    pub advertised_lan_ip: Option<IpAddr>,
    /// Internet address announced to peers (LAN address when unset)
    pub advertised_external_ip: Option<IpAddr>,
    /// Strategy deadlines
    pub timeouts: TimeoutSettings,
    /// Buffer size for streaming and checksumming
    pub buffer_size: usize,
    /// Emit a progress event every this many bytes
    pub progress_interval: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            screen_name: "anonymous".to_string(),
            proxy_policy: ProxyPolicy::Allow,
            proxy_trusted: true,
            proxy_host: "localhost".to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertised_lan_ip: None,
            advertised_external_ip: None,
            timeouts: TimeoutSettings::default(),
            buffer_size: 64 * 1024,
            progress_interval: 256 * 1024,
        }
    }
}

impl RendezvousConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).with_path(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make a negotiation impossible
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(RendezvousError::config("buffer_size must be non-zero"));
        }
        if self.timeouts.default_ms == 0 {
            return Err(RendezvousError::config("default timeout must be non-zero"));
        }
        if self.screen_name.len() > u8::MAX as usize {
            return Err(RendezvousError::config("screen_name is longer than 255 bytes"));
        }
        Ok(())
    }

    /// Apply CLI overrides on top of this configuration
    pub fn apply_cli(mut self, args: &CliArgs) -> Result<Self> {
        if let Some(policy) = args.proxy_policy {
            self.proxy_policy = policy;
        }
        if args.untrusted_proxy {
            self.proxy_trusted = false;
        }
        if let Some(host) = &args.proxy_host {
            self.proxy_host = host.clone();
        }
        if let Some(port) = args.proxy_port {
            self.proxy_port = port;
        }
        if let Some(timeout) = &args.timeout {
            self.timeouts.default_ms = parse_duration(timeout)?.as_millis() as u64;
        }
        for spec in &args.strategy_timeouts {
            let (kind, deadline) = TimeoutKind::parse_override(spec)?;
            self.timeouts.set_override(kind, deadline);
        }
        if let Some(size) = &args.buffer_size {
            self.buffer_size = parse_size(size).map_err(RendezvousError::config)? as usize;
        }
        self.validate()?;
        Ok(self)
    }

    /// Build configuration from CLI arguments and the optional config file
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let base = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.apply_cli(args)
    }
}

/// Parse a human-readable duration ("250ms", "30s", "1m")
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| RendezvousError::config(format!("Invalid duration '{}': {}", value, e)))
}

/// Parse human-readable size string to bytes
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("GB") || size.ends_with('G') {
        (size.trim_end_matches(|c| c == 'G' || c == 'B'), 1024u64 * 1024 * 1024)
    } else if size.ends_with("MB") || size.ends_with('M') {
        (size.trim_end_matches(|c| c == 'M' || c == 'B'), 1024u64 * 1024)
    } else if size.ends_with("KB") || size.ends_with('K') {
        (size.trim_end_matches(|c| c == 'K' || c == 'B'), 1024u64)
    } else if size.ends_with('B') {
        (size.trim_end_matches('B'), 1u64)
    } else {
        (size.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;

    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_deadline_lookup() {
        let settings = TimeoutSettings::new(Duration::from_secs(20))
            .with_override(TimeoutKind::DirectLan, Duration::from_millis(1500));

        assert_eq!(settings.deadline_for(TimeoutKind::DirectLan), Duration::from_millis(1500));
        assert_eq!(settings.deadline_for(TimeoutKind::ProxyRelay), Duration::from_secs(20));
    }

    #[test]
    fn test_parse_override() {
        let (kind, deadline) = TimeoutKind::parse_override("direct-internet=2s").unwrap();
        assert_eq!(kind, TimeoutKind::DirectInternet);
        assert_eq!(deadline, Duration::from_secs(2));

        assert!(TimeoutKind::parse_override("direct-internet").is_err());
        assert!(TimeoutKind::parse_override("carrier-pigeon=2s").is_err());
    }

    #[test]
    fn test_proxy_policy() {
        assert!(ProxyPolicy::Allow.allows_direct() && ProxyPolicy::Allow.allows_proxy());
        assert!(!ProxyPolicy::Only.allows_direct());
        assert!(!ProxyPolicy::Never.allows_proxy());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "screen_name": "alice",
                "proxy_policy": "only",
                "proxy_trusted": false,
                "timeouts": {{ "default_ms": 4000, "overrides_ms": {{ "proxy-relay": 9000 }} }}
            }}"#
        )
        .unwrap();

        let config = RendezvousConfig::from_file(file.path()).unwrap();
        assert_eq!(config.screen_name, "alice");
        assert_eq!(config.proxy_policy, ProxyPolicy::Only);
        assert!(!config.proxy_trusted);
        assert_eq!(config.proxy_port, DEFAULT_PROXY_PORT);
        assert_eq!(config.timeouts.deadline_for(TimeoutKind::ProxyRelay), Duration::from_secs(9));
        assert_eq!(config.timeouts.deadline_for(TimeoutKind::DirectLan), Duration::from_secs(4));
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs::parse_from([
            "rendezvous",
            "--proxy-policy",
            "never",
            "--timeout",
            "3s",
            "--strategy-timeout",
            "passive=500ms",
            "checksum",
            "somefile",
        ]);
        let config = RendezvousConfig::from_cli(&args).unwrap();
        assert_eq!(config.proxy_policy, ProxyPolicy::Never);
        assert_eq!(config.timeouts.default_timeout(), Duration::from_secs(3));
        assert_eq!(config.timeouts.deadline_for(TimeoutKind::Passive), Duration::from_millis(500));
    }
}
