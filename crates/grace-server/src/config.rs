//! Server configuration from the command line and environment.
//!
//! # Environment Variables
//!
//! - `GRACE_ADDR`: Listen address. Default: `:6086`
//! - `GRACE_DRAIN_TIMEOUT_SECS`: Drain timeout in seconds, `0` waits forever. Default: `60`
//! - `GRACE_HEADER_READ_TIMEOUT_SECS`: Time allowed for request headers (optional)
//! - `GRACE_MAX_HEADER_BYTES`: Upper bound on request header size (optional)
//! - `GRACE_READ_TIMEOUT_SECS`: Longest a connection read may stall (optional)
//! - `GRACE_WRITE_TIMEOUT_SECS`: Longest a connection write may stall (optional)

use std::time::Duration;

use clap::Parser;
use grace::GraceServer;
use tracing::info;

/// HTTP service that restarts without dropping connections
#[derive(Debug, Clone, Parser)]
#[command(name = "grace-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to listen on; a leading `:` means all interfaces
    #[arg(short, long, env = "GRACE_ADDR", default_value = ":6086")]
    pub addr: String,

    /// Seconds to wait for in-flight connections when stopping, 0 waits forever
    #[arg(long, env = grace::DRAIN_TIMEOUT_ENV, default_value_t = 60)]
    pub drain_timeout_secs: u64,

    /// Seconds allowed for a client to send request headers
    #[arg(long, env = "GRACE_HEADER_READ_TIMEOUT_SECS")]
    pub header_read_timeout_secs: Option<u64>,

    /// Upper bound on request header size in bytes
    #[arg(long, env = "GRACE_MAX_HEADER_BYTES")]
    pub max_header_bytes: Option<usize>,

    /// Seconds a connection read may stay pending, idle keep-alive included
    #[arg(long, env = "GRACE_READ_TIMEOUT_SECS")]
    pub read_timeout_secs: Option<u64>,

    /// Seconds a connection write may stay pending
    #[arg(long, env = "GRACE_WRITE_TIMEOUT_SECS")]
    pub write_timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// Build the orchestrator described by this configuration.
    pub fn grace_server(&self) -> GraceServer {
        let mut server = GraceServer::new(Duration::from_secs(self.drain_timeout_secs));
        if let Some(secs) = self.header_read_timeout_secs {
            server = server.with_header_read_timeout(Duration::from_secs(secs));
        }
        if let Some(max) = self.max_header_bytes {
            server = server.with_max_header_bytes(max);
        }
        if let Some(secs) = self.read_timeout_secs {
            server = server.with_read_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.write_timeout_secs {
            server = server.with_write_timeout(Duration::from_secs(secs));
        }
        server
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Listen address: {}", self.addr);
        if self.drain_timeout_secs == 0 {
            info!("Drain timeout: unbounded");
        } else {
            info!("Drain timeout: {}s", self.drain_timeout_secs);
        }
        if let Some(secs) = self.header_read_timeout_secs {
            info!("Header read timeout: {}s", secs);
        }
        if let Some(max) = self.max_header_bytes {
            info!("Max header bytes: {}", max);
        }
        if let Some(secs) = self.read_timeout_secs {
            info!("Read timeout: {}s", secs);
        }
        if let Some(secs) = self.write_timeout_secs {
            info!("Write timeout: {}s", secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::try_parse_from(["grace-server"]).unwrap();
        assert_eq!(config.addr, ":6086");
        assert_eq!(config.drain_timeout_secs, 60);
        assert_eq!(config.grace_server().drain_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_flags() {
        let config = ServerConfig::try_parse_from([
            "grace-server",
            "--addr",
            "127.0.0.1:9000",
            "--drain-timeout-secs",
            "0",
            "--max-header-bytes",
            "16384",
            "--read-timeout-secs",
            "30",
            "--write-timeout-secs",
            "10",
        ])
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert!(config.grace_server().drain_timeout().is_zero());
        assert_eq!(config.max_header_bytes, Some(16384));
        assert_eq!(config.header_read_timeout_secs, None);
        assert_eq!(config.read_timeout_secs, Some(30));
        assert_eq!(config.write_timeout_secs, Some(10));
    }
}
