use std::{
    env,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_DATA_PATH: &str = "/var/tmp/aesdsocketdata";
pub const DEFAULT_BACKLOG: i32 = 100;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 128 * 1024;
/// A 128 KiB line buffer with one byte held back.
pub const DEFAULT_MAX_RECORD_LEN: usize = 128 * 1024 - 1;
pub const DEFAULT_TIMESTAMP_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

const ENV_BIND_IP: &str = "LINE_LOG_BIND_IP";
const ENV_PORT: &str = "LINE_LOG_PORT";
const ENV_DATA_PATH: &str = "LINE_LOG_DATA_PATH";
const ENV_TIMESTAMP_SECS: &str = "LINE_LOG_TIMESTAMP_SECS";

/// Runtime settings for the daemon.
///
/// The defaults are what the daemon runs with in production. The command
/// line only toggles detaching, so the handful of settings worth relocating
/// (address, port, data file, timestamp period) can be overridden from the
/// environment instead.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind. Wildcard by default.
    pub bind_ip: IpAddr,
    /// TCP port. Use 0 for an ephemeral port.
    pub port: u16,
    /// Backing file of the shared log.
    pub data_path: PathBuf,
    /// Pending-connection queue depth handed to `listen`.
    pub backlog: i32,
    /// Bytes requested per receive call.
    pub read_buffer_size: usize,
    /// Longest record body kept, excluding the newline.
    pub max_record_len: usize,
    /// Period of the timestamp writer, `None` to run without it.
    pub timestamp_interval: Option<Duration>,
    /// How long a forced-closed worker may take to finish before it is aborted.
    pub drain_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            backlog: DEFAULT_BACKLOG,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            timestamp_interval: Some(DEFAULT_TIMESTAMP_INTERVAL),
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl ServerConfig {
    /// Defaults with any `LINE_LOG_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_BIND_IP) {
            config.bind_ip = parse_var(ENV_BIND_IP, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PORT) {
            config.port = parse_var(ENV_PORT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DATA_PATH) {
            config.data_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup(ENV_TIMESTAMP_SECS) {
            let secs: u64 = parse_var(ENV_TIMESTAMP_SECS, &raw)?;
            config.timestamp_interval = Some(Duration::from_secs(secs));
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|err| {
        Error::startup(
            "reading configuration",
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid {key}={raw:?}: {err}"),
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_production_daemon() {
        let config = ServerConfig::from_lookup(lookup_from(&[])).expect("defaults");
        assert_eq!(config.listen_addr(), "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.data_path, PathBuf::from("/var/tmp/aesdsocketdata"));
        assert_eq!(config.backlog, 100);
        assert_eq!(config.read_buffer_size, 128 * 1024);
        assert_eq!(config.max_record_len, 131_071);
        assert_eq!(config.timestamp_interval, Some(Duration::from_secs(10)));
    }

    #[test]
    fn environment_overrides_apply() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            (ENV_BIND_IP, "127.0.0.1"),
            (ENV_PORT, "0"),
            (ENV_DATA_PATH, "/tmp/line-log-test"),
            (ENV_TIMESTAMP_SECS, "3"),
        ]))
        .expect("overrides");

        assert_eq!(config.listen_addr(), "127.0.0.1:0".parse::<SocketAddr>().unwrap());
        assert_eq!(config.data_path, PathBuf::from("/tmp/line-log-test"));
        assert_eq!(config.timestamp_interval, Some(Duration::from_secs(3)));
    }

    #[test]
    fn unparsable_port_is_a_startup_failure() {
        let err = ServerConfig::from_lookup(lookup_from(&[(ENV_PORT, "ninety")]))
            .expect_err("port must be numeric");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("LINE_LOG_PORT"));
    }
}
