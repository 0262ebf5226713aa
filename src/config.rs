use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Tuning knobs for the scheduler loop and its output relay.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long the loop sleeps when the queue is empty
    pub idle_sleep_ms: u64,
    /// Cooperative pause taken before each non-blocking output read
    pub read_pause_ms: u64,
    /// Upper bound on bytes read from one stream per drain pass
    pub chunk_size: usize,
    /// Interval between queue diagnostics
    pub report_interval_secs: u64,
    /// Delay before the first queue diagnostics after startup
    pub first_report_delay_secs: u64,
    /// Environment overrides applied to every spawned process.
    /// Per-job overrides take precedence.
    pub env: Vec<(String, String)>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: 1000,
            read_pause_ms: 100,
            chunk_size: 1024,
            report_interval_secs: 15,
            first_report_delay_secs: 10,
            env: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn read_pause(&self) -> Duration {
        Duration::from_millis(self.read_pause_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn first_report_delay(&self) -> Duration {
        Duration::from_secs(self.first_report_delay_secs)
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Configuration for a long-running `jobwarden serve` process.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Address for the HTTP status API. Disabled when `None`.
    pub dashboard_addr: Option<SocketAddr>,
    /// File holding completion records. In-memory only when `None`.
    pub completion_path: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
}

impl ServerConfig {
    pub fn new(scheduler: SchedulerConfig) -> Self {
        Self {
            scheduler,
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_completion_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.completion_path = Some(path.into());
        self
    }
}

/// Parse `KEY=VALUE` pairs as given on the command line.
pub fn parse_env_pair(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        tracing::warn!(raw, "Invalid environment override, expected KEY=VALUE");
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.idle_sleep(), Duration::from_secs(1));
        assert_eq!(cfg.read_pause(), Duration::from_millis(100));
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.report_interval(), Duration::from_secs(15));
        assert_eq!(cfg.first_report_delay(), Duration::from_secs(10));
        assert!(cfg.env.is_empty());
    }

    #[test]
    fn scheduler_config_with_env() {
        let cfg = SchedulerConfig::default()
            .with_env("HOME", "/root")
            .with_env("ANSIBLE_FORCE_COLOR", "0");
        assert_eq!(cfg.env.len(), 2);
        assert_eq!(cfg.env[0], ("HOME".to_string(), "/root".to_string()));
    }

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert!(cfg.dashboard_addr.is_none());
        assert!(cfg.completion_path.is_none());
        assert_eq!(cfg.scheduler.chunk_size, 1024);
    }

    #[test]
    fn server_config_builders() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = ServerConfig::new(SchedulerConfig::default())
            .with_dashboard(addr)
            .with_completion_path("/var/lib/jobwarden/completions.json");
        assert_eq!(cfg.dashboard_addr, Some(addr));
        assert_eq!(
            cfg.completion_path,
            Some(PathBuf::from("/var/lib/jobwarden/completions.json"))
        );
    }

    #[test]
    fn parse_env_pair_accepts_key_value() {
        assert_eq!(
            parse_env_pair("HOME=/root"),
            Some(("HOME".to_string(), "/root".to_string()))
        );
        assert_eq!(
            parse_env_pair("OPTS=a=b"),
            Some(("OPTS".to_string(), "a=b".to_string()))
        );
    }

    #[test]
    fn parse_env_pair_rejects_malformed() {
        assert_eq!(parse_env_pair("HOME"), None);
        assert_eq!(parse_env_pair("=value"), None);
    }
}
