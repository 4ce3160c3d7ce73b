use crate::policy::Options;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Process-level settings for one listener
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    // Server configuration
    pub host: String,
    pub port: u16,
    pub multiplexed: bool,

    // Policy sources; inline JSON wins over the file
    pub policy_file: Option<PathBuf>,
    pub policy_inline: Option<String>,

    /// Named limiters and bypass rule sets, persisted by the admin operations
    pub config_file: Option<PathBuf>,

    /// Forwarding targets for the bundled handler
    pub upstreams: Vec<String>,
}

impl ListenerConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let host = env::var("RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("RELAY_PORT")
            .unwrap_or_else(|_| "8421".to_string())
            .parse()
            .context("Invalid RELAY_PORT")?;

        let multiplexed = match env::var("RELAY_MUX") {
            Ok(value) => parse_flag(&value).context("Invalid RELAY_MUX")?,
            Err(_) => false,
        };

        let policy_file = non_empty("RELAY_POLICY_FILE").map(PathBuf::from);
        let policy_inline = non_empty("RELAY_POLICY");
        let config_file = non_empty("RELAY_CONFIG_FILE").map(PathBuf::from);

        let upstreams = non_empty("RELAY_UPSTREAMS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            host,
            port,
            multiplexed,
            policy_file,
            policy_inline,
            config_file,
            upstreams,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Load the policy options from whichever source is configured
    ///
    /// Called again on every reload so edits to the policy file take effect.
    pub fn load_options(&self) -> Result<Options> {
        if let Some(inline) = &self.policy_inline {
            return Options::from_json(inline).context("Invalid RELAY_POLICY");
        }
        match &self.policy_file {
            Some(path) => Options::load(path),
            None => Ok(Options::new()),
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow::anyhow!("expected a boolean, got {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    // Env vars are process-global
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "RELAY_HOST",
        "RELAY_PORT",
        "RELAY_MUX",
        "RELAY_POLICY_FILE",
        "RELAY_POLICY",
        "RELAY_CONFIG_FILE",
        "RELAY_UPSTREAMS",
    ];

    fn clear_test_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();

        let config = ListenerConfig::from_env().unwrap();
        assert_eq!(config.port, 8421);
        assert!(!config.multiplexed);
        assert!(config.upstreams.is_empty());
        assert!(config.load_options().unwrap().is_empty());
    }

    #[test]
    fn test_reads_relay_vars() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("RELAY_HOST", "127.0.0.1");
        env::set_var("RELAY_PORT", "9000");
        env::set_var("RELAY_MUX", "yes");
        env::set_var("RELAY_UPSTREAMS", "a:1, b:2,,c:3 ");

        let config = ListenerConfig::from_env().unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
        assert!(config.multiplexed);
        assert_eq!(config.upstreams, vec!["a:1", "b:2", "c:3"]);

        clear_test_env();
    }

    #[test]
    fn test_rejects_bad_port() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("RELAY_PORT", "http");

        let err = ListenerConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("RELAY_PORT"));

        clear_test_env();
    }

    #[test]
    fn test_inline_policy_wins_over_file() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("policy.json");
        std::fs::write(&file, r#"{"readTimeout": "5s"}"#).unwrap();
        env::set_var("RELAY_POLICY_FILE", &file);

        let config = ListenerConfig::from_env().unwrap();
        assert_eq!(
            config.load_options().unwrap().get_duration("readTimeout").unwrap(),
            Some(Duration::from_secs(5))
        );

        env::set_var("RELAY_POLICY", r#"{"readTimeout": 7}"#);
        let config = ListenerConfig::from_env().unwrap();
        assert_eq!(
            config.load_options().unwrap().get_duration("readTimeout").unwrap(),
            Some(Duration::from_secs(7))
        );

        clear_test_env();
    }
}
