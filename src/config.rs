use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    value::Uncased,
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::discovery::RestrictMode;

/// Variables understood for compatibility with existing platform deployments,
/// mapped to their config keys.
const PLATFORM_ENV: &[(&str, &str)] = &[
    ("DOCKERCLOUD_AUTH", "auth"),
    ("DOCKERCLOUD_NODE_FQDN", "node_fqdn"),
    ("RESTRICT_MODE", "restrict_mode"),
    ("NGINX_DEFAULT_CONF", "conf_path"),
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Authorization header value for the platform API and event stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_fqdn: Option<String>,
    pub restrict_mode: RestrictMode,
    pub conf_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_conf_path: Option<PathBuf>,
    pub api_url: String,
    pub stream_url: String,
    pub reload_command: String,
    pub quiet_period_ms: u64,
    pub file_quiet_period_ms: u64,
    pub retry_delay_ms: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth: None,
            node_fqdn: None,
            restrict_mode: RestrictMode::None,
            conf_path: "/etc/nginx/conf.d/default.conf".into(),
            fallback_conf_path: None,
            api_url: "https://cloud.docker.com/api/app/v1".into(),
            stream_url: "wss://ws.cloud.docker.com/api/audit/v1/events".into(),
            reload_command: "nginx -s reload".into(),
            quiet_period_ms: 5_000,
            file_quiet_period_ms: 3_000,
            retry_delay_ms: 10_000,
            ping_interval_secs: 240,
            pong_timeout_secs: 30,
            reconnect_base_ms: 500,
            reconnect_max_ms: 60_000,
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("fleetconf.toml"))
            .merge(Json::file("fleetconf.json"))
            .merge(platform_env())
            .merge(Env::prefixed("FLEETCONF_"))
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("FLEETCONF_AUTH_FILE") {
            config.auth = Some(std::fs::read_to_string(secret_file)?.trim().to_string());
        }

        Ok(config)
    }

    /// The credential, if present and non-blank.
    pub fn credential(&self) -> Option<&str> {
        self.auth.as_deref().map(str::trim).filter(|a| !a.is_empty())
    }

    /// Checks that do not concern the credential, which `main` handles
    /// separately with an operator-facing message.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.restrict_mode != RestrictMode::None && self.node_fqdn.is_none() {
            anyhow::bail!(
                "restrict_mode `{}` requires the node fqdn (DOCKERCLOUD_NODE_FQDN)",
                self.restrict_mode
            );
        }
        if self.reload_command()?.is_empty() {
            anyhow::bail!("reload_command is empty");
        }
        if self.ping_interval_secs == 0 {
            anyhow::bail!("ping_interval_secs must be positive");
        }
        if let Err(e) = self.stream_url.as_str().into_client_request() {
            anyhow::bail!("Invalid stream_url {:?}: {}", self.stream_url, e);
        }
        Ok(())
    }

    pub fn reload_command(&self) -> anyhow::Result<Vec<String>> {
        shell_words::split(&self.reload_command)
            .map_err(|e| anyhow::anyhow!("Invalid reload_command: {}", e))
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn file_quiet_period(&self) -> Duration {
        Duration::from_millis(self.file_quiet_period_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn platform_env() -> Env {
    Env::raw().filter_map(|key| {
        PLATFORM_ENV
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, field)| Uncased::from(*field))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_credential() {
        Jail::expect_with(|_jail| {
            let config = Config::from_figment(Config::figment()).unwrap();
            assert_eq!(config.credential(), None);
            assert_eq!(config.restrict_mode, RestrictMode::None);
            assert_eq!(config.quiet_period(), Duration::from_secs(5));
            assert_eq!(config.reload_command().unwrap(), ["nginx", "-s", "reload"]);
            Ok(())
        });
    }

    #[test]
    fn platform_variables_are_mapped() {
        Jail::expect_with(|jail| {
            jail.set_env("DOCKERCLOUD_AUTH", "Basic abc");
            jail.set_env("DOCKERCLOUD_NODE_FQDN", "n1.example");
            jail.set_env("RESTRICT_MODE", "region");
            jail.set_env("NGINX_DEFAULT_CONF", "/tmp/site.conf");

            let config = Config::from_figment(Config::figment()).unwrap();
            assert_eq!(config.credential(), Some("Basic abc"));
            assert_eq!(config.node_fqdn.as_deref(), Some("n1.example"));
            assert_eq!(config.restrict_mode, RestrictMode::Region);
            assert_eq!(config.conf_path, PathBuf::from("/tmp/site.conf"));
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn prefixed_variables_win() {
        Jail::expect_with(|jail| {
            jail.set_env("DOCKERCLOUD_AUTH", "Basic legacy");
            jail.set_env("FLEETCONF_AUTH", "Basic new");
            jail.create_file("fleetconf.toml", "quiet_period_ms = 250")?;

            let config = Config::from_figment(Config::figment()).unwrap();
            assert_eq!(config.credential(), Some("Basic new"));
            assert_eq!(config.quiet_period(), Duration::from_millis(250));
            Ok(())
        });
    }

    #[test]
    fn blank_credential_counts_as_missing() {
        let config = Config {
            auth: Some("   ".into()),
            ..Config::default()
        };
        assert_eq!(config.credential(), None);
    }

    #[test]
    fn node_mode_requires_fqdn() {
        let config = Config {
            restrict_mode: RestrictMode::Node,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_reload_command_is_rejected() {
        let config = Config {
            reload_command: "  ".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unparseable_stream_url_is_rejected() {
        let config = Config {
            stream_url: "ws://[bad".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
