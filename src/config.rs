use std::{collections::HashSet, path::Path, time::Duration};

use rc_core::{
    config::{FamilyConfig, RuntimeConfig},
    Proxy,
};
use rc_magiclink::{MagicLinkConfig, PacketIdentification, DEFAULT_REPLY_TIMEOUT};
use rc_server::config::ServerConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    /// Base64 encoded AES-256 key shared by the whole network.
    pub secret_key: String,

    /// Settings used when running as the proxy.
    #[serde(default)]
    pub proxy: Option<ProxySection>,
    /// Settings used when running as a backend server.
    #[serde(default)]
    pub server: Option<ServerSection>,
}

/// Settings of the MagicLink engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagicLinkSection {
    /// Time, in seconds, packets wait for a reply.
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout: u64,
    /// Number of packets kept for inspection.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Packet types never kept for inspection.
    #[serde(default)]
    pub cache_ignored: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    /// Address the MagicLink endpoint listens on.
    #[serde(alias = "bind")]
    pub bind_address: String,
    /// UUID of the proxy, random on every boot if unset.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    /// Family players join first.
    pub root_family: String,
    #[serde(default)]
    pub families: Vec<FamilyConfig>,
    #[serde(default)]
    pub magic_link: MagicLinkSection,

    /// Settings that can be reloaded.
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Base HTTP address of the proxy MagicLink endpoint.
    pub proxy_address: String,
    /// UUID of the server, random on every boot if unset.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub magic_link: MagicLinkSection,

    /// Identity announced to the proxy.
    #[serde(flatten)]
    pub identity: ServerConfig,
}

fn default_reply_timeout() -> u64 {
    DEFAULT_REPLY_TIMEOUT.as_secs()
}

fn default_cache_size() -> usize {
    100
}

impl Default for MagicLinkSection {
    fn default() -> Self {
        Self {
            reply_timeout: default_reply_timeout(),
            cache_size: default_cache_size(),
            cache_ignored: Vec::new(),
        }
    }
}

impl MagicLinkSection {
    pub fn to_config(&self) -> MagicLinkConfig {
        let ignored_packets: HashSet<PacketIdentification> = self
            .cache_ignored
            .iter()
            .map(|identification| PacketIdentification::from_raw(identification.as_str()))
            .collect();
        MagicLinkConfig {
            reply_timeout: Duration::from_secs(u64::max(self.reply_timeout, 1)),
            cache_size: self.cache_size.clamp(1, 1000),
            ignored_packets,
        }
    }
}

/// Reads the configuration file.
///
/// ## Arguments
///
/// * `config_file` - Config file path
pub async fn read_config<P: AsRef<Path>>(config_file: P) -> anyhow::Result<RootConfig> {
    let contents = tokio::fs::read_to_string(config_file).await?;
    let config: RootConfig = toml::from_str(&contents)?;
    Ok(config)
}

/// Reloads the runtime configuration of a proxy.
///
/// Families are not reloaded, registration configs and timings are.
///
/// ## Arguments
///
/// * `proxy` - Running proxy
/// * `config_file` - Config file path
pub async fn reload_proxy<P: AsRef<Path>>(proxy: &Proxy, config_file: P) -> bool {
    let reload = || async move {
        let config = read_config(config_file).await?;
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Parsed configuration: {:#?}", config);
        }
        let section = config
            .proxy
            .ok_or_else(|| anyhow::anyhow!("no [proxy] section"))?;
        anyhow::Result::<RuntimeConfig>::Ok(section.runtime)
    };
    match reload().await {
        Ok(runtime) => {
            let magic_config_count = runtime.magic_configs.len();
            proxy.reload_config(runtime).await;
            log::info!(
                "Reloaded configuration. There are now {} registration configs",
                magic_config_count
            );
            true
        }
        Err(err) => {
            log::error!("Couldn't reload configuration: {:?}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use rc_core::config::LoadBalanceMethod;

    use super::*;

    #[test]
    fn parses_proxy_config() {
        let config: RootConfig = toml::from_str(
            r#"
            secret_key = "c2VjcmV0"

            [proxy]
            bind = "0.0.0.0:8080"
            root_family = "lobby"
            server_timeout = 20

            [[proxy.families]]
            id = "lobby"

            [[proxy.families]]
            id = "games"
            parent = "lobby"
            load_balancer = { method = "most_connection", weighted = true }

            [proxy.magic_configs.lobby]
            family = "lobby"
            soft_cap = 20
            hard_cap = 30
            "#,
        )
        .unwrap();
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.bind_address, "0.0.0.0:8080");
        assert_eq!(proxy.runtime.server_timeout, 20);
        assert_eq!(proxy.runtime.ping_interval, 10);
        assert_eq!(proxy.families.len(), 2);
        assert_eq!(
            proxy.families[1].load_balancer.method,
            LoadBalanceMethod::MostConnection
        );
        assert_eq!(proxy.runtime.magic_configs["lobby"].hard_cap, 30);
        assert_eq!(proxy.magic_link.to_config().cache_size, 100);
        assert!(config.server.is_none());
    }

    #[test]
    fn parses_server_config() {
        let config: RootConfig = toml::from_str(
            r#"
            secret_key = "c2VjcmV0"

            [server]
            proxy_address = "http://10.0.0.1:8080"
            magic_config = "lobby"
            address = "10.0.0.5:25566"
            magic_link = { cache_size = 5000, cache_ignored = ["RC-P"] }
            "#,
        )
        .unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.identity.magic_config, "lobby");
        assert_eq!(server.identity.display_name, None);
        let magic_link = server.magic_link.to_config();
        assert_eq!(magic_link.cache_size, 1000);
        assert!(magic_link
            .ignored_packets
            .contains(&PacketIdentification::from_raw("RC-P")));
    }
}
