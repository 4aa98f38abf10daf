use serde::{Deserialize, Serialize};

/// Environment variable overriding [`ServerConfig::pod_name`].
pub const POD_NAME_ENV: &str = "RC_POD_NAME";
/// Environment variable overriding [`ServerConfig::address`].
pub const ADDRESS_ENV: &str = "RC_ADDRESS";
/// Environment variable overriding [`ServerConfig::display_name`].
pub const DISPLAY_NAME_ENV: &str = "RC_DISPLAY_NAME";

/// Identity of the backend server, as announced to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name of the registration config the proxy should apply.
    pub magic_config: String,
    /// Address players are connected to.
    pub address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub pod_name: Option<String>,
}

impl ServerConfig {
    /// Overrides the identity with the values of environment variables,
    /// as set under container orchestration.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(address) = value(ADDRESS_ENV) {
            self.address = address;
        }
        if let Some(display_name) = value(DISPLAY_NAME_ENV) {
            self.display_name = Some(display_name);
        }
        if let Some(pod_name) = value(POD_NAME_ENV) {
            self.pod_name = Some(pod_name);
        }
    }
}
