//! Trust policy defaults and environment overrides.

use pd_core::BrowserError;
use pd_core::BrowserResult;

pub const ENV_TRUST_ON_FIRST_USE: &str = "PIXELDUST_TOFU";
pub const ENV_PIN_IP_ADDRESSES: &str = "PIXELDUST_PIN_IPS";
pub const ENV_EPHEMERAL: &str = "PIXELDUST_EPHEMERAL";

/// Central policy for certificate and identity pinning decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPolicy {
    /// Record the first observed identity for a domain without prompting.
    pub trust_on_first_use: bool,
    /// Record and compare the resolved IP set alongside the certificate.
    pub pin_ip_addresses: bool,
    /// Keep pins in memory only; nothing is written to the storage root.
    pub ephemeral_mode: bool,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            trust_on_first_use: true,
            pin_ip_addresses: true,
            ephemeral_mode: false,
        }
    }
}

impl TrustPolicy {
    /// Default policy with overrides read from the process environment.
    pub fn from_env() -> BrowserResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BrowserResult<Self> {
        let mut policy = Self::default();

        if let Some(raw) = lookup(ENV_TRUST_ON_FIRST_USE) {
            policy.trust_on_first_use = parse_env_bool(ENV_TRUST_ON_FIRST_USE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PIN_IP_ADDRESSES) {
            policy.pin_ip_addresses = parse_env_bool(ENV_PIN_IP_ADDRESSES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_EPHEMERAL) {
            policy.ephemeral_mode = parse_env_bool(ENV_EPHEMERAL, &raw)?;
        }

        Ok(policy)
    }
}

fn parse_env_bool(name: &str, raw: &str) -> BrowserResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BrowserError::new(
            "config.env_bool_invalid",
            format!("`{name}` must be a boolean (1/0, true/false, yes/no, on/off), got `{raw}`"),
        )),
    }
}
