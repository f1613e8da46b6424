//! Browser host: owns the trust policy, the pin store and the tab registry.

pub mod logging;

use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_security::TrustPolicy;
use pd_storage::DomainSettingsStore;
use pd_storage::StorageConfig;
use pd_trust::DomainKey;
use pd_trust::InMemoryPinStore;
use pd_trust::InterruptedPrompt;
use pd_trust::PinStore;
use pd_trust::PromptSink;
use pd_trust::SavedTrustState;
use pd_trust::TabRegistry;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

pub const ENV_STORAGE_DIR: &str = "PIXELDUST_STORAGE_DIR";

/// Host configuration resolved at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserConfig {
    pub policy: TrustPolicy,
    pub storage_root: PathBuf,
}

impl BrowserConfig {
    pub fn from_env() -> BrowserResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BrowserResult<Self> {
        let policy = TrustPolicy::from_lookup(&lookup)?;
        let storage_root = match lookup(ENV_STORAGE_DIR) {
            Some(root) if !root.trim().is_empty() => PathBuf::from(root),
            _ => default_storage_root(),
        };
        Ok(Self {
            policy,
            storage_root,
        })
    }
}

/// Startup summary used by the shell/app layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserSummary {
    pub trust_on_first_use: bool,
    pub pin_ip_addresses: bool,
    pub persistent_pins: bool,
    pub storage_root: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Browser {
    config: BrowserConfig,
    settings: Option<Arc<DomainSettingsStore>>,
    registry: TabRegistry,
}

impl Browser {
    pub fn new(prompts: Arc<dyn PromptSink>) -> BrowserResult<Self> {
        Self::with_config(BrowserConfig::from_env()?, prompts)
    }

    pub fn with_config(config: BrowserConfig, prompts: Arc<dyn PromptSink>) -> BrowserResult<Self> {
        let settings = if config.policy.ephemeral_mode {
            None
        } else {
            Some(Arc::new(
                DomainSettingsStore::new(StorageConfig::default())
                    .with_persistent_root(config.storage_root.clone()),
            ))
        };
        let store: Arc<dyn PinStore> = match &settings {
            Some(settings) => settings.clone(),
            None => Arc::new(InMemoryPinStore::new()),
        };

        tracing::info!(
            ephemeral = config.policy.ephemeral_mode,
            tofu = config.policy.trust_on_first_use,
            pin_ips = config.policy.pin_ip_addresses,
            root = %config.storage_root.display(),
            "browser host configured"
        );
        let registry = TabRegistry::new(config.policy.clone(), store, prompts);
        Ok(Self {
            config,
            settings,
            registry,
        })
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub fn registry(&self) -> &TabRegistry {
        &self.registry
    }

    /// File-backed settings, absent in ephemeral mode.
    pub fn settings(&self) -> Option<&DomainSettingsStore> {
        self.settings.as_deref()
    }

    pub fn boot(&self) -> BrowserSummary {
        BrowserSummary {
            trust_on_first_use: self.config.policy.trust_on_first_use,
            pin_ip_addresses: self.config.policy.pin_ip_addresses,
            persistent_pins: self.settings.is_some(),
            storage_root: self
                .settings
                .as_ref()
                .and_then(|settings| settings.persistent_root().map(Path::to_path_buf)),
        }
    }

    /// "Forget this site's pin" from the domain settings screen.
    pub fn forget_pin(&self, domain: &DomainKey) -> BrowserResult<()> {
        self.registry.store().clear_pin(domain)?;
        tracing::info!(%domain, "pin cleared by user");
        Ok(())
    }

    /// Cancels open decisions and encodes what the next process needs.
    pub fn save_trust_state(&self) -> BrowserResult<String> {
        let saved = self.registry.prepare_for_save()?;
        serde_json::to_string(&saved).map_err(|error| {
            BrowserError::new(
                "trust.state_encode_failed",
                format!("failed to encode saved trust state: {error}"),
            )
        })
    }

    /// Applies a blob from `save_trust_state`; returns prompts the UI must dismiss.
    pub fn restore_trust_state(&self, encoded: &str) -> BrowserResult<Vec<InterruptedPrompt>> {
        let saved: SavedTrustState = serde_json::from_str(encoded).map_err(|error| {
            BrowserError::new(
                "trust.state_decode_failed",
                format!("saved trust state is malformed: {error}"),
            )
        })?;
        Ok(self.registry.restore(&saved))
    }
}

fn default_storage_root() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".pixeldust")
}
