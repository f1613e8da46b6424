//! File-backed per-domain settings records, including the trust pins.

use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_trust::DomainKey;
use pd_trust::DomainPin;
use pd_trust::IdentitySnapshot;
use pd_trust::PinStore;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

/// Durable storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub ephemeral_mode: bool,
}

/// Everything stored for one domain settings ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSettings {
    #[serde(default)]
    pub pin: DomainPin,
    /// Site preferences owned by other subsystems; pin writes leave them untouched.
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
}

impl DomainSettings {
    pub fn is_empty(&self) -> bool {
        self.pin.is_unpinned() && self.preferences.is_empty()
    }
}

/// One JSON record per domain under `<root>/domains/`.
///
/// Read-modify-write cycles are serialized by an internal lock, and each
/// record is replaced atomically through a synced sibling temp file.
#[derive(Debug)]
pub struct DomainSettingsStore {
    config: StorageConfig,
    persistent_root: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl DomainSettingsStore {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            persistent_root: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_persistent_root(mut self, root: PathBuf) -> Self {
        self.persistent_root = Some(root);
        self
    }

    pub fn persistent_root(&self) -> Option<&Path> {
        self.persistent_root.as_deref()
    }

    pub fn load(&self, domain: &DomainKey) -> BrowserResult<DomainSettings> {
        read_record(&self.record_path(domain)?)
    }

    pub fn preference(&self, domain: &DomainKey, key: &str) -> BrowserResult<Option<String>> {
        Ok(self.load(domain)?.preferences.get(key).cloned())
    }

    pub fn set_preference(&self, domain: &DomainKey, key: &str, value: &str) -> BrowserResult<()> {
        self.modify(domain, |settings| {
            settings.preferences.insert(key.to_owned(), value.to_owned());
        })
    }

    pub fn remove_preference(&self, domain: &DomainKey, key: &str) -> BrowserResult<()> {
        self.modify(domain, |settings| {
            settings.preferences.remove(key);
        })
    }

    /// Domains that currently have a record on disk, in sorted order.
    pub fn domains(&self) -> BrowserResult<Vec<DomainKey>> {
        let dir = self.records_dir()?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|error| {
            BrowserError::new(
                "storage.record_read_failed",
                format!("failed to list `{}`: {error}", dir.display()),
            )
        })?;

        let mut domains = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let stem = path.file_stem().and_then(|stem| stem.to_str());
                match stem.and_then(domain_from_record_name) {
                    Some(domain) => domains.push(domain),
                    None => {
                        tracing::warn!(path = %path.display(), "skipping undecodable settings record name");
                    }
                }
            }
        }
        domains.sort();
        Ok(domains)
    }

    fn modify(
        &self,
        domain: &DomainKey,
        update: impl FnOnce(&mut DomainSettings),
    ) -> BrowserResult<()> {
        let path = self.record_path(domain)?;
        let _guard = self.write_lock.lock().map_err(|_| {
            BrowserError::new(
                "storage.lock_poisoned",
                "settings store lock was poisoned by a panicking thread",
            )
        })?;

        let mut settings = read_record(&path)?;
        update(&mut settings);

        if settings.is_empty() {
            remove_record(&path)?;
        } else {
            write_record(&path, &settings)?;
        }
        tracing::debug!(%domain, path = %path.display(), "domain settings written");
        Ok(())
    }

    fn records_dir(&self) -> BrowserResult<PathBuf> {
        if self.config.ephemeral_mode {
            return Err(BrowserError::new(
                "storage.persistence_disabled",
                "persistent storage is disabled in ephemeral mode",
            ));
        }

        let root = self.persistent_root.as_ref().ok_or_else(|| {
            BrowserError::new(
                "storage.persistence_unconfigured",
                "persistent storage root is not configured",
            )
        })?;
        Ok(root.join("domains"))
    }

    fn record_path(&self, domain: &DomainKey) -> BrowserResult<PathBuf> {
        let dir = self.records_dir()?;
        let name = record_name(domain)?;
        Ok(dir.join(format!("{name}.json")))
    }
}

impl PinStore for DomainSettingsStore {
    fn get(&self, domain: &DomainKey) -> BrowserResult<DomainPin> {
        Ok(self.load(domain)?.pin)
    }

    fn set_pinned_identity(
        &self,
        domain: &DomainKey,
        identity: &IdentitySnapshot,
    ) -> BrowserResult<()> {
        self.modify(domain, |settings| {
            settings.pin.pinned_identity = Some(identity.clone());
        })
    }

    fn set_pinned_ip_addresses(
        &self,
        domain: &DomainKey,
        addresses: &BTreeSet<String>,
    ) -> BrowserResult<()> {
        self.modify(domain, |settings| {
            settings.pin.pinned_ip_addresses = Some(addresses.clone());
        })
    }

    fn update_pin(
        &self,
        domain: &DomainKey,
        identity: &IdentitySnapshot,
        addresses: Option<&BTreeSet<String>>,
    ) -> BrowserResult<()> {
        self.modify(domain, |settings| {
            settings.pin.pinned_identity = Some(identity.clone());
            if let Some(addresses) = addresses {
                settings.pin.pinned_ip_addresses = Some(addresses.clone());
            }
        })
    }

    fn clear_pin(&self, domain: &DomainKey) -> BrowserResult<()> {
        self.modify(domain, |settings| settings.pin = DomainPin::default())
    }
}

/// Reversible file name for a domain record.
///
/// Percent-encoding keeps every distinct key on its own file. Keys never end
/// in a dot, so no name can resolve to `.` or `..`.
fn record_name(domain: &DomainKey) -> BrowserResult<String> {
    let raw = domain.as_str();
    if raw.is_empty() {
        return Err(BrowserError::new(
            "storage.record_name_invalid",
            "settings record key must not be empty",
        ));
    }

    Ok(urlencoding::encode(raw).into_owned())
}

fn domain_from_record_name(stem: &str) -> Option<DomainKey> {
    let decoded = urlencoding::decode(stem).ok()?;
    if decoded.is_empty() {
        return None;
    }
    Some(DomainKey::new(decoded.as_ref()))
}

fn read_record(path: &Path) -> BrowserResult<DomainSettings> {
    if !path.exists() {
        return Ok(DomainSettings::default());
    }

    let content = fs::read_to_string(path).map_err(|error| {
        BrowserError::new(
            "storage.record_read_failed",
            format!("failed to read settings record `{}`: {error}", path.display()),
        )
    })?;

    serde_json::from_str(&content).map_err(|error| {
        BrowserError::new(
            "storage.record_format_invalid",
            format!("settings record `{}` is malformed: {error}", path.display()),
        )
    })
}

fn write_record(path: &Path, settings: &DomainSettings) -> BrowserResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            BrowserError::new(
                "storage.record_dir_create_failed",
                format!(
                    "failed to create settings directory `{}`: {error}",
                    parent.display()
                ),
            )
        })?;
    }

    let encoded = serde_json::to_vec_pretty(settings).map_err(|error| {
        BrowserError::new(
            "storage.record_encode_failed",
            format!("failed to encode settings record: {error}"),
        )
    })?;

    let write_failed = |error: std::io::Error| {
        BrowserError::new(
            "storage.record_write_failed",
            format!("failed to write settings record `{}`: {error}", path.display()),
        )
    };

    let staging = path.with_extension("json.tmp");
    let written = fs::File::create(&staging).and_then(|mut file| {
        file.write_all(&encoded)?;
        file.sync_all()
    });
    if let Err(error) = written {
        let _ = fs::remove_file(&staging);
        return Err(write_failed(error));
    }

    fs::rename(&staging, path).map_err(|error| {
        let _ = fs::remove_file(&staging);
        write_failed(error)
    })
}

fn remove_record(path: &Path) -> BrowserResult<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_file(path).map_err(|error| {
        BrowserError::new(
            "storage.record_remove_failed",
            format!(
                "failed removing empty settings record `{}`: {error}",
                path.display()
            ),
        )
    })
}
