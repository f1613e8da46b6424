//! Per-domain pin records and the store contract that persists them.

use crate::identity::IdentitySnapshot;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Identifier of a domain's settings record (registrable domain or settings ID).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainKey(String);

impl DomainKey {
    /// Normalizes to lowercase without surrounding whitespace or trailing dot.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored baseline for one domain. Certificate and IP pins are independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPin {
    pub pinned_identity: Option<IdentitySnapshot>,
    pub pinned_ip_addresses: Option<BTreeSet<String>>,
}

impl DomainPin {
    pub fn is_unpinned(&self) -> bool {
        self.pinned_identity.is_none() && self.pinned_ip_addresses.is_none()
    }
}

/// Read/update contract over the per-domain settings store.
///
/// Writes are synchronous: a setter returns only once the value is durable,
/// and a failed write leaves the previous record untouched.
pub trait PinStore: Send + Sync {
    fn get(&self, domain: &DomainKey) -> BrowserResult<DomainPin>;

    /// Overwrites the certificate pin. Never merges with the previous value.
    fn set_pinned_identity(
        &self,
        domain: &DomainKey,
        identity: &IdentitySnapshot,
    ) -> BrowserResult<()>;

    fn set_pinned_ip_addresses(
        &self,
        domain: &DomainKey,
        addresses: &BTreeSet<String>,
    ) -> BrowserResult<()>;

    /// Writes both pins as one update.
    fn update_pin(
        &self,
        domain: &DomainKey,
        identity: &IdentitySnapshot,
        addresses: Option<&BTreeSet<String>>,
    ) -> BrowserResult<()>;

    fn clear_pin(&self, domain: &DomainKey) -> BrowserResult<()>;
}

/// Session-only store used in ephemeral mode and tests.
#[derive(Debug, Default)]
pub struct InMemoryPinStore {
    pins: RwLock<HashMap<DomainKey, DomainPin>>,
}

impl InMemoryPinStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn modify(&self, domain: &DomainKey, apply: impl FnOnce(&mut DomainPin)) -> BrowserResult<()> {
        let mut pins = self
            .pins
            .write()
            .map_err(|_| BrowserError::lock_poisoned("in-memory pin store"))?;
        let pin = pins.entry(domain.clone()).or_default();
        apply(pin);
        if pin.is_unpinned() {
            pins.remove(domain);
        }
        Ok(())
    }
}

impl PinStore for InMemoryPinStore {
    fn get(&self, domain: &DomainKey) -> BrowserResult<DomainPin> {
        let pins = self
            .pins
            .read()
            .map_err(|_| BrowserError::lock_poisoned("in-memory pin store"))?;
        Ok(pins.get(domain).cloned().unwrap_or_default())
    }

    fn set_pinned_identity(
        &self,
        domain: &DomainKey,
        identity: &IdentitySnapshot,
    ) -> BrowserResult<()> {
        self.modify(domain, |pin| pin.pinned_identity = Some(identity.clone()))
    }

    fn set_pinned_ip_addresses(
        &self,
        domain: &DomainKey,
        addresses: &BTreeSet<String>,
    ) -> BrowserResult<()> {
        self.modify(domain, |pin| {
            pin.pinned_ip_addresses = Some(addresses.clone());
        })
    }

    fn update_pin(
        &self,
        domain: &DomainKey,
        identity: &IdentitySnapshot,
        addresses: Option<&BTreeSet<String>>,
    ) -> BrowserResult<()> {
        self.modify(domain, |pin| {
            pin.pinned_identity = Some(identity.clone());
            if let Some(addresses) = addresses {
                pin.pinned_ip_addresses = Some(addresses.clone());
            }
        })
    }

    fn clear_pin(&self, domain: &DomainKey) -> BrowserResult<()> {
        self.modify(domain, |pin| *pin = DomainPin::default())
    }
}
