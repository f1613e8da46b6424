//! Immutable snapshot of a navigation's certificate identity and resolved addresses.

use pd_core::Timestamp;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;

/// Distinguished-name fields the pinning feature compares.
///
/// A field missing from the certificate is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistinguishedName {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
}

impl DistinguishedName {
    pub fn new(
        common_name: impl Into<String>,
        organization: impl Into<String>,
        organizational_unit: impl Into<String>,
    ) -> Self {
        Self {
            common_name: common_name.into(),
            organization: organization.into(),
            organizational_unit: organizational_unit.into(),
        }
    }

    pub fn with_common_name(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Self::default()
        }
    }
}

/// Certificate identity plus the IP set resolved for the current navigation.
///
/// `valid_from <= valid_to` is not enforced: a misconfigured or hostile
/// certificate may carry an inverted window and the detector reports it
/// instead of rejecting construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub issued_to: DistinguishedName,
    pub issued_by: DistinguishedName,
    pub valid_from: Timestamp,
    pub valid_to: Timestamp,
    /// Textual IP literals; ordering is irrelevant.
    pub ip_addresses: BTreeSet<String>,
}

impl IdentitySnapshot {
    pub fn new(
        issued_to: DistinguishedName,
        issued_by: DistinguishedName,
        valid_from: Timestamp,
        valid_to: Timestamp,
    ) -> Self {
        Self {
            issued_to,
            issued_by,
            valid_from,
            valid_to,
            ip_addresses: BTreeSet::new(),
        }
    }

    pub fn with_ip_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ip_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_inverted_validity(&self) -> bool {
        self.valid_from > self.valid_to
    }

    /// True when `now` lies inside `[valid_from, valid_to]`.
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        self.valid_from <= now && now <= self.valid_to
    }
}
