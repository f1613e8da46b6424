//! Classifies a live identity against the stored pin and the platform TLS verdict.

use crate::identity::IdentitySnapshot;
use crate::pin::DomainPin;
use crate::wildcard;
use pd_core::Timestamp;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Certificate problems reported by the platform TLS stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsErrorKind {
    IdMismatch,
    UntrustedIssuer,
    DateInvalid,
    NotYetValid,
    Expired,
    Invalid,
}

impl TlsErrorKind {
    /// Maps the platform's numeric primary error. Unknown codes fail closed as `Invalid`.
    pub fn from_platform_code(code: i32) -> Self {
        match code {
            0 => Self::NotYetValid,
            1 => Self::Expired,
            2 => Self::IdMismatch,
            3 => Self::UntrustedIssuer,
            4 => Self::DateInvalid,
            _ => Self::Invalid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdMismatch => "id_mismatch",
            Self::UntrustedIssuer => "untrusted_issuer",
            Self::DateInvalid => "date_invalid",
            Self::NotYetValid => "not_yet_valid",
            Self::Expired => "expired",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for TlsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    CommonNameChanged,
    IssuerChanged,
    ValidityWindowChanged,
}

/// Outcome of comparing one navigation's identity with the stored baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum MismatchVerdict {
    NoPin,
    Match,
    CertificateMismatch { reason: MismatchReason },
    IpMismatch,
    Untrusted { kind: TlsErrorKind },
}

impl MismatchVerdict {
    pub fn requires_prompt(self) -> bool {
        !matches!(self, Self::NoPin | Self::Match)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPin => "no_pin",
            Self::Match => "match",
            Self::CertificateMismatch {
                reason: MismatchReason::CommonNameChanged,
            } => "common_name_changed",
            Self::CertificateMismatch {
                reason: MismatchReason::IssuerChanged,
            } => "issuer_changed",
            Self::CertificateMismatch {
                reason: MismatchReason::ValidityWindowChanged,
            } => "validity_window_changed",
            Self::IpMismatch => "ip_mismatch",
            Self::Untrusted { .. } => "untrusted",
        }
    }
}

/// Compares `live` against `pin`. Pure: identical inputs give identical verdicts.
pub fn evaluate(live: &IdentitySnapshot, pin: &DomainPin, requested_host: &str) -> MismatchVerdict {
    if pin.is_unpinned() {
        return MismatchVerdict::NoPin;
    }

    if let Some(pinned) = &pin.pinned_identity {
        if let Some(reason) = compare_identity(live, pinned, requested_host) {
            return MismatchVerdict::CertificateMismatch { reason };
        }
    }

    if let Some(pinned_addresses) = &pin.pinned_ip_addresses {
        if !pinned_addresses.is_empty() && !live.ip_addresses.is_superset(pinned_addresses) {
            return MismatchVerdict::IpMismatch;
        }
    }

    MismatchVerdict::Match
}

/// Untrusted condition of the certificate itself at `now`, if any.
///
/// An inverted validity window is `DateInvalid` rather than a construction error.
pub fn validity_error(live: &IdentitySnapshot, now: Timestamp) -> Option<TlsErrorKind> {
    if live.has_inverted_validity() {
        Some(TlsErrorKind::DateInvalid)
    } else if live.is_valid_at(now) {
        None
    } else if now < live.valid_from {
        Some(TlsErrorKind::NotYetValid)
    } else {
        Some(TlsErrorKind::Expired)
    }
}

/// Full per-navigation verdict: certificate problems take precedence over pin state,
/// so an unpinned domain with a bad certificate still prompts.
pub fn assess(
    live: &IdentitySnapshot,
    pin: &DomainPin,
    requested_host: &str,
    now: Timestamp,
    platform_error: Option<TlsErrorKind>,
) -> MismatchVerdict {
    if let Some(kind) = platform_error.or_else(|| validity_error(live, now)) {
        return MismatchVerdict::Untrusted { kind };
    }

    evaluate(live, pin, requested_host)
}

fn compare_identity(
    live: &IdentitySnapshot,
    pinned: &IdentitySnapshot,
    requested_host: &str,
) -> Option<MismatchReason> {
    let subject_changed = live.issued_to.organization != pinned.issued_to.organization
        || live.issued_to.organizational_unit != pinned.issued_to.organizational_unit
        || !common_names_reconcile(
            &live.issued_to.common_name,
            &pinned.issued_to.common_name,
            requested_host,
        );
    if subject_changed {
        return Some(MismatchReason::CommonNameChanged);
    }

    if live.issued_by != pinned.issued_by {
        return Some(MismatchReason::IssuerChanged);
    }

    if live.valid_from != pinned.valid_from || live.valid_to != pinned.valid_to {
        return Some(MismatchReason::ValidityWindowChanged);
    }

    None
}

// Differing names are equivalent when both cover the requested host,
// e.g. a pinned `*.example.com` replaced by `mail.example.com`.
fn common_names_reconcile(live_cn: &str, pinned_cn: &str, requested_host: &str) -> bool {
    live_cn == pinned_cn
        || (wildcard::matches(requested_host, live_cn)
            && wildcard::matches(requested_host, pinned_cn))
}
