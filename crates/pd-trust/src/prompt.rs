//! Contracts with the UI layer and the tab's navigation surface.

use crate::detector::MismatchVerdict;
use crate::detector::TlsErrorKind;
use crate::identity::IdentitySnapshot;
use crate::pending::Credentials;
use crate::pending::DecisionId;
use crate::pending::DecisionKind;
use crate::pin::DomainKey;
use crate::pin::DomainPin;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Stable identifier of a tab in the host's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab{}", self.0)
    }
}

/// What the UI renders for an open decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub tab: TabId,
    pub decision: DecisionId,
    pub detail: PromptDetail,
}

impl PromptRequest {
    pub fn kind(&self) -> DecisionKind {
        match self.detail {
            PromptDetail::Certificate { .. } => DecisionKind::CertificateError,
            PromptDetail::HttpAuth { .. } => DecisionKind::HttpAuthChallenge,
            PromptDetail::PinMismatch { .. } => DecisionKind::PinMismatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptDetail {
    Certificate {
        host: String,
        error: TlsErrorKind,
        /// Absent when the certificate fields could not be read.
        identity: Option<IdentitySnapshot>,
    },
    HttpAuth {
        host: String,
        realm: String,
    },
    PinMismatch {
        host: String,
        domain: DomainKey,
        verdict: MismatchVerdict,
        pinned: DomainPin,
        live: IdentitySnapshot,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDelivery {
    Shown,
    /// No UI surface can host the prompt (e.g. the activity is being recreated).
    Unavailable,
}

/// UI collaborator that renders prompts and removes stale ones.
pub trait PromptSink: Send + Sync {
    fn present(&self, prompt: &PromptRequest) -> PromptDelivery;
    fn dismiss(&self, tab: TabId, decision: DecisionId);
}

/// Navigation surface of one tab.
pub trait TabNavigator: Send {
    fn can_go_back(&self) -> bool;
    fn go_back(&mut self);
    fn load_blank(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateResolution {
    Proceed,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResolution {
    Submit(Credentials),
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinResolution {
    UpdatePin,
    GoBack,
    ProceedIgnoreOnce,
}

/// User choice delivered by the UI for a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Certificate(CertificateResolution),
    Auth(AuthResolution),
    Pin(PinResolution),
}

impl Resolution {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::Certificate(_) => DecisionKind::CertificateError,
            Self::Auth(_) => DecisionKind::HttpAuthChallenge,
            Self::Pin(_) => DecisionKind::PinMismatch,
        }
    }
}

/// Result of delivering a resolution or looking up a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStatus {
    Applied,
    /// The tab or decision no longer exists (already resolved, superseded, or lost
    /// across a restart). The UI dismisses the prompt; nothing else happens.
    Stale,
}
