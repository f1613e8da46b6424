//! One-shot wrapper around a blocking platform callback.
//!
//! The platform hands over a token (certificate-error handler, HTTP auth
//! handler, or a held navigation) that must be completed or cancelled exactly
//! once, otherwise the network request hangs. [`PendingDecision`] owns that
//! token, tracks `Open -> Resolved | Cancelled`, and flips its state before the
//! callback runs so a reentrant call from inside the callback is a no-op.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Registry-unique handle for one decision; survives save/restore as a number only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionId(pub u64);

impl fmt::Display for DecisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    CertificateError,
    HttpAuthChallenge,
    PinMismatch,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CertificateError => "certificate_error",
            Self::HttpAuthChallenge => "http_auth_challenge",
            Self::PinMismatch => "pin_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionState {
    Open,
    Resolved,
    Cancelled,
}

/// Username and password for an HTTP auth challenge. `Debug` redacts the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Value a token is completed with when the user makes a choice.
///
/// `Cancel` is the user's negative answer; engine-driven teardown goes through
/// [`DecisionToken::cancel`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    Proceed,
    ProceedWithCredentials(Credentials),
    Cancel,
}

/// Platform one-shot callback. Consuming `self` makes a second call unrepresentable.
pub trait DecisionToken: Send {
    fn complete(self: Box<Self>, outcome: DecisionOutcome);
    fn cancel(self: Box<Self>);
}

/// A token already detached from its decision, waiting to be fired.
///
/// Produced under the tab lock and fired after it is released, so a callback
/// that re-enters the registry cannot deadlock or double-fire. Dropping an
/// unfired settlement cancels the token.
#[must_use = "a settlement that is never fired cancels the platform request on drop"]
pub struct Settlement {
    id: DecisionId,
    kind: DecisionKind,
    token: Option<Box<dyn DecisionToken>>,
    action: SettlementAction,
}

enum SettlementAction {
    Complete(DecisionOutcome),
    Cancel,
}

impl Settlement {
    pub fn id(&self) -> DecisionId {
        self.id
    }

    pub fn kind(&self) -> DecisionKind {
        self.kind
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.action, SettlementAction::Cancel)
    }

    pub fn fire(mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match std::mem::replace(&mut self.action, SettlementAction::Cancel) {
            SettlementAction::Complete(outcome) => token.complete(outcome),
            SettlementAction::Cancel => token.cancel(),
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            tracing::warn!(
                decision = %self.id,
                kind = self.kind.as_str(),
                "settlement dropped unfired; cancelling platform token"
            );
            token.cancel();
        }
    }
}

impl fmt::Debug for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settlement")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cancellation", &self.is_cancellation())
            .finish()
    }
}

pub struct PendingDecision {
    id: DecisionId,
    kind: DecisionKind,
    state: DecisionState,
    token: Option<Box<dyn DecisionToken>>,
}

impl PendingDecision {
    pub fn open(id: DecisionId, kind: DecisionKind, token: Box<dyn DecisionToken>) -> Self {
        Self {
            id,
            kind,
            state: DecisionState::Open,
            token: Some(token),
        }
    }

    pub fn id(&self) -> DecisionId {
        self.id
    }

    pub fn kind(&self) -> DecisionKind {
        self.kind
    }

    pub fn state(&self) -> DecisionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == DecisionState::Open
    }

    /// Completes the token now. No-op unless `Open`.
    pub fn resolve(&mut self, outcome: DecisionOutcome) {
        if let Some(settlement) = self.settle(outcome) {
            settlement.fire();
        }
    }

    /// Cancels the token now. No-op unless `Open`.
    pub fn cancel(&mut self) {
        if let Some(settlement) = self.settle_cancel() {
            settlement.fire();
        }
    }

    /// Marks the decision resolved and detaches the token for deferred firing.
    pub fn settle(&mut self, outcome: DecisionOutcome) -> Option<Settlement> {
        self.detach(DecisionState::Resolved, SettlementAction::Complete(outcome))
    }

    /// Marks the decision cancelled and detaches the token for deferred firing.
    pub fn settle_cancel(&mut self) -> Option<Settlement> {
        self.detach(DecisionState::Cancelled, SettlementAction::Cancel)
    }

    fn detach(&mut self, next: DecisionState, action: SettlementAction) -> Option<Settlement> {
        if self.state != DecisionState::Open {
            return None;
        }

        self.state = next;
        let token = self.token.take()?;
        Some(Settlement {
            id: self.id,
            kind: self.kind,
            token: Some(token),
            action,
        })
    }
}

impl fmt::Debug for PendingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDecision")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for PendingDecision {
    fn drop(&mut self) {
        if let Some(settlement) = self.settle_cancel() {
            tracing::warn!(
                decision = %self.id,
                kind = self.kind.as_str(),
                "open decision dropped without teardown; cancelling platform token"
            );
            settlement.fire();
        }
    }
}
