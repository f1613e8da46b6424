//! Per-tab trust state machine.
//!
//! The controller never calls platform or UI code directly. Each transition
//! returns the [`Effect`]s to run, and the registry runs them after releasing
//! the tab lock. Pin writes are the exception: they complete before the
//! transition returns so an approved update is durable before the tab moves on.

use crate::detector;
use crate::detector::MismatchVerdict;
use crate::detector::TlsErrorKind;
use crate::identity::IdentitySnapshot;
use crate::pending::DecisionId;
use crate::pending::DecisionKind;
use crate::pending::DecisionOutcome;
use crate::pending::DecisionToken;
use crate::pending::PendingDecision;
use crate::pending::Settlement;
use crate::pin::DomainKey;
use crate::pin::DomainPin;
use crate::pin::PinStore;
use crate::prompt::AuthResolution;
use crate::prompt::CertificateResolution;
use crate::prompt::PinResolution;
use crate::prompt::PromptDetail;
use crate::prompt::PromptRequest;
use crate::prompt::Resolution;
use crate::prompt::ResolveStatus;
use crate::prompt::TabId;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::Timestamp;
use pd_security::TrustPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    Idle,
    AwaitingCertificateDecision,
    AwaitingAuthDecision,
    AwaitingPinDecision,
}

/// Platform report of a certificate the TLS stack refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsErrorReport {
    pub host: String,
    pub error: TlsErrorKind,
    pub identity: Option<IdentitySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub host: String,
    pub realm: String,
}

/// A navigation the TLS stack accepted, held until the controller releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedNavigation {
    pub host: String,
    /// Settings record for the site; `None` when per-domain settings are off.
    pub domain: Option<DomainKey>,
    /// `Err` when the certificate fields or the IP set could not be read.
    pub identity: Result<IdentitySnapshot, BrowserError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationAction {
    LoadBlank,
    BackOrBlank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    TabDestroyed,
    StateSaved,
    Superseded,
    PromptUnavailable,
}

impl TeardownReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::TabDestroyed => "tab_destroyed",
            Self::StateSaved => "state_saved",
            Self::Superseded => "superseded",
            Self::PromptUnavailable => "prompt_unavailable",
        }
    }
}

/// Work produced by a transition, executed outside the tab lock in order.
#[derive(Debug)]
pub enum Effect {
    Settle(Settlement),
    Present(PromptRequest),
    Dismiss(DecisionId),
    Navigate(NavigationAction),
}

#[derive(Debug)]
pub struct Transition {
    pub status: ResolveStatus,
    pub effects: Vec<Effect>,
    /// Failure reported to the UI after the effects have run.
    pub failure: Option<BrowserError>,
}

impl Transition {
    fn applied(effects: Vec<Effect>) -> Self {
        Self {
            status: ResolveStatus::Applied,
            effects,
            failure: None,
        }
    }

    fn stale() -> Self {
        Self {
            status: ResolveStatus::Stale,
            effects: Vec::new(),
            failure: None,
        }
    }
}

/// Summary of the open decision, for save/restore bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDecision {
    pub id: DecisionId,
    pub kind: DecisionKind,
    pub domain: Option<DomainKey>,
}

enum Pending {
    Certificate(PendingDecision),
    Auth(PendingDecision),
    Pin {
        decision: PendingDecision,
        domain: DomainKey,
        live: IdentitySnapshot,
        /// An IP pin already exists, so an update must replace it.
        ip_pinned: bool,
    },
}

impl Pending {
    fn decision(&self) -> &PendingDecision {
        match self {
            Self::Certificate(decision) | Self::Auth(decision) => decision,
            Self::Pin { decision, .. } => decision,
        }
    }

    fn decision_mut(&mut self) -> &mut PendingDecision {
        match self {
            Self::Certificate(decision) | Self::Auth(decision) => decision,
            Self::Pin { decision, .. } => decision,
        }
    }
}

pub struct TrustDecisionController {
    tab: TabId,
    policy: TrustPolicy,
    pending: Option<Pending>,
    /// Session-only "proceed once" suppression for the current domain.
    ignored_domain: Option<DomainKey>,
}

impl TrustDecisionController {
    pub fn new(tab: TabId, policy: TrustPolicy) -> Self {
        Self {
            tab,
            policy,
            pending: None,
            ignored_domain: None,
        }
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }

    pub fn state(&self) -> TrustState {
        match &self.pending {
            None => TrustState::Idle,
            Some(Pending::Certificate(_)) => TrustState::AwaitingCertificateDecision,
            Some(Pending::Auth(_)) => TrustState::AwaitingAuthDecision,
            Some(Pending::Pin { .. }) => TrustState::AwaitingPinDecision,
        }
    }

    pub fn open_decision(&self) -> Option<OpenDecision> {
        let pending = self.pending.as_ref()?;
        let decision = pending.decision();
        let domain = match pending {
            Pending::Pin { domain, .. } => Some(domain.clone()),
            Pending::Certificate(_) | Pending::Auth(_) => None,
        };
        Some(OpenDecision {
            id: decision.id(),
            kind: decision.kind(),
            domain,
        })
    }

    pub fn ignored_domain(&self) -> Option<&DomainKey> {
        self.ignored_domain.as_ref()
    }

    pub fn on_tls_error(
        &mut self,
        id: DecisionId,
        report: TlsErrorReport,
        token: Box<dyn DecisionToken>,
    ) -> Vec<Effect> {
        let mut effects = self.teardown(TeardownReason::Superseded);
        effects.extend(self.open_certificate_decision(
            id,
            token,
            report.host,
            report.error,
            report.identity,
        ));
        effects
    }

    pub fn on_auth_challenge(
        &mut self,
        id: DecisionId,
        challenge: AuthChallenge,
        token: Box<dyn DecisionToken>,
    ) -> Vec<Effect> {
        let mut effects = self.teardown(TeardownReason::Superseded);
        let decision = PendingDecision::open(id, DecisionKind::HttpAuthChallenge, token);
        tracing::info!(
            tab = %self.tab,
            decision = %id,
            host = %challenge.host,
            realm = %challenge.realm,
            "http auth challenge awaiting user decision"
        );
        self.pending = Some(Pending::Auth(decision));
        effects.push(Effect::Present(PromptRequest {
            tab: self.tab,
            decision: id,
            detail: PromptDetail::HttpAuth {
                host: challenge.host,
                realm: challenge.realm,
            },
        }));
        effects
    }

    /// Evaluates a committed navigation and either releases its token or opens a prompt.
    pub fn on_navigation_committed(
        &mut self,
        id: DecisionId,
        navigation: CommittedNavigation,
        token: Box<dyn DecisionToken>,
        store: &dyn PinStore,
        now: Timestamp,
    ) -> Vec<Effect> {
        let mut effects = self.teardown(TeardownReason::Superseded);
        let CommittedNavigation {
            host,
            domain,
            identity,
        } = navigation;

        if self.ignored_domain.is_some() && self.ignored_domain != domain {
            self.ignored_domain = None;
        }

        let live = match identity {
            Ok(live) => live,
            Err(error) => {
                tracing::warn!(tab = %self.tab, %host, %error, "navigation identity unreadable");
                effects.extend(self.open_certificate_decision(
                    id,
                    token,
                    host,
                    TlsErrorKind::Invalid,
                    None,
                ));
                return effects;
            }
        };

        if let Some(kind) = detector::validity_error(&live, now) {
            effects.extend(self.open_certificate_decision(id, token, host, kind, Some(live)));
            return effects;
        }

        let Some(domain) = domain else {
            effects.extend(release(id, token));
            return effects;
        };

        if self.ignored_domain.as_ref() == Some(&domain) {
            tracing::debug!(tab = %self.tab, %domain, "pin evaluation suppressed for this session");
            effects.extend(release(id, token));
            return effects;
        }

        let pin = match store.get(&domain) {
            Ok(pin) => pin,
            Err(error) => {
                tracing::warn!(tab = %self.tab, %domain, %error, "pin lookup failed");
                effects.extend(self.open_certificate_decision(
                    id,
                    token,
                    host,
                    TlsErrorKind::Invalid,
                    Some(live),
                ));
                return effects;
            }
        };

        let verdict = detector::evaluate(&live, &pin, &host);
        tracing::debug!(tab = %self.tab, %domain, verdict = verdict.as_str(), "pin evaluated");

        match verdict {
            MismatchVerdict::Match => effects.extend(release(id, token)),
            MismatchVerdict::NoPin => {
                self.trust_on_first_use(store, &domain, &live);
                effects.extend(release(id, token));
            }
            MismatchVerdict::Untrusted { kind } => {
                effects.extend(self.open_certificate_decision(id, token, host, kind, Some(live)));
            }
            MismatchVerdict::CertificateMismatch { .. } | MismatchVerdict::IpMismatch => {
                effects.push(self.open_pin_decision(id, token, host, domain, verdict, pin, live));
            }
        }

        effects
    }

    /// Applies the user's choice for `decision`.
    ///
    /// Unknown or already settled decisions are `Stale`. A pin write failure
    /// still releases the platform token but keeps the pin decision pending so
    /// the UI can retry or choose differently.
    pub fn resolve(
        &mut self,
        decision: DecisionId,
        resolution: Resolution,
        store: &dyn PinStore,
    ) -> BrowserResult<Transition> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(Transition::stale());
        };
        if pending.decision().id() != decision {
            return Ok(Transition::stale());
        }

        let expected = pending.decision().kind();
        if resolution.kind() != expected {
            return Err(BrowserError::new(
                "trust.resolution_kind_mismatch",
                format!(
                    "{} resolution delivered for {} decision {decision}",
                    resolution.kind().as_str(),
                    expected.as_str()
                ),
            ));
        }

        tracing::info!(
            tab = %self.tab,
            %decision,
            kind = expected.as_str(),
            resolution = ?resolution,
            "decision resolved by user"
        );

        let mut effects = Vec::new();
        match resolution {
            Resolution::Certificate(CertificateResolution::Proceed) => {
                effects.extend(settle(pending.decision_mut(), DecisionOutcome::Proceed));
            }
            Resolution::Certificate(CertificateResolution::Cancel) => {
                effects.extend(settle(pending.decision_mut(), DecisionOutcome::Cancel));
                effects.push(Effect::Navigate(NavigationAction::LoadBlank));
            }
            Resolution::Auth(AuthResolution::Submit(credentials)) => {
                effects.extend(settle(
                    pending.decision_mut(),
                    DecisionOutcome::ProceedWithCredentials(credentials),
                ));
            }
            Resolution::Auth(AuthResolution::Cancel) => {
                effects.extend(settle(pending.decision_mut(), DecisionOutcome::Cancel));
            }
            Resolution::Pin(choice) => return Ok(self.resolve_pin(choice, store)),
        }

        self.pending = None;
        Ok(Transition::applied(effects))
    }

    /// Cancels `decision` because no UI could host its prompt.
    pub fn abandon(&mut self, decision: DecisionId) -> Vec<Effect> {
        let matches = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.decision().id() == decision);
        if !matches {
            return Vec::new();
        }

        self.teardown(TeardownReason::PromptUnavailable)
    }

    /// Cancels whatever is pending and returns to `Idle`.
    pub fn teardown(&mut self, reason: TeardownReason) -> Vec<Effect> {
        let Some(mut pending) = self.pending.take() else {
            return Vec::new();
        };

        let decision = pending.decision_mut();
        let id = decision.id();
        let mut effects = Vec::new();
        if let Some(settlement) = decision.settle_cancel() {
            tracing::warn!(
                tab = %self.tab,
                decision = %id,
                kind = decision.kind().as_str(),
                reason = reason.as_str(),
                "cancelling open decision"
            );
            effects.push(Effect::Settle(settlement));
        }

        if !matches!(
            reason,
            TeardownReason::StateSaved | TeardownReason::PromptUnavailable
        ) {
            effects.push(Effect::Dismiss(id));
        }
        effects
    }

    fn resolve_pin(&mut self, choice: PinResolution, store: &dyn PinStore) -> Transition {
        let Some(Pending::Pin {
            mut decision,
            domain,
            live,
            ip_pinned,
        }) = self.pending.take()
        else {
            return Transition::stale();
        };

        let mut effects = Vec::new();
        match choice {
            PinResolution::UpdatePin => {
                let addresses =
                    (ip_pinned || self.policy.pin_ip_addresses).then_some(&live.ip_addresses);
                let written = store.update_pin(&domain, &live, addresses);
                effects.extend(settle(&mut decision, DecisionOutcome::Proceed));

                if let Err(error) = written {
                    tracing::warn!(tab = %self.tab, %domain, %error, "pin update failed");
                    let failure = BrowserError::new("trust.pin_write_failed", error.to_string())
                        .context(format!("updating pin for `{domain}`"));
                    self.pending = Some(Pending::Pin {
                        decision,
                        domain,
                        live,
                        ip_pinned,
                    });
                    return Transition {
                        status: ResolveStatus::Applied,
                        effects,
                        failure: Some(failure),
                    };
                }

                tracing::info!(tab = %self.tab, %domain, "pin updated after user confirmation");
            }
            PinResolution::GoBack => {
                effects.push(Effect::Navigate(NavigationAction::BackOrBlank));
                effects.extend(settle(&mut decision, DecisionOutcome::Cancel));
            }
            PinResolution::ProceedIgnoreOnce => {
                self.ignored_domain = Some(domain);
                effects.extend(settle(&mut decision, DecisionOutcome::Proceed));
            }
        }

        Transition::applied(effects)
    }

    fn trust_on_first_use(&self, store: &dyn PinStore, domain: &DomainKey, live: &IdentitySnapshot) {
        if !self.policy.trust_on_first_use {
            return;
        }

        let addresses = self.policy.pin_ip_addresses.then_some(&live.ip_addresses);
        match store.update_pin(domain, live, addresses) {
            Ok(()) => tracing::info!(tab = %self.tab, %domain, "first-use pin recorded"),
            Err(error) => {
                tracing::warn!(tab = %self.tab, %domain, %error, "first-use pin not recorded");
            }
        }
    }

    fn open_certificate_decision(
        &mut self,
        id: DecisionId,
        token: Box<dyn DecisionToken>,
        host: String,
        error: TlsErrorKind,
        identity: Option<IdentitySnapshot>,
    ) -> Vec<Effect> {
        tracing::info!(
            tab = %self.tab,
            decision = %id,
            %host,
            error = error.as_str(),
            "untrusted certificate awaiting user decision"
        );
        let decision = PendingDecision::open(id, DecisionKind::CertificateError, token);
        self.pending = Some(Pending::Certificate(decision));
        vec![Effect::Present(PromptRequest {
            tab: self.tab,
            decision: id,
            detail: PromptDetail::Certificate {
                host,
                error,
                identity,
            },
        })]
    }

    #[allow(clippy::too_many_arguments)]
    fn open_pin_decision(
        &mut self,
        id: DecisionId,
        token: Box<dyn DecisionToken>,
        host: String,
        domain: DomainKey,
        verdict: MismatchVerdict,
        pinned: DomainPin,
        live: IdentitySnapshot,
    ) -> Effect {
        tracing::info!(
            tab = %self.tab,
            decision = %id,
            %domain,
            verdict = verdict.as_str(),
            "pin mismatch awaiting user decision"
        );
        let decision = PendingDecision::open(id, DecisionKind::PinMismatch, token);
        self.pending = Some(Pending::Pin {
            decision,
            domain: domain.clone(),
            live: live.clone(),
            ip_pinned: pinned.pinned_ip_addresses.is_some(),
        });
        Effect::Present(PromptRequest {
            tab: self.tab,
            decision: id,
            detail: PromptDetail::PinMismatch {
                host,
                domain,
                verdict,
                pinned,
                live,
            },
        })
    }
}

impl std::fmt::Debug for TrustDecisionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustDecisionController")
            .field("tab", &self.tab)
            .field("state", &self.state())
            .field("ignored_domain", &self.ignored_domain)
            .finish()
    }
}

fn settle(decision: &mut PendingDecision, outcome: DecisionOutcome) -> Option<Effect> {
    decision.settle(outcome).map(Effect::Settle)
}

fn release(id: DecisionId, token: Box<dyn DecisionToken>) -> Option<Effect> {
    let mut decision = PendingDecision::open(id, DecisionKind::PinMismatch, token);
    settle(&mut decision, DecisionOutcome::Proceed)
}
