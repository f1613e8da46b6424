//! Host-owned arena of tabs and the thread-safe entry points into it.
//!
//! Platform callbacks and UI resolutions may arrive on any thread. Each tab's
//! controller sits behind its own mutex, so work on one tab is serialized while
//! different tabs proceed in parallel. Effects are executed only after the tab
//! lock is released.

use crate::controller::AuthChallenge;
use crate::controller::CommittedNavigation;
use crate::controller::Effect;
use crate::controller::NavigationAction;
use crate::controller::TeardownReason;
use crate::controller::TlsErrorReport;
use crate::controller::TrustDecisionController;
use crate::controller::TrustState;
use crate::pending::DecisionId;
use crate::pending::DecisionKind;
use crate::pending::DecisionToken;
use crate::pin::DomainKey;
use crate::pin::PinStore;
use crate::prompt::PromptDelivery;
use crate::prompt::PromptSink;
use crate::prompt::Resolution;
use crate::prompt::ResolveStatus;
use crate::prompt::TabId;
use crate::prompt::TabNavigator;
use pd_core::BrowserError;
use pd_core::BrowserResult;
use pd_core::Timestamp;
use pd_security::TrustPolicy;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A prompt that was open when process state was saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptedPrompt {
    pub tab: TabId,
    pub decision: DecisionId,
    pub kind: DecisionKind,
    pub domain: Option<DomainKey>,
}

/// Serializable trust state carried across process death.
///
/// Platform tokens never survive serialization; only the bookkeeping needed
/// to dismiss orphaned prompts and keep decision ids unique does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTrustState {
    pub interrupted: Vec<InterruptedPrompt>,
    pub decision_high_water: u64,
}

struct TabEntry {
    controller: Mutex<TrustDecisionController>,
    navigator: Mutex<Box<dyn TabNavigator>>,
}

pub struct TabRegistry {
    policy: TrustPolicy,
    store: Arc<dyn PinStore>,
    prompts: Arc<dyn PromptSink>,
    tabs: RwLock<HashMap<TabId, Arc<TabEntry>>>,
    next_decision: AtomicU64,
}

impl TabRegistry {
    pub fn new(policy: TrustPolicy, store: Arc<dyn PinStore>, prompts: Arc<dyn PromptSink>) -> Self {
        Self {
            policy,
            store,
            prompts,
            tabs: RwLock::new(HashMap::new()),
            next_decision: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn PinStore> {
        &self.store
    }

    pub fn register_tab(&self, tab: TabId, navigator: Box<dyn TabNavigator>) -> BrowserResult<()> {
        let mut tabs = self.write_tabs()?;
        if tabs.contains_key(&tab) {
            return Err(BrowserError::new(
                "trust.tab_already_registered",
                format!("{tab} is already registered"),
            ));
        }

        tabs.insert(
            tab,
            Arc::new(TabEntry {
                controller: Mutex::new(TrustDecisionController::new(tab, self.policy.clone())),
                navigator: Mutex::new(navigator),
            }),
        );
        tracing::debug!(%tab, "tab registered");
        Ok(())
    }

    pub fn tab_count(&self) -> BrowserResult<usize> {
        Ok(self.read_tabs()?.len())
    }

    /// Current state of a tab, `None` if the tab is not registered.
    pub fn state(&self, tab: TabId) -> BrowserResult<Option<TrustState>> {
        let Some(entry) = self.entry(tab)? else {
            return Ok(None);
        };
        let controller = lock_controller(&entry)?;
        Ok(Some(controller.state()))
    }

    /// Removes the tab, cancelling anything it had pending.
    pub fn destroy_tab(&self, tab: TabId) -> BrowserResult<ResolveStatus> {
        let Some(entry) = self.write_tabs()?.remove(&tab) else {
            return Ok(ResolveStatus::Stale);
        };

        let effects = lock_controller(&entry)?.teardown(TeardownReason::TabDestroyed);
        tracing::debug!(%tab, "tab destroyed");
        self.execute(tab, &entry, effects)?;
        Ok(ResolveStatus::Applied)
    }

    pub fn report_tls_error(
        &self,
        tab: TabId,
        report: TlsErrorReport,
        token: Box<dyn DecisionToken>,
    ) -> BrowserResult<ResolveStatus> {
        self.dispatch(tab, DecisionKind::CertificateError, token, |controller, id, token| {
            controller.on_tls_error(id, report, token)
        })
    }

    pub fn report_auth_challenge(
        &self,
        tab: TabId,
        challenge: AuthChallenge,
        token: Box<dyn DecisionToken>,
    ) -> BrowserResult<ResolveStatus> {
        self.dispatch(tab, DecisionKind::HttpAuthChallenge, token, |controller, id, token| {
            controller.on_auth_challenge(id, challenge, token)
        })
    }

    pub fn navigation_committed(
        &self,
        tab: TabId,
        navigation: CommittedNavigation,
        token: Box<dyn DecisionToken>,
        now: Timestamp,
    ) -> BrowserResult<ResolveStatus> {
        let store = self.store.clone();
        self.dispatch(tab, DecisionKind::PinMismatch, token, |controller, id, token| {
            controller.on_navigation_committed(id, navigation, token, store.as_ref(), now)
        })
    }

    /// Delivers the user's choice. `Stale` tells the UI to dismiss the prompt.
    ///
    /// A failed pin write is returned as `trust.pin_write_failed` after the
    /// platform token has already been released.
    pub fn resolve(
        &self,
        tab: TabId,
        decision: DecisionId,
        resolution: Resolution,
    ) -> BrowserResult<ResolveStatus> {
        let Some(entry) = self.entry(tab)? else {
            tracing::warn!(%tab, %decision, "resolution for unknown tab; prompt is orphaned");
            return Ok(ResolveStatus::Stale);
        };

        let transition =
            lock_controller(&entry)?.resolve(decision, resolution, self.store.as_ref())?;
        if transition.status == ResolveStatus::Stale {
            tracing::debug!(%tab, %decision, "resolution for settled decision ignored");
        }
        self.execute(tab, &entry, transition.effects)?;

        match transition.failure {
            Some(error) => Err(error),
            None => Ok(transition.status),
        }
    }

    /// Fallible lookup used by the UI when it (re)attaches a prompt.
    ///
    /// `Stale` means the backing tab or decision is gone and the prompt must be dismissed.
    pub fn lookup_prompt(&self, tab: TabId, decision: DecisionId) -> BrowserResult<ResolveStatus> {
        let Some(entry) = self.entry(tab)? else {
            return Ok(ResolveStatus::Stale);
        };
        Ok(if decision_open(&entry, decision)? {
            ResolveStatus::Applied
        } else {
            ResolveStatus::Stale
        })
    }

    /// Cancels every open decision ahead of the process persisting its state.
    ///
    /// Tabs stay registered and return to `Idle`; their prompts are left for the
    /// UI layer to persist and are dismissed on restore.
    pub fn prepare_for_save(&self) -> BrowserResult<SavedTrustState> {
        let entries: Vec<(TabId, Arc<TabEntry>)> = self
            .read_tabs()?
            .iter()
            .map(|(tab, entry)| (*tab, entry.clone()))
            .collect();

        let mut interrupted = Vec::new();
        for (tab, entry) in entries {
            let effects = {
                let mut controller = lock_controller(&entry)?;
                if let Some(open) = controller.open_decision() {
                    interrupted.push(InterruptedPrompt {
                        tab,
                        decision: open.id,
                        kind: open.kind,
                        domain: open.domain,
                    });
                }
                controller.teardown(TeardownReason::StateSaved)
            };
            self.execute(tab, &entry, effects)?;
        }

        interrupted.sort_by_key(|prompt| (prompt.tab, prompt.decision));
        let decision_high_water = self.next_decision.load(Ordering::SeqCst).saturating_sub(1);
        tracing::info!(
            interrupted = interrupted.len(),
            decision_high_water,
            "trust state prepared for save"
        );
        Ok(SavedTrustState {
            interrupted,
            decision_high_water,
        })
    }

    /// Applies state saved by a previous process.
    ///
    /// Returns the prompts the UI must dismiss. Their tokens died with the old
    /// process, so none of them is reconstructed; a later navigation to the same
    /// domain is evaluated afresh and prompts again if the mismatch persists.
    pub fn restore(&self, saved: &SavedTrustState) -> Vec<InterruptedPrompt> {
        self.next_decision
            .fetch_max(saved.decision_high_water.saturating_add(1), Ordering::SeqCst);

        for prompt in &saved.interrupted {
            tracing::warn!(
                tab = %prompt.tab,
                decision = %prompt.decision,
                kind = prompt.kind.as_str(),
                "dismissing prompt orphaned by restart"
            );
        }
        saved.interrupted.clone()
    }

    fn allocate_decision(&self) -> DecisionId {
        DecisionId(self.next_decision.fetch_add(1, Ordering::SeqCst))
    }

    fn entry(&self, tab: TabId) -> BrowserResult<Option<Arc<TabEntry>>> {
        Ok(self.read_tabs()?.get(&tab).cloned())
    }

    /// Hands a platform token to the tab's controller under its lock.
    ///
    /// If the tab is gone, or its lock cannot be taken, the token is cancelled
    /// so the network request cannot hang.
    fn dispatch<F>(
        &self,
        tab: TabId,
        kind: DecisionKind,
        token: Box<dyn DecisionToken>,
        transition: F,
    ) -> BrowserResult<ResolveStatus>
    where
        F: FnOnce(&mut TrustDecisionController, DecisionId, Box<dyn DecisionToken>) -> Vec<Effect>,
    {
        let entry = match self.entry(tab) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::warn!(%tab, kind = kind.as_str(), "platform event for unknown tab; cancelling token");
                token.cancel();
                return Ok(ResolveStatus::Stale);
            }
            Err(error) => {
                token.cancel();
                return Err(error);
            }
        };

        let effects = match lock_controller(&entry) {
            Ok(mut controller) => transition(&mut controller, self.allocate_decision(), token),
            Err(error) => {
                token.cancel();
                return Err(error);
            }
        };
        self.execute(tab, &entry, effects)?;
        Ok(ResolveStatus::Applied)
    }

    fn execute(&self, tab: TabId, entry: &TabEntry, effects: Vec<Effect>) -> BrowserResult<()> {
        for effect in effects {
            match effect {
                Effect::Settle(settlement) => settlement.fire(),
                Effect::Dismiss(decision) => self.prompts.dismiss(tab, decision),
                Effect::Navigate(action) => {
                    let mut navigator = entry
                        .navigator
                        .lock()
                        .map_err(|_| BrowserError::lock_poisoned("tab navigator"))?;
                    match action {
                        NavigationAction::BackOrBlank if navigator.can_go_back() => {
                            navigator.go_back();
                        }
                        NavigationAction::BackOrBlank | NavigationAction::LoadBlank => {
                            navigator.load_blank();
                        }
                    }
                }
                Effect::Present(prompt) => {
                    // A superseding event may have closed the decision since the
                    // transition released the lock.
                    if !decision_open(entry, prompt.decision)? {
                        tracing::debug!(%tab, decision = %prompt.decision, "prompt closed before display");
                        continue;
                    }

                    if self.prompts.present(&prompt) == PromptDelivery::Unavailable {
                        tracing::warn!(
                            %tab,
                            decision = %prompt.decision,
                            "no UI available for prompt; cancelling decision"
                        );
                        let abandoned = lock_controller(entry)?.abandon(prompt.decision);
                        self.execute(tab, entry, abandoned)?;
                    } else if !decision_open(entry, prompt.decision)? {
                        tracing::debug!(%tab, decision = %prompt.decision, "prompt closed while displaying");
                        self.prompts.dismiss(tab, prompt.decision);
                    }
                }
            }
        }
        Ok(())
    }

    fn read_tabs(
        &self,
    ) -> BrowserResult<std::sync::RwLockReadGuard<'_, HashMap<TabId, Arc<TabEntry>>>> {
        self.tabs
            .read()
            .map_err(|_| BrowserError::lock_poisoned("tab registry"))
    }

    fn write_tabs(
        &self,
    ) -> BrowserResult<std::sync::RwLockWriteGuard<'_, HashMap<TabId, Arc<TabEntry>>>> {
        self.tabs
            .write()
            .map_err(|_| BrowserError::lock_poisoned("tab registry"))
    }
}

impl std::fmt::Debug for TabRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabRegistry")
            .field("policy", &self.policy)
            .field("next_decision", &self.next_decision.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn decision_open(entry: &TabEntry, decision: DecisionId) -> BrowserResult<bool> {
    Ok(lock_controller(entry)?
        .open_decision()
        .is_some_and(|open| open.id == decision))
}

fn lock_controller(
    entry: &TabEntry,
) -> BrowserResult<std::sync::MutexGuard<'_, TrustDecisionController>> {
    entry
        .controller
        .lock()
        .map_err(|_| BrowserError::lock_poisoned("tab controller"))
}

#[cfg(test)]
mod tests {
    use super::SavedTrustState;
    use super::TabRegistry;
    use crate::controller::AuthChallenge;
    use crate::controller::CommittedNavigation;
    use crate::controller::TlsErrorReport;
    use crate::controller::TrustState;
    use crate::detector::TlsErrorKind;
    use crate::identity::DistinguishedName;
    use crate::identity::IdentitySnapshot;
    use crate::pending::DecisionId;
    use crate::pending::DecisionKind;
    use crate::pending::DecisionOutcome;
    use crate::pending::DecisionToken;
    use crate::pending::test_support::RecordingToken;
    use crate::pending::test_support::TokenCall;
    use crate::pin::DomainKey;
    use crate::pin::InMemoryPinStore;
    use crate::pin::PinStore;
    use crate::prompt::CertificateResolution;
    use crate::prompt::PinResolution;
    use crate::prompt::PromptDelivery;
    use crate::prompt::PromptRequest;
    use crate::prompt::PromptSink;
    use crate::prompt::Resolution;
    use crate::prompt::ResolveStatus;
    use crate::prompt::TabId;
    use crate::prompt::TabNavigator;
    use chrono::TimeZone;
    use chrono::Utc;
    use pd_core::Timestamp;
    use pd_security::TrustPolicy;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::OnceLock;
    use std::sync::Weak;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct RecordingSink {
        unavailable: AtomicBool,
        presented: Mutex<Vec<(TabId, DecisionId, DecisionKind)>>,
        dismissed: Mutex<Vec<(TabId, DecisionId)>>,
    }

    impl RecordingSink {
        fn presented(&self) -> Vec<(TabId, DecisionId, DecisionKind)> {
            self.presented.lock().map(|p| p.clone()).unwrap_or_default()
        }

        fn dismissed(&self) -> Vec<(TabId, DecisionId)> {
            self.dismissed.lock().map(|d| d.clone()).unwrap_or_default()
        }

        fn last_decision(&self) -> DecisionId {
            self.presented()
                .last()
                .map(|(_, decision, _)| *decision)
                .unwrap_or(DecisionId(0))
        }
    }

    impl PromptSink for RecordingSink {
        fn present(&self, prompt: &PromptRequest) -> PromptDelivery {
            if self.unavailable.load(Ordering::SeqCst) {
                return PromptDelivery::Unavailable;
            }
            if let Ok(mut presented) = self.presented.lock() {
                presented.push((prompt.tab, prompt.decision, prompt.kind()));
            }
            PromptDelivery::Shown
        }

        fn dismiss(&self, tab: TabId, decision: DecisionId) {
            if let Ok(mut dismissed) = self.dismissed.lock() {
                dismissed.push((tab, decision));
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNavigator {
        has_history: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl RecordingNavigator {
        fn log(&self) -> Vec<&'static str> {
            self.log.lock().map(|log| log.clone()).unwrap_or_default()
        }
    }

    impl TabNavigator for RecordingNavigator {
        fn can_go_back(&self) -> bool {
            self.has_history
        }

        fn go_back(&mut self) {
            if let Ok(mut log) = self.log.lock() {
                log.push("back");
            }
        }

        fn load_blank(&mut self) {
            if let Ok(mut log) = self.log.lock() {
                log.push("blank");
            }
        }
    }

    fn at(year: i32, month: u32, day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
            .single()
            .unwrap_or_else(|| unreachable!())
    }

    fn now() -> Timestamp {
        at(2024, 6, 1)
    }

    fn cert(cn: &str) -> IdentitySnapshot {
        IdentitySnapshot::new(
            DistinguishedName::with_common_name(cn),
            DistinguishedName::new("Example CA", "Example Trust", ""),
            at(2024, 1, 1),
            at(2025, 1, 1),
        )
        .with_ip_addresses(["192.0.2.10"])
    }

    fn committed(cn: &str) -> CommittedNavigation {
        CommittedNavigation {
            host: "example.com".to_owned(),
            domain: Some(DomainKey::new("example.com")),
            identity: Ok(cert(cn)),
        }
    }

    struct Fixture {
        registry: Arc<TabRegistry>,
        store: Arc<InMemoryPinStore>,
        sink: Arc<RecordingSink>,
        navigator: RecordingNavigator,
    }

    fn fixture(has_history: bool) -> Fixture {
        let store = Arc::new(InMemoryPinStore::default());
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(TabRegistry::new(
            TrustPolicy::default(),
            store.clone(),
            sink.clone(),
        ));
        let navigator = RecordingNavigator {
            has_history,
            ..RecordingNavigator::default()
        };
        registry
            .register_tab(TabId(1), Box::new(navigator.clone()))
            .unwrap_or_else(|error| panic!("{error}"));
        Fixture {
            registry,
            store,
            sink,
            navigator,
        }
    }

    fn pin_example(store: &InMemoryPinStore) {
        store
            .update_pin(&DomainKey::new("example.com"), &cert("example.com"), None)
            .unwrap_or_else(|error| panic!("{error}"));
    }

    #[test]
    fn first_visit_pins_and_releases_without_prompt() {
        let fx = fixture(true);
        let token = RecordingToken::default();

        let status = fx
            .registry
            .navigation_committed(TabId(1), committed("example.com"), token.boxed(), now())
            .unwrap_or_else(|error| panic!("{error}"));

        assert_eq!(status, ResolveStatus::Applied);
        assert_eq!(token.calls(), vec![TokenCall::Complete(DecisionOutcome::Proceed)]);
        assert!(fx.sink.presented().is_empty());
        let pin = fx.store.get(&DomainKey::new("example.com")).unwrap_or_else(|error| panic!("{error}"));
        assert_eq!(pin.pinned_identity, Some(cert("example.com")));
    }

    #[test]
    fn events_for_unknown_tab_cancel_their_token() {
        let fx = fixture(false);
        let tls = RecordingToken::default();
        let auth = RecordingToken::default();

        let report = TlsErrorReport {
            host: "example.com".to_owned(),
            error: TlsErrorKind::UntrustedIssuer,
            identity: None,
        };
        let challenge = AuthChallenge {
            host: "example.com".to_owned(),
            realm: "intranet".to_owned(),
        };

        assert_eq!(
            fx.registry.report_tls_error(TabId(9), report, tls.boxed()).unwrap_or_else(|error| panic!("{error}")),
            ResolveStatus::Stale
        );
        assert_eq!(
            fx.registry
                .report_auth_challenge(TabId(9), challenge, auth.boxed())
                .unwrap_or_else(|error| panic!("{error}")),
            ResolveStatus::Stale
        );
        assert_eq!(tls.calls(), vec![TokenCall::Cancel]);
        assert_eq!(auth.calls(), vec![TokenCall::Cancel]);
    }

    #[test]
    fn go_back_without_history_loads_blank_page() {
        let fx = fixture(false);
        pin_example(&fx.store);
        let token = RecordingToken::default();

        fx.registry
            .navigation_committed(TabId(1), committed("evil.example"), token.boxed(), now())
            .unwrap_or_else(|error| panic!("{error}"));
        assert_eq!(
            fx.registry.state(TabId(1)).unwrap_or_else(|error| panic!("{error}")),
            Some(TrustState::AwaitingPinDecision)
        );

        let decision = fx.sink.last_decision();
        let status = fx
            .registry
            .resolve(TabId(1), decision, Resolution::Pin(PinResolution::GoBack))
            .unwrap_or_else(|error| panic!("{error}"));

        assert_eq!(status, ResolveStatus::Applied);
        assert_eq!(fx.navigator.log(), vec!["blank"]);
        assert_eq!(token.calls(), vec![TokenCall::Complete(DecisionOutcome::Cancel)]);
        assert_eq!(
            fx.registry.state(TabId(1)).unwrap_or_else(|error| panic!("{error}")),
            Some(TrustState::Idle)
        );
    }

    #[test]
    fn go_back_with_history_navigates_back() {
        let fx = fixture(true);
        pin_example(&fx.store);
        let token = RecordingToken::default();

        fx.registry
            .navigation_committed(TabId(1), committed("evil.example"), token.boxed(), now())
            .unwrap_or_else(|error| panic!("{error}"));
        let decision = fx.sink.last_decision();
        fx.registry
            .resolve(TabId(1), decision, Resolution::Pin(PinResolution::GoBack))
            .unwrap_or_else(|error| panic!("{error}"));

        assert_eq!(fx.navigator.log(), vec!["back"]);
    }

    #[test]
    fn second_resolution_is_stale_and_fires_nothing() {
        let fx = fixture(true);
        let token = RecordingToken::default();
        let report = TlsErrorReport {
            host: "example.com".to_owned(),
            error: TlsErrorKind::Expired,
            identity: Some(cert("example.com")),
        };

        fx.registry
            .report_tls_error(TabId(1), report, token.boxed())
            .unwrap_or_else(|error| panic!("{error}"));
        let decision = fx.sink.last_decision();

        let first = fx
            .registry
            .resolve(
                TabId(1),
                decision,
                Resolution::Certificate(CertificateResolution::Proceed),
            )
            .unwrap_or_else(|error| panic!("{error}"));
        let second = fx
            .registry
            .resolve(
                TabId(1),
                decision,
                Resolution::Certificate(CertificateResolution::Cancel),
            )
            .unwrap_or_else(|error| panic!("{error}"));

        assert_eq!(first, ResolveStatus::Applied);
        assert_eq!(second, ResolveStatus::Stale);
        assert_eq!(token.calls(), vec![TokenCall::Complete(DecisionOutcome::Proceed)]);
        assert!(fx.navigator.log().is_empty());
    }

    #[test]
    fn destroying_tab_cancels_once_and_dismisses_prompt() {
        let fx = fixture(true);
        let token = RecordingToken::default();
        let challenge = AuthChallenge {
            host: "example.com".to_owned(),
            realm: "intranet".to_owned(),
        };

        fx.registry
            .report_auth_challenge(TabId(1), challenge, token.boxed())
            .unwrap_or_else(|error| panic!("{error}"));
        let decision = fx.sink.last_decision();

        assert_eq!(
            fx.registry.destroy_tab(TabId(1)).unwrap_or_else(|error| panic!("{error}")),
            ResolveStatus::Applied
        );
        assert_eq!(
            fx.registry.destroy_tab(TabId(1)).unwrap_or_else(|error| panic!("{error}")),
            ResolveStatus::Stale
        );
        assert_eq!(token.calls(), vec![TokenCall::Cancel]);
        assert_eq!(fx.sink.dismissed(), vec![(TabId(1), decision)]);
        assert_eq!(
            fx.registry
                .lookup_prompt(TabId(1), decision)
                .unwrap_or_else(|error| panic!("{error}")),
            ResolveStatus::Stale
        );
        assert_eq!(fx.registry.tab_count().unwrap_or_else(|error| panic!("{error}")), 0);
    }

    #[test]
    fn unavailable_prompt_cancels_the_decision() {
        let fx = fixture(true);
        fx.sink.unavailable.store(true, Ordering::SeqCst);
        let token = RecordingToken::default();
        let report = TlsErrorReport {
            host: "example.com".to_owned(),
            error: TlsErrorKind::IdMismatch,
            identity: None,
        };

        fx.registry
            .report_tls_error(TabId(1), report, token.boxed())
            .unwrap_or_else(|error| panic!("{error}"));

        assert_eq!(token.calls(), vec![TokenCall::Cancel]);
        assert_eq!(
            fx.registry.state(TabId(1)).unwrap_or_else(|error| panic!("{error}")),
            Some(TrustState::Idle)
        );
        assert!(fx.sink.dismissed().is_empty());
    }

    /// Shows a prompt only after a superseding event has already landed on the
    /// same tab, as a slow UI thread would.
    #[derive(Default)]
    struct SupersedingSink {
        registry: OnceLock<Weak<TabRegistry>>,
        superseding: RecordingToken,
        fired: AtomicBool,
        presented: Mutex<Vec<DecisionId>>,
        visible: Mutex<BTreeSet<DecisionId>>,
    }

    impl PromptSink for SupersedingSink {
        fn present(&self, prompt: &PromptRequest) -> PromptDelivery {
            if let Ok(mut presented) = self.presented.lock() {
                presented.push(prompt.decision);
            }
            let registry = self.registry.get().and_then(Weak::upgrade);
            if let Some(registry) = registry.filter(|_| !self.fired.swap(true, Ordering::SeqCst)) {
                let report = TlsErrorReport {
                    host: "example.com".to_owned(),
                    error: TlsErrorKind::UntrustedIssuer,
                    identity: None,
                };
                registry
                    .report_tls_error(prompt.tab, report, self.superseding.boxed())
                    .unwrap_or_else(|error| panic!("{error}"));
            }
            if let Ok(mut visible) = self.visible.lock() {
                visible.insert(prompt.decision);
            }
            PromptDelivery::Shown
        }

        fn dismiss(&self, _tab: TabId, decision: DecisionId) {
            if let Ok(mut visible) = self.visible.lock() {
                visible.remove(&decision);
            }
        }
    }

    #[test]
    fn prompt_superseded_while_displaying_is_dismissed() {
        let store = Arc::new(InMemoryPinStore::default());
        pin_example(&store);
        let sink = Arc::new(SupersedingSink::default());
        let registry = Arc::new(TabRegistry::new(TrustPolicy::default(), store, sink.clone()));
        assert!(sink.registry.set(Arc::downgrade(&registry)).is_ok());
        registry
            .register_tab(TabId(1), Box::new(RecordingNavigator::default()))
            .unwrap_or_else(|error| panic!("{error}"));
        let first = RecordingToken::default();

        registry
            .navigation_committed(TabId(1), committed("evil.com"), first.boxed(), now())
            .unwrap_or_else(|error| panic!("{error}"));

        let presented = sink.presented.lock().map(|p| p.clone()).unwrap_or_default();
        let [pin_prompt, cert_prompt] = presented[..] else {
            panic!("expected two prompts, got {presented:?}");
        };
        let visible = sink.visible.lock().map(|v| v.clone()).unwrap_or_default();
        assert_eq!(visible, BTreeSet::from([cert_prompt]));
        assert_eq!(first.calls(), vec![TokenCall::Cancel]);
        assert!(sink.superseding.calls().is_empty());
        assert_eq!(
            registry.state(TabId(1)).unwrap_or_else(|error| panic!("{error}")),
            Some(TrustState::AwaitingCertificateDecision)
        );
        assert_eq!(
            registry.lookup_prompt(TabId(1), pin_prompt).unwrap_or_else(|error| panic!("{error}")),
            ResolveStatus::Stale
        );
        assert_eq!(
            registry.lookup_prompt(TabId(1), cert_prompt).unwrap_or_else(|error| panic!("{error}")),
            ResolveStatus::Applied
        );
    }

    #[test]
    fn save_and_restore_orphans_prompts_and_keeps_ids_unique() {
        let fx = fixture(true);
        pin_example(&fx.store);
        let token = RecordingToken::default();
        fx.registry
            .navigation_committed(TabId(1), committed("evil.example"), token.boxed(), now())
            .unwrap_or_else(|error| panic!("{error}"));
        let decision = fx.sink.last_decision();

        let saved = fx.registry.prepare_for_save().unwrap_or_else(|error| panic!("{error}"));
        assert_eq!(token.calls(), vec![TokenCall::Cancel]);
        assert_eq!(saved.interrupted.len(), 1);
        assert_eq!(saved.interrupted[0].decision, decision);
        assert_eq!(saved.interrupted[0].kind, DecisionKind::PinMismatch);
        assert!(saved.decision_high_water >= decision.0);

        let json = serde_json::to_string(&saved).unwrap_or_else(|error| panic!("{error}"));
        let saved: SavedTrustState = serde_json::from_str(&json).unwrap_or_else(|error| panic!("{error}"));

        // A fresh process sharing the same pin store.
        let sink = Arc::new(RecordingSink::default());
        let restored = TabRegistry::new(TrustPolicy::default(), fx.store.clone(), sink.clone());
        restored
            .register_tab(TabId(1), Box::new(RecordingNavigator::default()))
            .unwrap_or_else(|error| panic!("{error}"));
        let orphans = restored.restore(&saved);

        assert_eq!(orphans, saved.interrupted);
        assert_eq!(
            restored.lookup_prompt(TabId(1), decision).unwrap_or_else(|error| panic!("{error}")),
            ResolveStatus::Stale
        );
        assert_eq!(
            restored
                .resolve(TabId(1), decision, Resolution::Pin(PinResolution::UpdatePin))
                .unwrap_or_else(|error| panic!("{error}")),
            ResolveStatus::Stale
        );

        let retry = RecordingToken::default();
        restored
            .navigation_committed(TabId(1), committed("evil.example"), retry.boxed(), now())
            .unwrap_or_else(|error| panic!("{error}"));
        let reprompt = sink.last_decision();
        assert!(reprompt.0 > saved.decision_high_water);
        assert_eq!(
            restored.state(TabId(1)).unwrap_or_else(|error| panic!("{error}")),
            Some(TrustState::AwaitingPinDecision)
        );
        assert!(retry.calls().is_empty());
    }

    #[test]
    fn restore_never_lowers_the_decision_counter() {
        let fx = fixture(true);
        for _ in 0..3 {
            let token = RecordingToken::default();
            let report = TlsErrorReport {
                host: "example.com".to_owned(),
                error: TlsErrorKind::Invalid,
                identity: None,
            };
            fx.registry
                .report_tls_error(TabId(1), report, token.boxed())
                .unwrap_or_else(|error| panic!("{error}"));
        }
        let before = fx.sink.last_decision();

        fx.registry.restore(&SavedTrustState::default());

        let token = RecordingToken::default();
        let report = TlsErrorReport {
            host: "example.com".to_owned(),
            error: TlsErrorKind::Invalid,
            identity: None,
        };
        fx.registry
            .report_tls_error(TabId(1), report, token.boxed())
            .unwrap_or_else(|error| panic!("{error}"));
        assert!(fx.sink.last_decision() > before);
    }

    /// Token whose completion re-enters the registry for the same tab.
    struct ReentrantToken {
        registry: Arc<TabRegistry>,
        observed: Arc<Mutex<Option<TrustState>>>,
    }

    impl DecisionToken for ReentrantToken {
        fn complete(self: Box<Self>, _outcome: DecisionOutcome) {
            let state = self.registry.state(TabId(1)).ok().flatten();
            if let Ok(mut observed) = self.observed.lock() {
                *observed = state;
            }
        }

        fn cancel(self: Box<Self>) {}
    }

    #[test]
    fn tokens_fire_after_the_tab_lock_is_released() {
        let fx = fixture(true);
        let observed = Arc::new(Mutex::new(None));
        let token = Box::new(ReentrantToken {
            registry: fx.registry.clone(),
            observed: observed.clone(),
        });

        fx.registry
            .navigation_committed(TabId(1), committed("example.com"), token, now())
            .unwrap_or_else(|error| panic!("{error}"));

        assert_eq!(
            *observed.lock().unwrap_or_else(|error| panic!("{error}")),
            Some(TrustState::Idle)
        );
    }

    #[test]
    fn tabs_are_driven_from_many_threads() {
        let store = Arc::new(InMemoryPinStore::default());
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(TabRegistry::new(TrustPolicy::default(), store, sink));
        for tab in 1..=8 {
            registry
                .register_tab(TabId(tab), Box::new(RecordingNavigator::default()))
                .unwrap_or_else(|error| panic!("{error}"));
        }

        let tokens: Vec<RecordingToken> = (1..=8).map(|_| RecordingToken::default()).collect();
        std::thread::scope(|scope| {
            for (index, token) in tokens.iter().enumerate() {
                let registry = registry.clone();
                scope.spawn(move || {
                    let tab = TabId(index as u64 + 1);
                    let navigation = CommittedNavigation {
                        host: format!("site{index}.example"),
                        domain: Some(DomainKey::new(&format!("site{index}.example"))),
                        identity: Ok(cert(&format!("site{index}.example"))),
                    };
                    registry
                        .navigation_committed(tab, navigation, token.boxed(), now())
                        .unwrap_or_else(|error| panic!("{error}"));
                });
            }
        });

        for token in &tokens {
            assert_eq!(token.calls(), vec![TokenCall::Complete(DecisionOutcome::Proceed)]);
        }
    }
}
