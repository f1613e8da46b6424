//! Per-domain TLS trust engine.
//!
//! Decides whether a navigation's live certificate and resolved addresses may
//! be trusted, reconciles them with the domain's pinned baseline, and drives
//! the exactly-once resolution of blocking platform callbacks across user
//! prompts, tab teardown and process restarts.

pub mod controller;
pub mod detector;
pub mod identity;
pub mod pending;
pub mod pin;
pub mod prompt;
pub mod registry;
pub mod wildcard;

pub use controller::AuthChallenge;
pub use controller::CommittedNavigation;
pub use controller::TlsErrorReport;
pub use controller::TrustDecisionController;
pub use controller::TrustState;
pub use detector::MismatchReason;
pub use detector::MismatchVerdict;
pub use detector::TlsErrorKind;
pub use identity::DistinguishedName;
pub use identity::IdentitySnapshot;
pub use pending::Credentials;
pub use pending::DecisionId;
pub use pending::DecisionKind;
pub use pending::DecisionOutcome;
pub use pending::DecisionToken;
pub use pending::PendingDecision;
pub use pin::DomainKey;
pub use pin::DomainPin;
pub use pin::InMemoryPinStore;
pub use pin::PinStore;
pub use prompt::AuthResolution;
pub use prompt::CertificateResolution;
pub use prompt::PinResolution;
pub use prompt::PromptDelivery;
pub use prompt::PromptDetail;
pub use prompt::PromptRequest;
pub use prompt::PromptSink;
pub use prompt::Resolution;
pub use prompt::ResolveStatus;
pub use prompt::TabId;
pub use prompt::TabNavigator;
pub use registry::InterruptedPrompt;
pub use registry::SavedTrustState;
pub use registry::TabRegistry;
