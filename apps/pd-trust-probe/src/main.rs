use chrono::Utc;
use pd_browser::Browser;
use pd_browser::BrowserConfig;
use pd_browser::logging;
use pd_browser::logging::LogSettings;
use pd_core::BrowserResult;
use pd_net::BrowserUrl;
use pd_net::CertificateInspector;
use pd_net::PlatformEvent;
use pd_net::SystemIpResolver;
use pd_net::TcpTransport;
use pd_net::TrustStoreMode;
use pd_net::probe_identity;
use pd_trust::CertificateResolution;
use pd_trust::DecisionId;
use pd_trust::DecisionOutcome;
use pd_trust::DecisionToken;
use pd_trust::PinResolution;
use pd_trust::PromptDelivery;
use pd_trust::PromptDetail;
use pd_trust::PromptRequest;
use pd_trust::PromptSink;
use pd_trust::Resolution;
use pd_trust::TabId;
use pd_trust::TabNavigator;
use pd_trust::TrustState;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

const PROBE_TAB: TabId = TabId(1);
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const USAGE: &str = "usage: pd-trust-probe <https-url> [--update-pin] [--forget-pin] [--os-roots] [--timeout-secs N]";

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProbeArgs {
    url: String,
    update_pin: bool,
    forget_pin: bool,
    trust_store: TrustStoreMode,
    timeout: Duration,
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}\n{USAGE}");
            return ExitCode::from(64);
        }
    };

    let logged = LogSettings::from_env().and_then(logging::init);
    if let Err(error) = logged {
        eprintln!("pd-trust-probe: {error}");
        return ExitCode::from(78);
    }

    match run(&args) {
        Ok(Verdict::Allowed) => ExitCode::SUCCESS,
        Ok(Verdict::Blocked) => ExitCode::from(2),
        Err(error) => {
            tracing::error!(%error, "probe failed");
            eprintln!("pd-trust-probe: {error}");
            ExitCode::FAILURE
        }
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<ProbeArgs, String> {
    let mut url = None;
    let mut update_pin = false;
    let mut forget_pin = false;
    let mut trust_store = TrustStoreMode::WebPkiOnly;
    let mut timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--update-pin" => update_pin = true,
            "--forget-pin" => forget_pin = true,
            "--os-roots" => trust_store = TrustStoreMode::WebPkiAndOs,
            "--timeout-secs" => {
                let raw = args
                    .next()
                    .ok_or_else(|| "missing value after --timeout-secs".to_owned())?;
                let seconds = raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --timeout-secs value `{raw}`"))?;
                timeout = Duration::from_secs(seconds.max(1));
            }
            flag if flag.starts_with("--") => return Err(format!("unknown flag `{flag}`")),
            _ if url.is_some() => return Err(format!("unexpected argument `{arg}`")),
            _ => url = Some(arg),
        }
    }

    if update_pin && forget_pin {
        return Err("--update-pin and --forget-pin are mutually exclusive".to_owned());
    }

    Ok(ProbeArgs {
        url: url.ok_or_else(|| "missing URL".to_owned())?,
        update_pin,
        forget_pin,
        trust_store,
        timeout,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Allowed,
    Blocked,
}

fn run(args: &ProbeArgs) -> BrowserResult<Verdict> {
    let url = BrowserUrl::parse(&args.url)?;
    let domain = url.settings_domain();
    let prompts = Arc::new(ConsolePrompts::default());
    let browser = Browser::with_config(BrowserConfig::from_env()?, prompts.clone())?;
    let registry = browser.registry();
    registry.register_tab(PROBE_TAB, Box::new(ConsoleNavigator))?;

    if args.forget_pin {
        browser.forget_pin(&domain)?;
        println!("forgot pin for {domain}");
    }

    let inspector = CertificateInspector::new(args.trust_store)?;
    let inspection = probe_identity(
        &url,
        &inspector,
        &SystemIpResolver,
        &TcpTransport,
        args.timeout,
    )?;

    let outcome = OutcomeSlot::default();
    match inspection.into_event(url.host(), Some(domain)) {
        PlatformEvent::TlsError(report) => {
            registry.report_tls_error(PROBE_TAB, report, outcome.token())?;
        }
        PlatformEvent::Committed(navigation) => {
            registry.navigation_committed(PROBE_TAB, navigation, outcome.token(), Utc::now())?;
        }
    }

    // Non-interactive answers for whatever prompt is still open.
    if let Some(open) = prompts.take_last() {
        let resolution = match registry.state(PROBE_TAB)? {
            Some(TrustState::AwaitingPinDecision) if args.update_pin => {
                Some(Resolution::Pin(PinResolution::UpdatePin))
            }
            Some(TrustState::AwaitingPinDecision) => Some(Resolution::Pin(PinResolution::GoBack)),
            Some(TrustState::AwaitingCertificateDecision) => {
                Some(Resolution::Certificate(CertificateResolution::Cancel))
            }
            _ => None,
        };
        if let Some(resolution) = resolution {
            registry.resolve(PROBE_TAB, open, resolution)?;
        }
    }

    registry.destroy_tab(PROBE_TAB)?;
    let verdict = outcome.verdict();
    println!(
        "{}: {}",
        url.host(),
        match verdict {
            Verdict::Allowed => "allowed",
            Verdict::Blocked => "blocked",
        }
    );
    Ok(verdict)
}

/// Prints prompts instead of rendering them.
#[derive(Default)]
struct ConsolePrompts {
    last: Mutex<Option<DecisionId>>,
}

impl ConsolePrompts {
    fn take_last(&self) -> Option<DecisionId> {
        self.last.lock().ok().and_then(|mut last| last.take())
    }
}

impl PromptSink for ConsolePrompts {
    fn present(&self, prompt: &PromptRequest) -> PromptDelivery {
        match &prompt.detail {
            PromptDetail::Certificate { host, error, .. } => {
                println!("certificate error for {host}: {error}");
            }
            PromptDetail::HttpAuth { host, realm } => {
                println!("{host} asks for credentials (realm `{realm}`)");
            }
            PromptDetail::PinMismatch {
                host,
                verdict,
                pinned,
                live,
                ..
            } => {
                println!("pin mismatch for {host}: {}", verdict.as_str());
                if let Some(pinned) = &pinned.pinned_identity {
                    println!(
                        "  pinned: CN={} issuer={} valid {}..{}",
                        pinned.issued_to.common_name,
                        pinned.issued_by.common_name,
                        pinned.valid_from,
                        pinned.valid_to
                    );
                }
                println!(
                    "  live:   CN={} issuer={} valid {}..{}",
                    live.issued_to.common_name,
                    live.issued_by.common_name,
                    live.valid_from,
                    live.valid_to
                );
            }
        }
        if let Ok(mut last) = self.last.lock() {
            *last = Some(prompt.decision);
        }
        PromptDelivery::Shown
    }

    fn dismiss(&self, _tab: TabId, decision: DecisionId) {
        if let Ok(mut last) = self.last.lock() {
            if *last == Some(decision) {
                *last = None;
            }
        }
        println!("prompt {decision} dismissed");
    }
}

struct ConsoleNavigator;

impl TabNavigator for ConsoleNavigator {
    fn can_go_back(&self) -> bool {
        false
    }

    fn go_back(&mut self) {}

    fn load_blank(&mut self) {
        println!("navigation replaced with about:blank");
    }
}

#[derive(Clone, Default)]
struct OutcomeSlot(Arc<Mutex<Option<DecisionOutcome>>>);

impl OutcomeSlot {
    fn token(&self) -> Box<dyn DecisionToken> {
        Box::new(self.clone())
    }

    fn verdict(&self) -> Verdict {
        match self.0.lock().ok().and_then(|slot| slot.clone()) {
            Some(DecisionOutcome::Proceed | DecisionOutcome::ProceedWithCredentials(_)) => {
                Verdict::Allowed
            }
            _ => Verdict::Blocked,
        }
    }
}

impl DecisionToken for OutcomeSlot {
    fn complete(self: Box<Self>, outcome: DecisionOutcome) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(outcome);
        }
    }

    fn cancel(self: Box<Self>) {}
}
