use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use imei_relay::config::{RelayConfig, Secret};
use imei_relay::normalize::Normalizer;
use imei_relay::reference::ReferenceTable;
use imei_relay::registry::{PresetThenPrompt, PromptToken, SecondFactorToken, TokenProvider};
use imei_relay::shutdown::ShutdownCoordinator;
use imei_relay::telemetry::init_telemetry;
use imei_relay::types::Credentials;
use imei_relay::workflow::{
    OrchestratorSettings, RunMode, RunReport, StateJournal, TerminalOutcome, WorkflowState,
};

#[derive(Parser)]
#[command(name = "imei-relay", version)]
#[command(about = "Relay pending IMEI registrations from the intake portal into the device registry")]
#[command(long_about = "Reads every pending request from the intake portal, normalizes brand, model \
                       and country against the reference dataset, registers the device in the \
                       second-factor protected registry and confirms the request back in the intake \
                       portal once the registry shows it.")]
struct Cli {
    /// Registry second-factor token; prompted for when absent
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Configuration file layered over imei-relay.toml
    #[arg(long, value_name = "FILE", env = "IMEI_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Reference dataset of valid brand/model/country combinations
    #[arg(long, value_name = "CSV")]
    reference: Option<PathBuf>,

    /// JSON journal used to resume interrupted runs
    #[arg(long, value_name = "JSON")]
    state_file: Option<PathBuf>,

    /// Write the normalized batch to this CSV file
    #[arg(long, value_name = "CSV")]
    export: Option<PathBuf>,

    /// Extract and normalize only; never touch the registry
    #[arg(long)]
    dry_run: bool,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn mode(&self) -> RunMode {
        if self.dry_run {
            RunMode::ExtractOnly
        } else {
            RunMode::Full
        }
    }

    /// Command-line flags win over every configuration source
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(token) = &self.token {
            config.registry.second_factor_token = Some(Secret::new(token.clone()));
        }
        if let Some(path) = &self.reference {
            config.reference.path = path.clone();
        }
        if let Some(path) = &self.state_file {
            config.workflow.state_file = Some(path.clone());
        }
        if let Some(path) = &self.export {
            config.workflow.export_path = Some(path.clone());
        }
        if self.headed {
            config.browser.headless = false;
        }
        if self.json_logs {
            config.observability.json_logs = true;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("imei-relay: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    RelayConfig::load_env_file()?;
    let mut config = RelayConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    init_telemetry(&config.observability.log_level, config.observability.json_logs)?;

    let mode = cli.mode();
    config.validate(mode)?;

    let table = ReferenceTable::from_path(&config.reference.path)?;
    let normalizer = Normalizer::new(Arc::new(table));

    let preset = config
        .registry
        .second_factor_token
        .as_ref()
        .map(|token| SecondFactorToken::new(token.expose()))
        .transpose()?;
    let tokens: Arc<dyn TokenProvider> =
        Arc::new(PresetThenPrompt::new(preset, PromptToken::default()));

    let settings = OrchestratorSettings {
        intake_credentials: config.intake_credentials()?,
        registry_credentials: match mode {
            RunMode::Full => config.registry_credentials()?,
            RunMode::ExtractOnly => Credentials::new("", ""),
        },
        retry: config.workflow.policy(),
        mode,
        max_token_attempts: config.registry.max_token_attempts,
        max_logins: config.registry.max_logins,
    };

    let journal = config.workflow.state_file.clone().map(StateJournal::new);
    let state = match &journal {
        Some(journal) => journal.load().await?,
        None => WorkflowState::default(),
    };

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers()?;

    let report = relay(&config, normalizer, tokens, settings, journal, &shutdown, state).await?;

    if let Some(path) = &config.workflow.export_path {
        if let Err(e) = imei_relay::export::write_normalized_csv(path, report.normalized_records()) {
            warn!(path = %path.display(), error = %e, "Could not export normalized batch");
        }
    }

    print_summary(&report);
    Ok(report.exit_code())
}

#[cfg(feature = "chromium")]
async fn relay(
    config: &RelayConfig,
    normalizer: Normalizer,
    tokens: Arc<dyn TokenProvider>,
    settings: OrchestratorSettings,
    journal: Option<StateJournal>,
    shutdown: &ShutdownCoordinator,
    state: WorkflowState,
) -> Result<RunReport> {
    use imei_relay::browser::chromium::ChromiumBrowser;
    use imei_relay::intake::IntakeClient;
    use imei_relay::registry::RegistryClient;
    use imei_relay::workflow::WorkflowOrchestrator;

    let timeouts = config.browser.timeouts();
    let browser = ChromiumBrowser::launch(&config.browser).await?;

    let intake = IntakeClient::new(
        browser.open_session().await?,
        &config.intake.base_url,
        config.intake.selectors.clone(),
        timeouts,
    )
    .with_default_country(config.intake.default_country.clone());
    let registry = RegistryClient::new(
        browser.open_session().await?,
        &config.registry.login_url,
        config.registry.selectors.clone(),
        config.registry.form.clone(),
        timeouts,
    );

    let mut orchestrator = WorkflowOrchestrator::new(intake, registry, normalizer, tokens, settings)
        .with_shutdown(shutdown.subscribe());
    if let Some(journal) = journal {
        orchestrator = orchestrator.with_journal(journal);
    }

    let report = orchestrator.run(state).await;
    drop(orchestrator);
    browser.close().await;
    tracing::info!(run_id = %report.run_id, "Browser closed");
    Ok(report)
}

#[cfg(not(feature = "chromium"))]
async fn relay(
    _config: &RelayConfig,
    _normalizer: Normalizer,
    _tokens: Arc<dyn TokenProvider>,
    _settings: OrchestratorSettings,
    _journal: Option<StateJournal>,
    _shutdown: &ShutdownCoordinator,
    _state: WorkflowState,
) -> Result<RunReport> {
    anyhow::bail!("imei-relay was built without the `chromium` feature; no browser backend is available")
}

fn print_summary(report: &RunReport) {
    println!();
    println!("Run {} ({:?})", report.run_id, report.mode);
    for request in report.requests() {
        let verdict = match &request.outcome {
            Some(TerminalOutcome::Rejected(rejection)) => {
                format!("rejected [{}] {}", rejection.code(), rejection)
            }
            Some(TerminalOutcome::Failed { step, error, attempts }) => {
                format!("failed during {} after {} attempt(s): {}", step, attempts, error)
            }
            None if request.is_confirmed() => "confirmed".to_string(),
            None => "pending".to_string(),
        };
        println!("  {:>10}  {:<10}  {}", request.request_id, request.stage, verdict);
    }
    println!(
        "{} request(s): {} confirmed, {} rejected, {} failed",
        report.processed.len(),
        report.confirmed(),
        report.rejected(),
        report.failed()
    );
    if let Some(err) = &report.aborted {
        println!("Run aborted: {}", err);
    }
}
