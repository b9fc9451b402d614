// Orchestration scenarios against the in-memory portals

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::watch;

use super::mocks::{FakeIntake, FakeRegistry, ALWAYS};
use super::*;
use crate::normalize::{Normalizer, Rejection};
use crate::reference::ReferenceTable;
use crate::registry::token::MockTokenProvider;
use crate::registry::{SecondFactorToken, StaticToken, TokenError, TokenProvider};
use crate::types::{ConfirmationOutcome, Credentials, PendingRequest};

const DATASET: &str = "\
brand,model,country,brand_aliases,model_aliases,country_aliases
Apple,iPhone 11,Peru,APPLE INC,A2221,PE|PER
Samsung,Galaxy S23,Chile,,S23|SM-S911B,CL
";

const IMEI_A: &str = "490154203237518";
const IMEI_B: &str = "356938035643809";
const IMEI_C: &str = "352099001761481";
const TOKEN: &str = "123456";

fn normalizer() -> Normalizer {
    Normalizer::new(Arc::new(ReferenceTable::from_reader(DATASET.as_bytes()).unwrap()))
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings::new(
        Credentials::new("operador", "intake-pw"),
        Credentials::new("admin", "registry-pw"),
    )
}

fn good(id: &str, imei: &str) -> PendingRequest {
    PendingRequest::new(id, "apple", "IPHONE 11", "PE", imei)
}

fn intake_with(requests: Vec<PendingRequest>) -> FakeIntake {
    requests
        .into_iter()
        .fold(FakeIntake::new("intake-pw"), FakeIntake::with_request)
}

fn registry() -> FakeRegistry {
    FakeRegistry::new("registry-pw", TOKEN)
}

fn static_token() -> Arc<dyn TokenProvider> {
    Arc::new(StaticToken::new(SecondFactorToken::new(TOKEN).unwrap()))
}

/// A provider that fails the test if a token is ever requested
fn no_token_expected() -> Arc<dyn TokenProvider> {
    let mut provider = MockTokenProvider::new();
    provider.expect_token().never();
    Arc::new(provider)
}

fn orchestrator(
    intake: FakeIntake,
    registry: FakeRegistry,
    tokens: Arc<dyn TokenProvider>,
    settings: OrchestratorSettings,
) -> WorkflowOrchestrator<FakeIntake, FakeRegistry> {
    WorkflowOrchestrator::new(intake, registry, normalizer(), tokens, settings)
}

#[tokio::test]
async fn test_batch_with_one_bad_request() {
    let intake = intake_with(vec![
        good("101", IMEI_A),
        PendingRequest::new("102", "Nokia", "3310", "PE", IMEI_B),
        PendingRequest::new("103", "Samsung", "SM-S911B", "cl", IMEI_C),
    ]);
    let mut relay = orchestrator(intake, registry(), static_token(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.aborted, None);
    assert_eq!(report.processed, vec!["101", "102", "103"]);
    assert_eq!(report.confirmed(), 2);
    assert_eq!(report.rejected(), 1);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.exit_code(), 0);

    let rejected = report.state.get("102").unwrap();
    assert_eq!(rejected.stage, Stage::Extracted);
    assert!(matches!(
        rejected.outcome,
        Some(TerminalOutcome::Rejected(Rejection::UnknownBrand { .. }))
    ));
    assert_eq!(rejected.record, None);

    let confirmed = report.state.get("103").unwrap();
    assert_eq!(confirmed.record.as_ref().unwrap().canonical_model, "Galaxy S23");
    assert_eq!(confirmed.record.as_ref().unwrap().canonical_country, "Chile");
    assert!(confirmed.submission.as_ref().unwrap().accepted);

    let (intake, registry) = relay.into_parts();
    assert!(intake.is_confirmed("101"));
    assert!(!intake.is_confirmed("102"));
    assert!(intake.is_confirmed("103"));
    assert_eq!(registry.submissions.len(), 2);
    assert_eq!(registry.tokens_seen, vec![TOKEN]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_submission_fails_only_that_request() {
    let intake = intake_with(vec![good("201", IMEI_A), good("202", IMEI_B)]);
    let mut registry = registry();
    registry.fail_submit("201", ALWAYS);
    let mut relay = orchestrator(intake, registry, static_token(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.aborted, None);
    assert_eq!(report.exit_code(), 1);

    let failed = report.state.get("201").unwrap();
    assert_eq!(failed.stage, Stage::Normalized);
    assert!(matches!(
        failed.outcome,
        Some(TerminalOutcome::Failed { step: Step::Submit, attempts: 3, .. })
    ));
    assert!(report.state.get("202").unwrap().is_confirmed());

    let (intake, registry) = relay.into_parts();
    assert!(!intake.is_confirmed("201"));
    assert_eq!(registry.reference_for(IMEI_A), None);
}

#[tokio::test(start_paused = true)]
async fn test_transient_submission_recovers_within_budget() {
    let intake = intake_with(vec![good("211", IMEI_A)]);
    let mut registry = registry();
    registry.fail_submit("211", 2);
    let mut relay = orchestrator(intake, registry, static_token(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.confirmed(), 1);
    assert_eq!(relay.registry().submit_calls, 3);
    assert_eq!(relay.registry().submissions.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_request_is_retried_on_next_run() {
    let intake = intake_with(vec![good("221", IMEI_A)]);
    let mut registry = registry();
    registry.fail_submit("221", ALWAYS);
    let mut relay = orchestrator(intake, registry, static_token(), settings());
    let first = relay.run(WorkflowState::new()).await;
    assert_eq!(first.failed(), 1);

    let (intake, mut registry) = relay.into_parts();
    registry.clear_failures();
    let mut relay = orchestrator(intake, registry, static_token(), settings());
    let second = relay.run(first.state).await;

    assert_eq!(second.exit_code(), 0);
    assert!(second.state.get("221").unwrap().is_confirmed());
    // extraction is not repeated
    assert_eq!(relay.intake().extract_calls, vec!["221"]);
}

#[tokio::test(start_paused = true)]
async fn test_transient_extraction_recovers_within_budget() {
    let mut intake = intake_with(vec![good("231", IMEI_A)]);
    intake.fail_extract("231", 2);
    let mut relay = orchestrator(intake, registry(), static_token(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert!(report.state.get("231").unwrap().is_confirmed());
    assert_eq!(relay.intake().extract_calls, vec!["231", "231", "231"]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_extraction_fails_only_that_request() {
    let mut intake = intake_with(vec![good("241", IMEI_A), good("242", IMEI_B)]);
    intake.fail_extract("241", ALWAYS);
    let mut relay = orchestrator(intake, registry(), static_token(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.aborted, None);
    assert_eq!(report.exit_code(), 1);
    let failed = report.state.get("241").unwrap();
    assert_eq!(failed.stage, Stage::Listed);
    assert_eq!(failed.request, None);
    assert!(matches!(
        failed.outcome,
        Some(TerminalOutcome::Failed { step: Step::Extract, attempts: 3, .. })
    ));
    assert!(report.state.get("242").unwrap().is_confirmed());
    assert_eq!(relay.registry().submissions.len(), 1);
}

#[tokio::test]
async fn test_normalization_problems_are_reported_as_such() {
    let mut damaged = RequestState::listed("251");
    damaged.stage = Stage::Extracted;
    let mut state = WorkflowState::new();
    state.put(damaged);

    let intake = intake_with(vec![good("251", IMEI_A)]);
    let mut relay = orchestrator(intake, registry(), no_token_expected(), settings());

    let report = relay.run(state).await;

    let request = report.state.get("251").unwrap();
    assert_eq!(request.stage, Stage::Extracted);
    assert!(matches!(
        request.outcome,
        Some(TerminalOutcome::Failed { step: Step::Normalize, .. })
    ));
    assert!(relay.intake().extract_calls.is_empty());
}

#[tokio::test]
async fn test_empty_queue_never_asks_for_a_token() {
    let mut relay = orchestrator(intake_with(vec![]), registry(), no_token_expected(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert!(report.processed.is_empty());
    assert_eq!(relay.registry().logins, 0);
}

#[tokio::test]
async fn test_all_rejected_never_asks_for_a_token() {
    let intake = intake_with(vec![
        PendingRequest::new("301", "Apple", "iPhone 11", "Narnia", IMEI_A),
        PendingRequest::new("302", "Apple", "iPhone 11", "PE", "12345"),
    ]);
    let mut relay = orchestrator(intake, registry(), no_token_expected(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.rejected(), 2);
    assert_eq!(report.exit_code(), 0);
    assert!(matches!(
        report.state.get("302").unwrap().outcome,
        Some(TerminalOutcome::Rejected(Rejection::InvalidImeiFormat { .. }))
    ));
    assert_eq!(relay.registry().logins, 0);
}

#[tokio::test]
async fn test_extract_only_leaves_registry_untouched() {
    let intake = intake_with(vec![good("401", IMEI_A), good("402", IMEI_B)]);
    let mut dry_run = settings();
    dry_run.mode = RunMode::ExtractOnly;
    let mut relay = orchestrator(intake, registry(), no_token_expected(), dry_run);

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.normalized_records().len(), 2);
    assert_eq!(report.state.count_at(Stage::Normalized), 2);
    assert_eq!(relay.registry().logins, 0);
    assert_eq!(relay.intake().confirmed_count(), 0);
}

#[tokio::test]
async fn test_intake_login_failure_aborts() {
    let intake = FakeIntake::new("other-password").with_request(good("501", IMEI_A));
    let mut relay = orchestrator(intake, registry(), no_token_expected(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert!(matches!(report.aborted, Some(WorkflowError::IntakeAuth(_))));
    assert_eq!(report.exit_code(), 2);
    // credentials errors are not retried
    assert_eq!(relay.intake().logins, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_queue_aborts() {
    let mut intake = intake_with(vec![good("511", IMEI_A)]);
    intake.make_queue_unavailable();
    let mut relay = orchestrator(intake, registry(), no_token_expected(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert!(matches!(report.aborted, Some(WorkflowError::QueueUnavailable(_))));
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn test_registry_login_failure_keeps_normalized_work() {
    let intake = intake_with(vec![good("521", IMEI_A)]);
    let registry = FakeRegistry::new("changed", TOKEN);
    let mut relay = orchestrator(intake, registry, no_token_expected(), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert!(matches!(report.aborted, Some(WorkflowError::RegistryAuth(_))));
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.state.get("521").unwrap().stage, Stage::Normalized);
}

#[tokio::test]
async fn test_rejected_token_asks_again() {
    let mut provider = MockTokenProvider::new();
    provider
        .expect_token()
        .times(2)
        .returning(|attempt| match attempt {
            1 => SecondFactorToken::new("999999"),
            _ => SecondFactorToken::new(TOKEN),
        });
    let intake = intake_with(vec![good("601", IMEI_A)]);
    let mut relay = orchestrator(intake, registry(), Arc::new(provider), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.confirmed(), 1);
    assert_eq!(relay.registry().logins, 1);
    assert_eq!(relay.registry().tokens_seen, vec!["999999", TOKEN]);
}

#[tokio::test]
async fn test_expired_token_logs_in_again() {
    let mut provider = MockTokenProvider::new();
    provider
        .expect_token()
        .times(2)
        .returning(|attempt| match attempt {
            1 => SecondFactorToken::new("000000"),
            _ => SecondFactorToken::new(TOKEN),
        });
    let mut registry = registry();
    registry.expire_token("000000");
    let intake = intake_with(vec![good("611", IMEI_A)]);
    let mut relay = orchestrator(intake, registry, Arc::new(provider), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.confirmed(), 1);
    assert_eq!(relay.registry().logins, 2);
}

#[tokio::test]
async fn test_second_factor_gives_up() {
    let mut provider = MockTokenProvider::new();
    provider
        .expect_token()
        .times(3)
        .returning(|_| SecondFactorToken::new("999999"));
    let intake = intake_with(vec![good("621", IMEI_A)]);
    let mut relay = orchestrator(intake, registry(), Arc::new(provider), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(
        report.aborted,
        Some(WorkflowError::SecondFactorExhausted { attempts: 3, logins: 1 })
    );
    assert_eq!(report.exit_code(), 2);
    assert_eq!(relay.intake().confirmed_count(), 0);
}

#[tokio::test]
async fn test_missing_token_aborts() {
    let mut provider = MockTokenProvider::new();
    provider
        .expect_token()
        .returning(|_| Err(TokenError::Unavailable));
    let intake = intake_with(vec![good("631", IMEI_A)]);
    let mut relay = orchestrator(intake, registry(), Arc::new(provider), settings());

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(
        report.aborted,
        Some(WorkflowError::TokenUnavailable(TokenError::Unavailable))
    );
}

#[tokio::test]
async fn test_already_registered_device_counts_as_submitted() {
    let mut registry = registry();
    registry.preregister(IMEI_A, "OABI-7");
    let intake = intake_with(vec![good("701", IMEI_A)]);
    let mut relay = orchestrator(intake, registry, static_token(), settings());

    let report = relay.run(WorkflowState::new()).await;

    let state = report.state.get("701").unwrap();
    assert!(state.is_confirmed());
    assert_eq!(
        state.submission.as_ref().unwrap().portal_b_reference.as_deref(),
        Some("OABI-7")
    );
    assert!(relay.registry().submissions.is_empty());
}

#[tokio::test]
async fn test_resumed_submitted_request_is_only_confirmed() {
    let mut registry = registry();
    registry.preregister(IMEI_A, "OABI-8");

    let mut earlier = RequestState::listed("801");
    earlier.extracted(good("801", IMEI_A)).unwrap();
    earlier.normalized(normalizer().normalize(&good("801", IMEI_A)).unwrap()).unwrap();
    earlier
        .submitted(crate::types::SubmissionResult::accepted("801", IMEI_A, "OABI-8"))
        .unwrap();
    let mut state = WorkflowState::new();
    state.put(earlier);

    let intake = intake_with(vec![good("801", IMEI_A)]);
    let mut relay = orchestrator(intake, registry, static_token(), settings());

    let report = relay.run(state).await;

    let resumed = report.state.get("801").unwrap();
    assert_eq!(resumed.confirmation, Some(ConfirmationOutcome::Confirmed));
    assert!(relay.intake().extract_calls.is_empty());
    assert_eq!(relay.registry().submit_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_submitted_request_missing_from_registry_is_not_confirmed() {
    let mut earlier = RequestState::listed("811");
    earlier.extracted(good("811", IMEI_A)).unwrap();
    earlier.normalized(normalizer().normalize(&good("811", IMEI_A)).unwrap()).unwrap();
    earlier
        .submitted(crate::types::SubmissionResult::accepted("811", IMEI_A, "OABI-9"))
        .unwrap();
    let mut state = WorkflowState::new();
    state.put(earlier);

    let intake = intake_with(vec![good("811", IMEI_A)]);
    let mut relay = orchestrator(intake, registry(), static_token(), settings());

    let report = relay.run(state).await;

    let request = report.state.get("811").unwrap();
    assert_eq!(request.stage, Stage::Normalized);
    assert!(matches!(
        request.outcome,
        Some(TerminalOutcome::Failed { step: Step::Verify, attempts: 3, .. })
    ));
    assert!(relay.intake().confirm_calls.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lagging_registry_listing_is_not_submitted_twice() {
    let intake = intake_with(vec![good("831", IMEI_A)]);
    let mut registry = registry();
    registry.lag_lookups(IMEI_A, 2);
    let mut relay = orchestrator(intake, registry, static_token(), settings());

    let report = relay.run(WorkflowState::new()).await;

    let request = report.state.get("831").unwrap();
    assert!(request.is_confirmed());
    assert_eq!(
        request.submission.as_ref().unwrap().portal_b_reference.as_deref(),
        Some("OABI-101")
    );
    assert_eq!(relay.registry().submit_calls, 1);
    assert_eq!(relay.registry().submissions.len(), 1);
    assert!(relay.intake().is_confirmed("831"));
}

#[tokio::test(start_paused = true)]
async fn test_listing_that_never_catches_up_is_resolved_next_run() {
    let intake = intake_with(vec![good("841", IMEI_A)]);
    let mut registry = registry();
    registry.lag_lookups(IMEI_A, ALWAYS);
    let mut relay = orchestrator(intake, registry, static_token(), settings());

    let first = relay.run(WorkflowState::new()).await;

    let request = first.state.get("841").unwrap();
    assert_eq!(request.stage, Stage::Normalized);
    assert!(matches!(
        request.outcome,
        Some(TerminalOutcome::Failed { step: Step::Verify, .. })
    ));
    assert_eq!(relay.registry().submit_calls, 1);
    assert!(relay.intake().confirm_calls.is_empty());

    let (intake, mut registry) = relay.into_parts();
    registry.clear_failures();
    let mut relay = orchestrator(intake, registry, static_token(), settings());
    let second = relay.run(first.state).await;

    assert!(second.state.get("841").unwrap().is_confirmed());
    assert_eq!(relay.registry().submissions.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_confirmation_keeps_submitted_stage() {
    let mut intake = intake_with(vec![good("821", IMEI_A)]);
    intake.fail_confirm("821", ALWAYS);
    let mut relay = orchestrator(intake, registry(), static_token(), settings());

    let report = relay.run(WorkflowState::new()).await;

    let request = report.state.get("821").unwrap();
    assert_eq!(request.stage, Stage::Submitted);
    assert!(matches!(
        request.outcome,
        Some(TerminalOutcome::Failed { step: Step::Confirm, .. })
    ));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let intake = intake_with(vec![good("901", IMEI_A)]);
    let mut relay =
        orchestrator(intake, registry(), no_token_expected(), settings()).with_shutdown(rx);

    let report = relay.run(WorkflowState::new()).await;

    assert_eq!(report.aborted, Some(WorkflowError::Cancelled));
    assert_eq!(report.exit_code(), 130);
    assert_eq!(relay.intake().logins, 0);
}

#[tokio::test]
async fn test_journal_holds_final_state() {
    let dir = TempDir::new().unwrap();
    let journal = StateJournal::new(dir.path().join("relay-state.json"));
    let intake = intake_with(vec![good("911", IMEI_A)]);
    let mut relay = orchestrator(intake, registry(), static_token(), settings())
        .with_journal(journal.clone());

    let report = relay.run(journal.load().await.unwrap()).await;

    let stored = journal.load().await.unwrap();
    assert_eq!(stored, report.state);
    assert!(stored.get("911").unwrap().is_confirmed());
}
