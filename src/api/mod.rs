use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::core::{
    DEFAULT_DISPLAY_TRIALS, DEFAULT_EARLY_PHASE_YEARS, DEFAULT_STATS_TRIALS, MonteCarloConfig,
    CancellationToken, Outlook, Scenario, SimulationError, SimulationParameters, SurvivalStats,
    aggregate_with_cancel,
};

/// Benchmark withdrawal rate shown next to the plan's own initial rate.
const TARGET_SAFE_WITHDRAWAL_RATE: f64 = 0.035;
const MAX_API_TRIALS: u32 = 50_000;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    starting_balance: Option<f64>,
    accumulation_years: Option<u32>,
    annual_contribution: Option<f64>,
    early_retirement_spend: Option<f64>,
    late_retirement_spend: Option<f64>,
    early_phase_years: Option<u32>,
    expected_return: Option<f64>,
    volatility: Option<f64>,
    horizon_years: Option<u32>,
    guardrail_threshold: Option<f64>,
    guardrail_cut: Option<f64>,
    display_trials: Option<u32>,
    stats_trials: Option<u32>,
    seed: Option<u64>,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "runway",
    about = "Monte Carlo retirement runway: savings phase, phased spending and a spending guardrail"
)]
struct Cli {
    #[arg(long, default_value_t = 1_800_000.0, help = "Starting portfolio balance")]
    starting_balance: f64,
    #[arg(
        long,
        default_value_t = 5,
        help = "Years of contributions before withdrawals begin"
    )]
    accumulation_years: u32,
    #[arg(long, default_value_t = 130_000.0, help = "Contribution per accumulation year")]
    annual_contribution: f64,
    #[arg(
        long,
        default_value_t = 140_000.0,
        help = "Annual spend for the early retirement years"
    )]
    early_retirement_spend: f64,
    #[arg(
        long,
        default_value_t = 110_000.0,
        help = "Annual spend once the early retirement years are over"
    )]
    late_retirement_spend: f64,
    #[arg(
        long,
        default_value_t = DEFAULT_EARLY_PHASE_YEARS,
        help = "Retirement years funded at the early spend"
    )]
    early_phase_years: u32,
    #[arg(
        long,
        default_value_t = 6.0,
        help = "Expected annual real return in percent, e.g. 6"
    )]
    expected_return: f64,
    #[arg(
        long,
        default_value_t = 15.0,
        help = "Annual return volatility (standard deviation) in percent"
    )]
    volatility: f64,
    #[arg(
        long,
        default_value_t = 60,
        help = "Total simulated years, accumulation included"
    )]
    horizon_years: u32,
    #[arg(
        long,
        default_value_t = 80.0,
        help = "Cut spending when the balance falls below this percent of the starting balance"
    )]
    guardrail_threshold: f64,
    #[arg(
        long,
        default_value_t = 90.0,
        help = "Percent of the planned withdrawal taken while below the guardrail"
    )]
    guardrail_cut: f64,
    #[arg(
        long,
        default_value_t = DEFAULT_DISPLAY_TRIALS,
        help = "Sample trajectories to return"
    )]
    display_trials: u32,
    #[arg(
        long,
        default_value_t = DEFAULT_STATS_TRIALS,
        help = "Trials behind the survival rate"
    )]
    stats_trials: u32,
    #[arg(long, help = "Base seed; omit for a fresh random run")]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    parameters: SimulationParameters,
    seed: u64,
    scenarios: Vec<Scenario>,
    survival_rate_pct: u32,
    outlook: Outlook,
    outlook_label: &'static str,
    stats: SurvivalStats,
    initial_withdrawal_rate: f64,
    target_safe_withdrawal_rate: f64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn build_params(cli: Cli) -> Result<(SimulationParameters, MonteCarloConfig), String> {
    if !cli.expected_return.is_finite() || cli.expected_return <= -100.0 {
        return Err("--expected-return must be > -100".to_string());
    }

    if !cli.volatility.is_finite() || cli.volatility < 0.0 {
        return Err("--volatility must be >= 0".to_string());
    }

    if !(cli.guardrail_threshold > 0.0 && cli.guardrail_threshold < 100.0) {
        return Err("--guardrail-threshold must be strictly between 0 and 100".to_string());
    }

    if !(cli.guardrail_cut > 0.0 && cli.guardrail_cut < 100.0) {
        return Err("--guardrail-cut must be strictly between 0 and 100".to_string());
    }

    if cli.stats_trials == 0 {
        return Err("--stats-trials must be > 0".to_string());
    }

    let params = SimulationParameters {
        starting_balance: cli.starting_balance,
        accumulation_years: cli.accumulation_years,
        annual_contribution: cli.annual_contribution,
        early_retirement_spend: cli.early_retirement_spend,
        late_retirement_spend: cli.late_retirement_spend,
        early_phase_years: cli.early_phase_years,
        expected_return: cli.expected_return / 100.0,
        volatility: cli.volatility / 100.0,
        horizon_years: cli.horizon_years,
        guardrail_threshold_ratio: cli.guardrail_threshold / 100.0,
        guardrail_cut_factor: cli.guardrail_cut / 100.0,
    };
    params.validate().map_err(flag_error)?;

    let config = MonteCarloConfig {
        display_trials: cli.display_trials,
        stats_trials: cli.stats_trials,
        seed: cli.seed,
    };
    Ok((params, config))
}

fn flag_error(err: SimulationError) -> String {
    match err {
        SimulationError::InvalidParameter { field, reason } => {
            format!("--{} {reason}", field.replace('_', "-"))
        }
        other => other.to_string(),
    }
}

fn simulate(cli: Cli, cancel: &CancellationToken) -> Result<SimulateResponse, String> {
    let (params, config) = build_params(cli)?;
    let result = aggregate_with_cancel(&params, config, cancel).map_err(flag_error)?;
    Ok(SimulateResponse {
        parameters: params,
        seed: result.base_seed,
        scenarios: result.scenarios,
        survival_rate_pct: result.stats.survival_rate_pct,
        outlook: result.stats.outlook,
        outlook_label: result.stats.outlook.label(),
        stats: result.stats,
        initial_withdrawal_rate: params.initial_withdrawal_rate(),
        target_safe_withdrawal_rate: TARGET_SAFE_WITHDRAWAL_RATE,
    })
}

/// Parses command-line flags, runs the simulation and renders it as JSON.
pub fn run_cli<I, T>(args: I) -> Result<String, String>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(args).map_err(|e| e.to_string())?;
    let response = simulate(cli, &CancellationToken::new())?;
    serde_json::to_string_pretty(&response).map_err(|e| format!("Failed to render JSON: {e}"))
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!("runway HTTP API listening on http://{addr}");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let cli = match cli_from_payload(payload) {
        Ok(cli) => cli,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let cancel = CancellationToken::new();
    // Axum drops this future when the client goes away mid-run.
    let _cancel_on_drop = CancelOnDrop(cancel.clone());
    match tokio::task::spawn_blocking(move || simulate(cli, &cancel)).await {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(msg)) => error_response(StatusCode::BAD_REQUEST, &msg),
        Err(e) => {
            warn!("simulation task failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Simulation failed")
        }
    }
}

struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn cli_from_json(json: &str) -> Result<Cli, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    cli_from_payload(payload)
}

fn cli_from_payload(payload: SimulatePayload) -> Result<Cli, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.starting_balance {
        cli.starting_balance = v;
    }
    if let Some(v) = payload.accumulation_years {
        cli.accumulation_years = v;
    }
    if let Some(v) = payload.annual_contribution {
        cli.annual_contribution = v;
    }
    if let Some(v) = payload.early_retirement_spend {
        cli.early_retirement_spend = v;
    }
    if let Some(v) = payload.late_retirement_spend {
        cli.late_retirement_spend = v;
    }
    if let Some(v) = payload.early_phase_years {
        cli.early_phase_years = v;
    }
    if let Some(v) = payload.expected_return {
        cli.expected_return = v;
    }
    if let Some(v) = payload.volatility {
        cli.volatility = v;
    }
    if let Some(v) = payload.horizon_years {
        cli.horizon_years = v;
    }
    if let Some(v) = payload.guardrail_threshold {
        cli.guardrail_threshold = v;
    }
    if let Some(v) = payload.guardrail_cut {
        cli.guardrail_cut = v;
    }
    if let Some(v) = payload.display_trials {
        cli.display_trials = v;
    }
    if let Some(v) = payload.stats_trials {
        cli.stats_trials = v;
    }
    if let Some(v) = payload.seed {
        cli.seed = Some(v);
    }

    if cli.display_trials > MAX_API_TRIALS || cli.stats_trials > MAX_API_TRIALS {
        return Err(format!(
            "displayTrials and statsTrials must be <= {MAX_API_TRIALS}"
        ));
    }

    Ok(cli)
}

fn default_cli_for_api() -> Cli {
    Cli {
        starting_balance: 1_800_000.0,
        accumulation_years: 5,
        annual_contribution: 130_000.0,
        early_retirement_spend: 140_000.0,
        late_retirement_spend: 110_000.0,
        early_phase_years: DEFAULT_EARLY_PHASE_YEARS,
        expected_return: 6.0,
        volatility: 15.0,
        horizon_years: 60,
        guardrail_threshold: 80.0,
        guardrail_cut: 90.0,
        display_trials: DEFAULT_DISPLAY_TRIALS,
        stats_trials: DEFAULT_STATS_TRIALS,
        seed: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_cli() -> Cli {
        default_cli_for_api()
    }

    #[test]
    fn default_cli_matches_reference_parameters() {
        let (params, config) = build_params(sample_cli()).expect("valid defaults");
        assert_eq!(params, SimulationParameters::default());
        assert_eq!(config, MonteCarloConfig::default());
    }

    #[test]
    fn clap_defaults_match_api_defaults() {
        let cli = Cli::try_parse_from(["runway"]).expect("defaults parse");
        let (from_flags, _) = build_params(cli).expect("valid defaults");
        let (from_api, _) = build_params(sample_cli()).expect("valid defaults");
        assert_eq!(from_flags, from_api);
    }

    #[test]
    fn build_params_converts_percent_flags() {
        let mut cli = sample_cli();
        cli.expected_return = 4.5;
        cli.volatility = 12.0;
        cli.guardrail_threshold = 75.0;
        cli.guardrail_cut = 85.0;

        let (params, _) = build_params(cli).expect("valid inputs");
        assert_approx(params.expected_return, 0.045);
        assert_approx(params.volatility, 0.12);
        assert_approx(params.guardrail_threshold_ratio, 0.75);
        assert_approx(params.guardrail_cut_factor, 0.85);
    }

    #[test]
    fn build_params_rejects_guardrail_outside_open_range() {
        let mut cli = sample_cli();
        cli.guardrail_threshold = 100.0;
        let err = build_params(cli).expect_err("must reject threshold of 100");
        assert!(err.contains("--guardrail-threshold"));

        let mut cli = sample_cli();
        cli.guardrail_cut = 0.0;
        let err = build_params(cli).expect_err("must reject cut of 0");
        assert!(err.contains("--guardrail-cut"));
    }

    #[test]
    fn build_params_reports_core_violations_by_flag() {
        let mut cli = sample_cli();
        cli.starting_balance = -1.0;
        let err = build_params(cli).expect_err("must reject negative balance");
        assert!(err.starts_with("--starting-balance"), "{err}");

        let mut cli = sample_cli();
        cli.horizon_years = 0;
        let err = build_params(cli).expect_err("must reject zero horizon");
        assert!(err.starts_with("--horizon-years"), "{err}");
    }

    #[test]
    fn build_params_rejects_negative_volatility_and_zero_stats_trials() {
        let mut cli = sample_cli();
        cli.volatility = -1.0;
        assert!(build_params(cli).expect_err("negative vol").contains("--volatility"));

        let mut cli = sample_cli();
        cli.stats_trials = 0;
        assert!(build_params(cli).expect_err("no trials").contains("--stats-trials"));
    }

    #[test]
    fn cli_from_json_parses_camel_case_keys() {
        let json = r#"{
          "startingBalance": 900000,
          "accumulationYears": 0,
          "annualContribution": 0,
          "earlyRetirementSpend": 50000,
          "lateRetirementSpend": 40000,
          "earlyPhaseYears": 10,
          "expectedReturn": 5,
          "volatility": 10,
          "horizonYears": 40,
          "guardrailThreshold": 70,
          "guardrailCut": 95,
          "displayTrials": 3,
          "statsTrials": 250,
          "seed": 99
        }"#;
        let cli = cli_from_json(json).expect("json should parse");
        let (params, config) = build_params(cli).expect("valid inputs");

        assert_approx(params.starting_balance, 900_000.0);
        assert_eq!(params.accumulation_years, 0);
        assert_approx(params.early_retirement_spend, 50_000.0);
        assert_approx(params.late_retirement_spend, 40_000.0);
        assert_eq!(params.early_phase_years, 10);
        assert_approx(params.expected_return, 0.05);
        assert_approx(params.volatility, 0.10);
        assert_eq!(params.horizon_years, 40);
        assert_approx(params.guardrail_threshold_ratio, 0.70);
        assert_approx(params.guardrail_cut_factor, 0.95);
        assert_eq!(config.display_trials, 3);
        assert_eq!(config.stats_trials, 250);
        assert_eq!(config.seed, Some(99));
    }

    #[test]
    fn cli_from_json_keeps_defaults_for_missing_keys() {
        let cli = cli_from_json(r#"{ "seed": 5 }"#).expect("json should parse");
        let (params, config) = build_params(cli).expect("valid inputs");
        assert_eq!(params, SimulationParameters::default());
        assert_eq!(config.seed, Some(5));
    }

    #[test]
    fn cli_from_json_rejects_excessive_trial_counts() {
        let err = cli_from_json(r#"{ "statsTrials": 1000000 }"#).expect_err("must cap trials");
        assert!(err.contains("statsTrials"));
    }

    #[test]
    fn simulate_response_serialization_contains_expected_fields() {
        let mut cli = sample_cli();
        cli.seed = Some(42);
        cli.display_trials = 2;
        cli.stats_trials = 20;

        let response = simulate(cli, &CancellationToken::new()).expect("valid run");
        assert_eq!(response.seed, 42);
        assert_eq!(response.scenarios.len(), 2);
        assert_eq!(response.outlook_label, response.outlook.label());
        assert_approx(response.initial_withdrawal_rate, 140_000.0 / 1_800_000.0);

        let json = serde_json::to_string(&response).expect("response should serialize");
        assert!(json.contains("\"parameters\""));
        assert!(json.contains("\"startingBalance\""));
        assert!(json.contains("\"scenarios\""));
        assert!(json.contains("\"Scenario 1\""));
        assert!(json.contains("\"survivalRatePct\""));
        assert!(json.contains("\"outlookLabel\""));
        assert!(json.contains("\"medianFinalBalance\""));
        assert!(json.contains("\"targetSafeWithdrawalRate\""));
    }

    #[test]
    fn zero_volatility_plan_serializes_robust_outlook() {
        let mut cli = sample_cli();
        cli.volatility = 0.0;
        cli.seed = Some(1);
        let response = simulate(cli, &CancellationToken::new()).expect("valid run");
        assert_eq!(response.survival_rate_pct, 100);
        let json = serde_json::to_string(&response).expect("response should serialize");
        assert!(json.contains("\"outlook\":\"robust\""));
        assert!(json.contains("\"outlookLabel\":\"Bulletproof Plan\""));
    }

    #[test]
    fn run_cli_parses_flags_and_renders_json() {
        let json = run_cli([
            "runway",
            "--expected-return",
            "7",
            "--volatility",
            "0",
            "--display-trials",
            "1",
            "--stats-trials",
            "10",
            "--seed",
            "3",
        ])
        .expect("cli run should succeed");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
        assert_eq!(value["seed"], 3);
        assert_eq!(value["scenarios"].as_array().map(Vec::len), Some(1));
        assert_eq!(value["stats"]["trials"], 10);
    }

    #[test]
    fn run_cli_surfaces_validation_errors() {
        let err = run_cli(["runway", "--horizon-years", "0"]).expect_err("must reject");
        assert!(err.contains("--horizon-years"));

        let err = run_cli(["runway", "--no-such-flag"]).expect_err("unknown flag");
        assert!(err.contains("--no-such-flag"));
    }

    fn payload(json: &str) -> SimulatePayload {
        serde_json::from_str(json).expect("valid payload JSON")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        serde_json::from_slice(&bytes).expect("JSON body")
    }

    #[tokio::test]
    async fn simulate_handler_returns_json_from_blocking_task() {
        let response = simulate_handler_impl(payload(
            r#"{ "seed": 11, "displayTrials": 2, "statsTrials": 30 }"#,
        ))
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL),
            Some(&header::HeaderValue::from_static("no-store"))
        );

        let value = body_json(response).await;
        assert_eq!(value["seed"], 11);
        assert_eq!(value["stats"]["trials"], 30);
    }

    #[tokio::test]
    async fn simulate_handler_rejects_invalid_plan() {
        let response = simulate_handler_impl(payload(r#"{ "horizonYears": 0 }"#)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = body_json(response).await;
        assert!(
            value["error"]
                .as_str()
                .is_some_and(|msg| msg.contains("--horizon-years"))
        );
    }

    #[test]
    fn dropped_request_cancels_its_run() {
        let token = CancellationToken::new();
        drop(CancelOnDrop(token.clone()));
        assert!(token.is_cancelled());

        let mut cli = sample_cli();
        cli.seed = Some(1);
        let err = simulate(cli, &token).expect_err("cancelled run must fail");
        assert!(err.contains("cancelled after 0 trials"));
    }
}
