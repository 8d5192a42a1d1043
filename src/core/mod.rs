mod aggregator;
mod engine;
mod error;
mod types;

pub use aggregator::{
    CancellationToken, TrialBatch, TrialOutcome, aggregate, aggregate_with_cancel, seeded_trial,
    summarize,
};
pub use engine::{
    MarketReturns, ReturnSource, Withdrawal, derive_seed, phase_for_year, planned_withdrawal,
    simulate_trial, trace_trial, trial_rng,
};
pub use error::{SimulationError, SimulationResult};
pub use types::{
    AggregateResult, DEFAULT_DISPLAY_TRIALS, DEFAULT_EARLY_PHASE_YEARS,
    DEFAULT_GUARDRAIL_CUT_FACTOR, DEFAULT_GUARDRAIL_THRESHOLD_RATIO, DEFAULT_STATS_TRIALS,
    MonteCarloConfig, Outlook, Scenario, SimulationParameters, SurvivalStats, TrialPhase,
    YearRecord,
};
