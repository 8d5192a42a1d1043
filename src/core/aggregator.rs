use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use super::engine::{MarketReturns, trial_balances, trial_rng};
use super::error::{SimulationError, SimulationResult};
use super::types::{
    AggregateResult, MonteCarloConfig, Outlook, Scenario, SimulationParameters, SurvivalStats,
};

/// Cooperative cancellation flag, checked before every trial.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// The two independent trial batches of an aggregate run. Each draws from its
/// own family of random streams so sample sizes can change independently.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrialBatch {
    Display,
    Statistics,
}

impl TrialBatch {
    fn stream_id(self) -> u32 {
        match self {
            TrialBatch::Display => 0,
            TrialBatch::Statistics => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutcome {
    pub balances: Vec<f64>,
}

impl TrialOutcome {
    pub fn final_balance(&self) -> f64 {
        self.balances.last().copied().unwrap_or(0.0)
    }

    pub fn survived(&self) -> bool {
        self.final_balance() > 0.0
    }

    /// 1-based year in which the balance hit zero.
    pub fn depletion_year(&self) -> Option<u32> {
        if self.survived() {
            None
        } else {
            Some(self.balances.len() as u32)
        }
    }
}

pub fn aggregate(
    params: &SimulationParameters,
    config: MonteCarloConfig,
) -> SimulationResult<AggregateResult> {
    aggregate_with_cancel(params, config, &CancellationToken::new())
}

pub fn aggregate_with_cancel(
    params: &SimulationParameters,
    config: MonteCarloConfig,
    cancel: &CancellationToken,
) -> SimulationResult<AggregateResult> {
    run_aggregate(params, config, cancel, |_| {})
}

// `on_trial` sees the running count of completed trials across both batches.
fn run_aggregate<F>(
    params: &SimulationParameters,
    config: MonteCarloConfig,
    cancel: &CancellationToken,
    mut on_trial: F,
) -> SimulationResult<AggregateResult>
where
    F: FnMut(u32),
{
    params.validate()?;
    validate_config(config)?;

    let base_seed = config.seed.unwrap_or_else(rand::random);
    debug!(
        "aggregate run: seed={base_seed} display_trials={} stats_trials={}",
        config.display_trials, config.stats_trials
    );

    let mut scenarios = Vec::new();
    run_batch(
        params,
        base_seed,
        TrialBatch::Display,
        config.display_trials,
        0,
        cancel,
        &mut on_trial,
        |outcome| {
            scenarios.push(Scenario {
                label: format!("Scenario {}", scenarios.len() + 1),
                balances: outcome.balances,
            })
        },
    )?;

    // Statistics trials only keep what the summary needs, never the path.
    let mut tally = SurvivalTally::default();
    run_batch(
        params,
        base_seed,
        TrialBatch::Statistics,
        config.stats_trials,
        config.display_trials,
        cancel,
        &mut on_trial,
        |outcome| tally.record(&outcome),
    )?;

    let stats = tally.finish();
    debug!(
        "aggregate run finished: survival={}% outlook={:?}",
        stats.survival_rate_pct, stats.outlook
    );

    Ok(AggregateResult {
        base_seed,
        scenarios,
        stats,
    })
}

/// Runs one trial on the stream identified by `(base_seed, batch, trial_index)`.
///
/// Trials are pure functions of their stream, so callers may evaluate any
/// subset in any order and on any thread.
pub fn seeded_trial(
    params: &SimulationParameters,
    base_seed: u64,
    batch: TrialBatch,
    trial_index: u32,
) -> SimulationResult<TrialOutcome> {
    params.validate()?;
    run_seeded_trial(params, base_seed, batch, trial_index)
}

fn run_seeded_trial(
    params: &SimulationParameters,
    base_seed: u64,
    batch: TrialBatch,
    trial_index: u32,
) -> SimulationResult<TrialOutcome> {
    let rng = trial_rng(base_seed, batch.stream_id(), trial_index);
    let mut returns = MarketReturns::new(params, rng)?;
    Ok(TrialOutcome {
        balances: trial_balances(params, &mut returns),
    })
}

#[allow(clippy::too_many_arguments)]
fn run_batch<P, K>(
    params: &SimulationParameters,
    base_seed: u64,
    batch: TrialBatch,
    count: u32,
    completed_before: u32,
    cancel: &CancellationToken,
    on_trial: &mut P,
    mut keep: K,
) -> SimulationResult<()>
where
    P: FnMut(u32),
    K: FnMut(TrialOutcome),
{
    for trial_index in 0..count {
        let completed = completed_before.saturating_add(trial_index);
        if cancel.is_cancelled() {
            warn!("aggregate run cancelled during {batch:?} batch after {completed} trials");
            return Err(SimulationError::Cancelled { completed });
        }
        keep(run_seeded_trial(params, base_seed, batch, trial_index)?);
        on_trial(completed.saturating_add(1));
    }
    Ok(())
}

/// Running survival counts plus the per-trial values the percentiles need.
#[derive(Debug, Default)]
struct SurvivalTally {
    trials: u32,
    survivors: u32,
    final_balances: Vec<f64>,
    depletion_years: Vec<f64>,
}

impl SurvivalTally {
    fn record(&mut self, outcome: &TrialOutcome) {
        self.trials += 1;
        self.final_balances.push(outcome.final_balance());
        match outcome.depletion_year() {
            Some(year) => self.depletion_years.push(f64::from(year)),
            None => self.survivors += 1,
        }
    }

    fn finish(mut self) -> SurvivalStats {
        let trials = self.trials;
        let survivors = self.survivors;
        let survival_rate = if trials == 0 {
            0.0
        } else {
            survivors as f64 / trials as f64
        };
        let survival_rate_pct = if trials == 0 {
            0
        } else {
            (survivors as u64 * 100 / trials as u64) as u32
        };

        SurvivalStats {
            trials,
            survivors,
            depleted: trials - survivors,
            survival_rate,
            survival_rate_pct,
            survival_ci_half_width: binomial_ci_half_width(survival_rate, trials),
            median_final_balance: percentile(&mut self.final_balances, 50.0),
            p10_final_balance: percentile(&mut self.final_balances, 10.0),
            median_depletion_year: if self.depletion_years.is_empty() {
                None
            } else {
                Some(percentile(&mut self.depletion_years, 50.0).round() as u32)
            },
            outlook: Outlook::from_survival_rate_pct(survival_rate_pct),
        }
    }
}

pub fn summarize(outcomes: &[TrialOutcome]) -> SurvivalStats {
    let mut tally = SurvivalTally::default();
    for outcome in outcomes {
        tally.record(outcome);
    }
    tally.finish()
}

fn validate_config(config: MonteCarloConfig) -> SimulationResult<()> {
    if config.stats_trials == 0 {
        return Err(SimulationError::invalid("stats_trials", "must be > 0"));
    }
    Ok(())
}

fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}
