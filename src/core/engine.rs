use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;

use super::error::{SimulationError, SimulationResult};
use super::types::{SimulationParameters, TrialPhase, YearRecord};

/// Supplies one annual market return per simulated year.
///
/// Every trial owns its source; sharing one between concurrently running
/// trials would correlate them.
pub trait ReturnSource {
    fn next_return(&mut self) -> f64;
}

impl<F> ReturnSource for F
where
    F: FnMut() -> f64,
{
    fn next_return(&mut self) -> f64 {
        self()
    }
}

/// Normally distributed returns drawn from an owned random stream.
///
/// Zero volatility degenerates to the mean and draws nothing from the stream.
#[derive(Debug, Clone)]
pub struct MarketReturns<R> {
    rng: R,
    mean: f64,
    distribution: Option<Normal>,
}

impl<R: Rng> MarketReturns<R> {
    pub fn new(params: &SimulationParameters, rng: R) -> SimulationResult<Self> {
        let distribution = if params.volatility > 0.0 {
            let normal = Normal::new(params.expected_return, params.volatility)
                .map_err(|e| SimulationError::invalid("volatility", e.to_string()))?;
            Some(normal)
        } else {
            None
        };

        Ok(Self {
            rng,
            mean: params.expected_return,
            distribution,
        })
    }
}

impl<R: Rng> ReturnSource for MarketReturns<R> {
    fn next_return(&mut self) -> f64 {
        match &self.distribution {
            Some(normal) => self.rng.sample(normal),
            None => self.mean,
        }
    }
}

/// Simulates one trial and returns the end-of-year balances.
///
/// The sequence is shorter than `horizon_years` only when the portfolio was
/// depleted, in which case its last element is exactly `0.0`.
pub fn simulate_trial<S>(
    params: &SimulationParameters,
    returns: &mut S,
) -> SimulationResult<Vec<f64>>
where
    S: ReturnSource + ?Sized,
{
    params.validate()?;
    Ok(trial_balances(params, returns))
}

/// Same path as [`simulate_trial`], with the per-year breakdown.
pub fn trace_trial<S>(
    params: &SimulationParameters,
    returns: &mut S,
) -> SimulationResult<Vec<YearRecord>>
where
    S: ReturnSource + ?Sized,
{
    params.validate()?;
    let mut trace = Vec::new();
    run_trial(params, returns, |row| trace.push(row));
    Ok(trace)
}

pub fn phase_for_year(params: &SimulationParameters, year: u32) -> TrialPhase {
    if year <= params.accumulation_years {
        TrialPhase::Accumulating
    } else if year - params.accumulation_years <= params.early_phase_years {
        TrialPhase::EarlyRetirement
    } else {
        TrialPhase::LateRetirement
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Withdrawal {
    pub base: f64,
    pub amount: f64,
    pub guardrail_applied: bool,
}

/// Withdrawal for a retirement year given the balance after market growth.
pub fn planned_withdrawal(
    params: &SimulationParameters,
    phase: TrialPhase,
    balance_before_withdrawal: f64,
) -> Withdrawal {
    let base = match phase {
        TrialPhase::EarlyRetirement => params.early_retirement_spend,
        TrialPhase::LateRetirement => params.late_retirement_spend,
        TrialPhase::Accumulating | TrialPhase::Depleted => 0.0,
    };

    // Compared against the original starting balance; never re-anchored.
    if base > 0.0 && balance_before_withdrawal < params.guardrail_floor() {
        Withdrawal {
            base,
            amount: base * params.guardrail_cut_factor,
            guardrail_applied: true,
        }
    } else {
        Withdrawal {
            base,
            amount: base,
            guardrail_applied: false,
        }
    }
}

// Callers validate `params` first.
pub(crate) fn trial_balances<S>(params: &SimulationParameters, returns: &mut S) -> Vec<f64>
where
    S: ReturnSource + ?Sized,
{
    let mut balances = Vec::new();
    run_trial(params, returns, |row| balances.push(row.end_balance));
    balances
}

// Feeds every simulated year to `on_year`; the last row is terminal when depleted.
fn run_trial<S, F>(params: &SimulationParameters, returns: &mut S, mut on_year: F)
where
    S: ReturnSource + ?Sized,
    F: FnMut(YearRecord),
{
    let mut balance = params.starting_balance;

    for year in 1..=params.horizon_years {
        let phase = phase_for_year(params, year);
        let market_return = returns.next_return();
        balance *= 1.0 + market_return;

        let mut contribution = 0.0;
        let mut base_withdrawal = 0.0;
        let mut withdrawal = 0.0;
        let mut guardrail_applied = false;

        if phase == TrialPhase::Accumulating {
            contribution = params.annual_contribution;
            balance += contribution;
        } else {
            let planned = planned_withdrawal(params, phase, balance);
            base_withdrawal = planned.base;
            withdrawal = planned.amount;
            guardrail_applied = planned.guardrail_applied;
            balance -= withdrawal;
        }

        if !balance.is_finite() {
            warn!(
                "non-finite balance in year {year} (return {market_return}); treating trial as depleted"
            );
        }
        let depleted = !balance.is_finite() || balance <= 0.0;

        on_year(YearRecord {
            year,
            phase: if depleted { TrialPhase::Depleted } else { phase },
            market_return,
            contribution,
            base_withdrawal,
            withdrawal,
            guardrail_applied,
            end_balance: if depleted { 0.0 } else { balance },
        });

        if depleted {
            break;
        }
    }
}

pub fn trial_rng(base_seed: u64, batch: u32, trial_index: u32) -> StdRng {
    StdRng::seed_from_u64(derive_seed(base_seed, batch, trial_index))
}

pub fn derive_seed(base_seed: u64, batch: u32, trial_index: u32) -> u64 {
    let mixed = base_seed ^ ((batch as u64) << 32) ^ trial_index as u64;
    splitmix64(mixed)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
