use serde::Serialize;

use super::error::{SimulationError, SimulationResult};

pub const DEFAULT_EARLY_PHASE_YEARS: u32 = 15;
pub const DEFAULT_GUARDRAIL_THRESHOLD_RATIO: f64 = 0.8;
pub const DEFAULT_GUARDRAIL_CUT_FACTOR: f64 = 0.9;
pub const DEFAULT_DISPLAY_TRIALS: u32 = 5;
pub const DEFAULT_STATS_TRIALS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationParameters {
    pub starting_balance: f64,
    pub accumulation_years: u32,
    pub annual_contribution: f64,
    pub early_retirement_spend: f64,
    pub late_retirement_spend: f64,
    /// Retirement years funded at the early spend before switching to the late spend.
    pub early_phase_years: u32,
    pub expected_return: f64,
    pub volatility: f64,
    pub horizon_years: u32,
    /// Fraction of `starting_balance` below which withdrawals are cut.
    pub guardrail_threshold_ratio: f64,
    pub guardrail_cut_factor: f64,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            starting_balance: 1_800_000.0,
            accumulation_years: 5,
            annual_contribution: 130_000.0,
            early_retirement_spend: 140_000.0,
            late_retirement_spend: 110_000.0,
            early_phase_years: DEFAULT_EARLY_PHASE_YEARS,
            expected_return: 0.06,
            volatility: 0.15,
            horizon_years: 60,
            guardrail_threshold_ratio: DEFAULT_GUARDRAIL_THRESHOLD_RATIO,
            guardrail_cut_factor: DEFAULT_GUARDRAIL_CUT_FACTOR,
        }
    }
}

impl SimulationParameters {
    pub fn validate(&self) -> SimulationResult<()> {
        if !self.starting_balance.is_finite() || self.starting_balance <= 0.0 {
            return Err(SimulationError::invalid(
                "starting_balance",
                "must be finite and > 0",
            ));
        }
        if !self.annual_contribution.is_finite() {
            return Err(SimulationError::invalid(
                "annual_contribution",
                "must be finite",
            ));
        }
        for (field, spend) in [
            ("early_retirement_spend", self.early_retirement_spend),
            ("late_retirement_spend", self.late_retirement_spend),
        ] {
            if !spend.is_finite() || spend < 0.0 {
                return Err(SimulationError::invalid(field, "must be finite and >= 0"));
            }
        }
        if self.early_phase_years == 0 {
            return Err(SimulationError::invalid("early_phase_years", "must be > 0"));
        }
        if !self.expected_return.is_finite() {
            return Err(SimulationError::invalid("expected_return", "must be finite"));
        }
        if !self.volatility.is_finite() || self.volatility < 0.0 {
            return Err(SimulationError::invalid(
                "volatility",
                "must be finite and >= 0",
            ));
        }
        if self.horizon_years == 0 {
            return Err(SimulationError::invalid("horizon_years", "must be > 0"));
        }
        for (field, ratio) in [
            ("guardrail_threshold_ratio", self.guardrail_threshold_ratio),
            ("guardrail_cut_factor", self.guardrail_cut_factor),
        ] {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(SimulationError::invalid(
                    field,
                    format!("must be strictly between 0 and 1, got {ratio}"),
                ));
            }
        }
        Ok(())
    }

    pub fn guardrail_floor(&self) -> f64 {
        self.starting_balance * self.guardrail_threshold_ratio
    }

    pub fn initial_withdrawal_rate(&self) -> f64 {
        self.early_retirement_spend / self.starting_balance
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrialPhase {
    Accumulating,
    EarlyRetirement,
    LateRetirement,
    Depleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearRecord {
    pub year: u32,
    /// Phase the year was simulated in; `Depleted` marks the terminal year.
    pub phase: TrialPhase,
    pub market_return: f64,
    pub contribution: f64,
    pub base_withdrawal: f64,
    pub withdrawal: f64,
    pub guardrail_applied: bool,
    pub end_balance: f64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outlook {
    Robust,
    ViableWithCaveats,
    HighRisk,
}

impl Outlook {
    pub fn from_survival_rate_pct(survival_rate_pct: u32) -> Self {
        if survival_rate_pct > 90 {
            Outlook::Robust
        } else if survival_rate_pct > 75 {
            Outlook::ViableWithCaveats
        } else {
            Outlook::HighRisk
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Outlook::Robust => "Bulletproof Plan",
            Outlook::ViableWithCaveats => "Viable with Guardrails",
            Outlook::HighRisk => "High Risk of Depletion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonteCarloConfig {
    pub display_trials: u32,
    pub stats_trials: u32,
    /// Base seed for every trial stream; `None` draws one from entropy.
    pub seed: Option<u64>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            display_trials: DEFAULT_DISPLAY_TRIALS,
            stats_trials: DEFAULT_STATS_TRIALS,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub label: String,
    pub balances: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurvivalStats {
    pub trials: u32,
    pub survivors: u32,
    pub depleted: u32,
    pub survival_rate: f64,
    pub survival_rate_pct: u32,
    pub survival_ci_half_width: f64,
    pub median_final_balance: f64,
    pub p10_final_balance: f64,
    pub median_depletion_year: Option<u32>,
    pub outlook: Outlook,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub base_seed: u64,
    pub scenarios: Vec<Scenario>,
    pub stats: SurvivalStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parameters_are_valid() {
        SimulationParameters::default()
            .validate()
            .expect("default plan must validate");
    }

    #[test]
    fn validate_rejects_non_positive_starting_balance() {
        let mut params = SimulationParameters::default();
        params.starting_balance = 0.0;
        let err = params.validate().expect_err("zero balance must be rejected");
        assert!(matches!(
            err,
            SimulationError::InvalidParameter {
                field: "starting_balance",
                ..
            }
        ));

        params.starting_balance = -5.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_negative_volatility_and_zero_horizon() {
        let mut params = SimulationParameters::default();
        params.volatility = -0.01;
        assert!(params.validate().is_err());

        let mut params = SimulationParameters::default();
        params.horizon_years = 0;
        let err = params.validate().expect_err("zero horizon must be rejected");
        assert!(err.to_string().contains("horizon_years"));
    }

    #[test]
    fn validate_rejects_guardrail_ratios_outside_open_unit_interval() {
        for bad in [0.0, 1.0, -0.2, 1.5, f64::NAN] {
            let mut params = SimulationParameters::default();
            params.guardrail_threshold_ratio = bad;
            assert!(params.validate().is_err(), "threshold {bad} accepted");

            let mut params = SimulationParameters::default();
            params.guardrail_cut_factor = bad;
            assert!(params.validate().is_err(), "cut factor {bad} accepted");
        }
    }

    #[test]
    fn validate_allows_accumulation_longer_than_horizon() {
        let mut params = SimulationParameters::default();
        params.accumulation_years = 80;
        params.horizon_years = 10;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn outlook_thresholds_are_strict() {
        assert_eq!(Outlook::from_survival_rate_pct(100), Outlook::Robust);
        assert_eq!(Outlook::from_survival_rate_pct(91), Outlook::Robust);
        assert_eq!(
            Outlook::from_survival_rate_pct(90),
            Outlook::ViableWithCaveats
        );
        assert_eq!(
            Outlook::from_survival_rate_pct(76),
            Outlook::ViableWithCaveats
        );
        assert_eq!(Outlook::from_survival_rate_pct(75), Outlook::HighRisk);
        assert_eq!(Outlook::from_survival_rate_pct(0), Outlook::HighRisk);
        assert_eq!(Outlook::Robust.label(), "Bulletproof Plan");
    }

    #[test]
    fn initial_withdrawal_rate_uses_early_spend() {
        let params = SimulationParameters::default();
        assert!((params.initial_withdrawal_rate() - 140_000.0 / 1_800_000.0).abs() < 1e-12);
        assert!((params.guardrail_floor() - 1_440_000.0).abs() < 1e-9);
    }
}
