//! Pool share, potential return and ROI for the staking panel.

use crate::types::{OutcomeKind, Outcomes, PoolSnapshot};
use crate::utils::to_display;
use serde::Serialize;

/// Odds posted for a project with no catalog entry.
pub const DEFAULT_ODDS: Outcomes<f64> = Outcomes {
    win_prize: 2.0,
    finalist: 1.5,
    vc_meeting: 2.0,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub outcome: OutcomeKind,
    pub odds: f64,
    pub percent_of_pool: f64,
    pub potential_return: f64,
    /// `None` without a positive stake.
    pub roi_percent: Option<f64>,
}

impl Quote {
    pub fn compute(pool: &PoolSnapshot, odds: &Outcomes<f64>, stake: Option<f64>, outcome: OutcomeKind) -> Self {
        let total = to_display(pool.total());
        let percent_of_pool = if total > 0.0 {
            to_display(pool.amount(outcome)) / total * 100.0
        } else {
            0.0
        };
        let stake = stake.filter(|s| s.is_finite() && *s > 0.0);
        let potential_return = stake.map(|s| s * odds[outcome]).unwrap_or(0.0);
        let roi_percent = stake.map(|s| (potential_return / s - 1.0) * 100.0);
        Self {
            outcome,
            odds: odds[outcome],
            percent_of_pool,
            potential_return,
            roi_percent,
        }
    }

    /// Every outcome for the same stake.
    pub fn all(pool: &PoolSnapshot, odds: &Outcomes<f64>, stake: Option<f64>) -> Outcomes<Self> {
        Outcomes::from_fn(|outcome| Self::compute(pool, odds, stake, outcome))
    }
}
