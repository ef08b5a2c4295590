use serde::Serialize;

use crate::model::{Appointment, AppointmentStatus, Tier};

const POINTS_PER_VISIT: u64 = 10;

/// Inclusive lower bound of each tier above Bronze.
const THRESHOLDS: [(u64, Tier); 3] = [(100, Tier::Prata), (300, Tier::Ouro), (500, Tier::Diamante)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoyaltySummary {
    pub points: u64,
    pub tier: Tier,
    /// Percent of the way to `next_threshold`, 0..=100.
    pub progress: u8,
    /// `None` at the top tier.
    pub next_threshold: Option<u64>,
}

pub fn tier_for(points: u64) -> Tier {
    THRESHOLDS
        .iter()
        .rev()
        .find(|(lower, _)| points >= *lower)
        .map(|(_, tier)| *tier)
        .unwrap_or(Tier::Bronze)
}

fn next_threshold(points: u64) -> Option<u64> {
    THRESHOLDS
        .iter()
        .map(|(lower, _)| *lower)
        .find(|lower| points < *lower)
}

/// Points and tier from a client's appointment history. Only completed
/// appointments count; recompute from the full history on every change.
pub fn compute_loyalty<'a>(history: impl IntoIterator<Item = &'a Appointment>) -> LoyaltySummary {
    let (visits, minutes) = history
        .into_iter()
        .filter(|a| a.status == AppointmentStatus::Completed)
        .fold((0u64, 0u64), |(n, m), a| (n + 1, m + u64::from(a.duration_minutes)));
    let points = POINTS_PER_VISIT * visits + minutes;

    let next = next_threshold(points);
    let progress = match next {
        Some(threshold) => (points.saturating_mul(100) / threshold).min(100) as u8,
        None => 100,
    };
    LoyaltySummary {
        points,
        tier: tier_for(points),
        progress,
        next_threshold: next,
    }
}
