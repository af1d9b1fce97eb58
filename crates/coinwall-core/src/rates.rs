// ── Rate optimizer ──
//
// Pure functions turning a payment amount (or point balance) into granted
// time and shaping. The greedy pass is cheap enough to run on every pulse
// for the live preview; the optimal pass runs once per finalize on the
// pooled amount.

use serde::{Deserialize, Serialize};

use crate::model::rate::base_tier;
use crate::model::{PointTier, RateTier};

/// Above this amount the knapsack table would get large; the greedy pass
/// is used instead.
pub const MAX_OPTIMAL_AMOUNT: u32 = 100_000;

/// Time and shaping bought by an amount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuote {
    pub amount: u32,
    pub minutes: u64,
    pub download_speed: u32,
    pub upload_speed: u32,
    /// Any contributing tier allows idle pausing.
    pub pausable: bool,
    /// Tiers used with their multiplicity, largest amount first.
    pub tiers_used: Vec<TierCount>,
}

/// One tier in a combination and how many times it is bought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCount {
    pub amount: u32,
    pub count: u64,
}

impl TierCount {
    pub fn new(amount: u32, count: u64) -> Self {
        Self { amount, count }
    }
}

impl std::fmt::Display for TierCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 1 {
            write!(f, "{}", self.amount)
        } else {
            write!(f, "{}x{}", self.amount, self.count)
        }
    }
}

impl RateQuote {
    pub fn seconds(&self) -> u64 {
        self.minutes.saturating_mul(60)
    }

    pub fn is_empty(&self) -> bool {
        self.minutes == 0
    }

    /// Total tier instances in the combination.
    pub fn tier_instances(&self) -> u64 {
        self.tiers_used.iter().map(|t| t.count).sum()
    }

    fn zero(amount: u32) -> Self {
        Self {
            amount,
            ..Self::default()
        }
    }

    /// Build a quote from `(tier, count)` pairs. Speed is the fastest
    /// contributing tier, never a sum.
    fn from_counts<'a>(amount: u32, used: impl IntoIterator<Item = (&'a RateTier, u64)>) -> Self {
        let mut quote = Self::zero(amount);
        for (tier, count) in used {
            if count == 0 {
                continue;
            }
            quote.minutes = quote
                .minutes
                .saturating_add(u64::from(tier.minutes).saturating_mul(count));
            quote.download_speed = quote.download_speed.max(tier.download_speed);
            quote.upload_speed = quote.upload_speed.max(tier.upload_speed);
            quote.pausable |= tier.is_pausable;
            match quote.tiers_used.iter_mut().find(|t| t.amount == tier.amount) {
                Some(entry) => entry.count = entry.count.saturating_add(count),
                None => quote.tiers_used.push(TierCount::new(tier.amount, count)),
            }
        }
        quote.tiers_used.sort_unstable_by(|a, b| b.amount.cmp(&a.amount));
        quote
    }
}

/// Time and shaping bought by a point redemption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointQuote {
    /// Points actually consumed (may be less than offered).
    pub points_used: u64,
    pub seconds: u64,
    pub download_speed: u32,
    pub upload_speed: u32,
}

impl PointQuote {
    pub fn is_empty(&self) -> bool {
        self.seconds == 0
    }
}

/// Greedy preview: repeatedly take the largest tier that still fits; the
/// remainder falls through to the amount-1 base tier.
pub fn best_for_amount_greedy(amount: u32, tiers: &[RateTier]) -> RateQuote {
    if amount == 0 || tiers.is_empty() {
        return RateQuote::zero(amount);
    }

    let mut sorted: Vec<&RateTier> = tiers.iter().filter(|t| t.amount > 0).collect();
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount));

    let mut remaining = amount;
    let mut used = Vec::with_capacity(sorted.len());
    for tier in sorted {
        let count = remaining / tier.amount;
        if count > 0 {
            used.push((tier, u64::from(count)));
            remaining -= count * tier.amount;
        }
        if remaining == 0 {
            break;
        }
    }

    RateQuote::from_counts(amount, used)
}

/// Optimal quote: unbounded knapsack maximizing minutes.
///
/// `best[a]` is the most minutes any combination of tiers summing to at
/// most `a` buys. Carrying `best[a - 1]` forward keeps the result monotonic
/// in `amount` even when no tier set sums exactly to it.
pub fn best_for_amount(amount: u32, tiers: &[RateTier]) -> RateQuote {
    if amount == 0 || tiers.is_empty() {
        return RateQuote::zero(amount);
    }
    if amount > MAX_OPTIMAL_AMOUNT {
        return best_for_amount_greedy(amount, tiers);
    }

    let size = usize::try_from(amount).unwrap_or(usize::MAX);
    let mut best: Vec<Option<u64>> = vec![None; size + 1];
    let mut choice: Vec<Step> = vec![Step::None; size + 1];
    best[0] = Some(0);

    for a in 1..=size {
        for (idx, tier) in tiers.iter().enumerate() {
            let Ok(cost) = usize::try_from(tier.amount) else {
                continue;
            };
            if cost == 0 || cost > a {
                continue;
            }
            let Some(prev) = best[a - cost] else {
                continue;
            };
            let candidate = prev + u64::from(tier.minutes);
            if best[a].is_none_or(|current| candidate > current) {
                best[a] = Some(candidate);
                choice[a] = Step::Tier(idx);
            }
        }
        if let Some(carried) = best[a - 1] {
            if best[a].is_none_or(|current| carried > current) {
                best[a] = Some(carried);
                choice[a] = Step::Skip;
            }
        }
    }

    if best[size].is_none_or(|m| m == 0) {
        return base_tier_fallback(amount, tiers);
    }

    let mut counts = vec![0_u64; tiers.len()];
    let mut a = size;
    while a > 0 {
        match choice[a] {
            Step::Tier(idx) => {
                counts[idx] += 1;
                a -= usize::try_from(tiers[idx].amount).unwrap_or(a);
            }
            Step::Skip => a -= 1,
            Step::None => break,
        }
    }

    RateQuote::from_counts(amount, tiers.iter().zip(counts))
}

/// Unreachable amount: the base tier multiplied by the amount.
fn base_tier_fallback(amount: u32, tiers: &[RateTier]) -> RateQuote {
    let Some(base) = base_tier(tiers) else {
        return RateQuote::zero(amount);
    };
    RateQuote::from_counts(amount, [(base, u64::from(amount))])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    None,
    Tier(usize),
    Skip,
}

/// Greedy point redemption, sorted descending by point threshold.
pub fn best_for_points(points: u64, tiers: &[PointTier]) -> PointQuote {
    if points == 0 || tiers.is_empty() {
        return PointQuote::default();
    }

    let mut sorted: Vec<&PointTier> = tiers.iter().filter(|t| t.points > 0).collect();
    sorted.sort_by(|a, b| b.points.cmp(&a.points));

    let mut quote = PointQuote::default();
    let mut remaining = points;
    for tier in sorted {
        let cost = u64::from(tier.points);
        let count = remaining / cost;
        if count == 0 {
            continue;
        }
        remaining -= count * cost;
        quote.points_used += count * cost;
        quote.seconds = quote
            .seconds
            .saturating_add(tier.seconds().saturating_mul(count));
        quote.download_speed = quote.download_speed.max(tier.download_speed);
        quote.upload_speed = quote.upload_speed.max(tier.upload_speed);
    }
    quote
}

/// Points earned by a payment: `floor(amount * rate)`.
pub fn points_earned(amount: u32, earning_rate: f64) -> u64 {
    if earning_rate <= 0.0 || !earning_rate.is_finite() {
        return 0;
    }
    let earned = (f64::from(amount) * earning_rate).floor();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::as_conversions)]
    let earned = earned as u64;
    earned
}
