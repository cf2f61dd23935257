//! Per-cloud scoring parameters and the weighted random draw.

use rand::Rng;
use rand::rngs::StdRng;

/// Scoring inputs gathered for one candidate cloud.
#[derive(Debug, Clone, Default)]
pub struct WeightParams {
    /// Pilot activity across member sites, floored at 1.
    pub n_pilot: u64,
    /// Free Tier-1 storage in GB.
    pub space_gb: f64,
    /// Policy weight for MC-share tasks.
    pub mcshare: f64,
    /// Input files locatable at the cloud (Tier-1, or best Tier-2).
    pub n_files: usize,
}

/// Storage-headroom split: available, committed by the cloud, committed by
/// this task.
#[derive(Debug, Clone, Copy)]
pub struct SpaceBudget {
    /// Free space after subtracting committed load.
    pub available: f64,
    /// Space consumed by the cloud's committed Running Work.
    pub size_cloud: f64,
    /// Space this task would consume.
    pub size_this: f64,
}

/// Computes the Tier-1 storage headroom for a cloud.
///
/// `available = space − per_rw·(full_rw + exp_rw_self)`, split so skip logs
/// can show the contributions.
#[must_use]
pub fn space_budget(space_gb: f64, full_rw: f64, exp_rw_self: f64, per_rw: f64) -> SpaceBudget {
    let size_cloud = full_rw * per_rw;
    let size_this = exp_rw_self * per_rw;
    SpaceBudget {
        available: space_gb - (size_cloud + size_this),
        size_cloud,
        size_this,
    }
}

/// Draws one candidate proportionally to its weight.
///
/// Iterates candidates in accumulation order, subtracting each weight from
/// a uniform draw over the total; the first candidate driving the remainder
/// to zero or below wins. Returns `None` when the total weight is not
/// positive (the degenerate case the caller reports as a bug path).
#[must_use]
pub fn weighted_draw<'a>(rng: &mut StdRng, candidates: &'a [(String, f64)]) -> Option<&'a str> {
    let total: f64 = candidates.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return None;
    }
    let mut remainder = rng.gen_range(0.0..total);
    for (name, weight) in candidates {
        remainder -= weight;
        if remainder <= 0.0 {
            return Some(name);
        }
    }
    // Floating-point underflow can leave a positive sliver; the last
    // candidate owns it.
    candidates.last().map(|(name, _)| name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashMap;

    #[test]
    fn test_space_budget_split() {
        let budget = space_budget(2_000.0, 9_000.0, 500.0, 0.2);
        assert!((budget.size_cloud - 1_800.0).abs() < 1e-9);
        assert!((budget.size_this - 100.0).abs() < 1e-9);
        assert!((budget.available - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_draw_zero_total_is_none() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = vec![("US".to_string(), 0.0), ("DE".to_string(), 0.0)];
        assert!(weighted_draw(&mut rng, &candidates).is_none());
    }

    #[test]
    fn test_draw_single_positive_weight() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = vec![("US".to_string(), 0.0), ("DE".to_string(), 3.0)];
        for _ in 0..100 {
            assert_eq!(weighted_draw(&mut rng, &candidates), Some("DE"));
        }
    }

    #[test]
    fn test_draw_even_split_within_tolerance() {
        // Scenario: two equally weighted clouds, 10 000 draws, each side
        // must land in [4750, 5250].
        let mut rng = StdRng::seed_from_u64(42);
        let candidates = vec![("US".to_string(), 1.0), ("DE".to_string(), 1.0)];
        let mut hits: HashMap<&str, u32> = HashMap::new();
        for _ in 0..10_000 {
            let pick = weighted_draw(&mut rng, &candidates).unwrap_or_else(|| unreachable!());
            *hits.entry(pick).or_insert(0) += 1;
        }
        let us = *hits.get("US").unwrap_or(&0);
        let de = *hits.get("DE").unwrap_or(&0);
        assert_eq!(us + de, 10_000);
        assert!((4_750..=5_250).contains(&us), "US drawn {us} times");
        assert!((4_750..=5_250).contains(&de), "DE drawn {de} times");
    }

    #[test]
    fn test_draw_proportional_coverage() {
        // 3:1 weights over 20 000 draws stay within 2% of expectation.
        let mut rng = StdRng::seed_from_u64(7);
        let candidates = vec![("A".to_string(), 3.0), ("B".to_string(), 1.0)];
        let mut a = 0u32;
        for _ in 0..20_000 {
            if weighted_draw(&mut rng, &candidates) == Some("A") {
                a += 1;
            }
        }
        let frac = f64::from(a) / 20_000.0;
        assert!((frac - 0.75).abs() < 0.02, "A fraction {frac}");
    }
}
