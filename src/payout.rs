//! Deterministic fixed-point payout math.
//!
//! payout = floor(coverageCap * kBps * max(severity - deductible, 0) / 1e8),
//! clamped to coverageCap. All arithmetic stays in the integer domain so
//! an on-chain verifier recomputing the same formula gets the same
//! result bit for bit.

use alloy::primitives::U256;

const BPS_BASE: u64 = 10_000;

/// Payout with the intermediate facts a claim response reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayoutBreakdown {
    pub amount: U256,
    /// Severity remaining after the deductible, in bps.
    pub severity_applied_bps: u32,
    /// True when the uncapped formula exceeded the coverage cap.
    pub cap_applied: bool,
}

/// Severity-to-payout conversion. Amounts are in the coverage token's
/// raw units. Division truncates toward zero.
pub fn compute_payout(
    coverage_cap: U256,
    k_bps: u32,
    deductible_bps: u32,
    severity_bps: u32,
) -> U256 {
    compute_payout_breakdown(coverage_cap, k_bps, deductible_bps, severity_bps).amount
}

pub fn compute_payout_breakdown(
    coverage_cap: U256,
    k_bps: u32,
    deductible_bps: u32,
    severity_bps: u32,
) -> PayoutBreakdown {
    let severity = severity_bps.saturating_sub(deductible_bps);
    if severity == 0 {
        return PayoutBreakdown {
            amount: U256::ZERO,
            severity_applied_bps: 0,
            cap_applied: false,
        };
    }

    let factor = U256::from(k_bps as u64 * severity as u64);
    // If the product overflows 256 bits the uncapped payout already
    // exceeds the cap, so the clamp below is still exact.
    let uncapped = match coverage_cap.checked_mul(factor) {
        Some(product) => product / U256::from(BPS_BASE * BPS_BASE),
        None => {
            return PayoutBreakdown {
                amount: coverage_cap,
                severity_applied_bps: severity,
                cap_applied: true,
            }
        }
    };
    PayoutBreakdown {
        amount: uncapped.min(coverage_cap),
        severity_applied_bps: severity,
        cap_applied: uncapped > coverage_cap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_example() {
        // coverage 800_000_000, k 50%, deductible 25bps, severity 150bps
        let payout = compute_payout(U256::from(800_000_000u64), 5_000, 25, 150);
        assert_eq!(payout, U256::from(5_000_000u64));
    }

    #[test]
    fn test_zero_at_or_below_deductible() {
        assert_eq!(compute_payout(U256::from(1_000_000u64), 5_000, 25, 25), U256::ZERO);
        assert_eq!(compute_payout(U256::from(1_000_000u64), 5_000, 25, 10), U256::ZERO);
        assert_eq!(compute_payout(U256::from(1_000_000u64), 10_000, 0, 0), U256::ZERO);
    }

    #[test]
    fn test_monotonic_in_severity_and_capped() {
        let cap = U256::from(800_000_000u64);
        let mut previous = U256::ZERO;
        for severity in (0..60_000u32).step_by(37) {
            let payout = compute_payout(cap, 5_000, 25, severity);
            assert!(payout >= previous, "payout decreased at severity {severity}");
            assert!(payout <= cap);
            previous = payout;
        }
    }

    #[test]
    fn test_cap_clamp() {
        // k * severity / 1e8 > 1 => clamp to cap
        let cap = U256::from(1_000u64);
        assert_eq!(compute_payout(cap, 10_000, 0, 20_000), cap);
    }

    #[test]
    fn test_floor_division() {
        // 1000 * 5000 * 1 / 1e8 = 0.05 -> floors to 0
        assert_eq!(compute_payout(U256::from(1_000u64), 5_000, 0, 1), U256::ZERO);
        // 30000 * 5000 * 1 / 1e8 = 1.5 -> floors to 1
        assert_eq!(compute_payout(U256::from(30_000u64), 5_000, 0, 1), U256::from(1u64));
    }

    #[test]
    fn test_overflow_clamps_to_cap() {
        let payout = compute_payout(U256::MAX, 10_000, 0, 60_000);
        assert_eq!(payout, U256::MAX);
    }

    #[test]
    fn test_breakdown_flags() {
        let below = compute_payout_breakdown(U256::from(1_000u64), 5_000, 25, 20);
        assert_eq!(below.severity_applied_bps, 0);
        assert!(!below.cap_applied);

        let capped = compute_payout_breakdown(U256::from(1_000u64), 10_000, 0, 20_000);
        assert_eq!(capped.severity_applied_bps, 20_000);
        assert!(capped.cap_applied);

        let plain = compute_payout_breakdown(U256::from(800_000_000u64), 5_000, 25, 150);
        assert_eq!(plain.severity_applied_bps, 125);
        assert!(!plain.cap_applied);
    }
}
