//! End-to-end depeg lifecycle: a sustained reserve imbalance opens a
//! risk window after the grace period, severity ratchets while the
//! window is open, recovery resolves it, and a signed claim can be
//! produced against the resolved window.

use std::sync::Arc;

use alloy::primitives::Address;
use tempfile::tempdir;

use liquidityguard::claims::{ClaimService, Policy};
use liquidityguard::detector::{Guard, HysteresisDetector};
use liquidityguard::sampler::WindowTracker;
use liquidityguard::signing::AttestationSigner;
use liquidityguard::snapshot::SnapshotStore;
use liquidityguard::store::{EventStore, PoolSample, RiskState};
use liquidityguard::webhook::WebhookEmitter;

const T0: i64 = 1_700_000_000;
const TEST_KEY: &str = "0x0123456789012345678901234567890123456789012345678901234567890123";

fn sample(ts: i64, r_bps: i64, loss_bps: i64) -> PoolSample {
    PoolSample {
        pool_id: "curve-3pool".to_string(),
        chain_id: 1,
        timestamp: ts,
        block_number: 18_000_000 + ((ts - T0) / 12) as u64,
        reserve_base: 480_000.0,
        reserve_quote: 520_000.0,
        total_supply: 998_000.0,
        price: 1.0 - loss_bps as f64 / 10_000.0,
        r_bps,
        loss_quote_bps: loss_bps,
        twap_bps: 9_980,
    }
}

#[tokio::test]
async fn test_depeg_window_to_signed_claim() {
    let dir = tempdir().unwrap();
    let store = EventStore::open_memory().unwrap();
    let snapshots = Arc::new(SnapshotStore::new(dir.path()).unwrap());
    let mut tracker = WindowTracker::new(
        "curve-3pool".to_string(),
        1,
        "DEPEG_LP".to_string(),
        HysteresisDetector::new(9_500, 600, Guard::Min),
        store.clone(),
        snapshots,
        Arc::new(WebhookEmitter::disabled()),
    );

    // Sustained breach: samples every 60s below the 9500 floor. The
    // window must not open before the grace period has elapsed.
    let breach = [
        (T0, 9_480, 40),
        (T0 + 60, 9_470, 55),
        (T0 + 120, 9_460, 70),
        (T0 + 180, 9_440, 90),
        (T0 + 240, 9_430, 110),
        (T0 + 300, 9_420, 150),
        (T0 + 360, 9_440, 120),
        (T0 + 420, 9_450, 95),
        (T0 + 480, 9_460, 80),
        (T0 + 540, 9_470, 60),
    ];
    for (ts, r, loss) in breach {
        tracker.apply(&sample(ts, r, loss), r).await;
        assert!(tracker.active_risk_id().is_none(), "opened early at {ts}");
    }

    // At T0+600 the breach has lasted exactly the grace period; the
    // window opens and is backdated to the first breaching sample.
    tracker.apply(&sample(T0 + 600, 9_460, 65), 9_460).await;
    let risk_id = format!("curve-3pool|{T0}");
    assert_eq!(tracker.active_risk_id(), Some(risk_id.as_str()));

    let open = store.latest_risk(&risk_id).unwrap().unwrap();
    assert_eq!(open.state, RiskState::Open);
    assert_eq!(open.window_start, T0);

    // Recovery at T0+1200 resolves the window with the ratcheted
    // worst-case severity from T0+300.
    tracker.apply(&sample(T0 + 900, 9_430, 130), 9_430).await;
    tracker.apply(&sample(T0 + 1_200, 9_610, 0), 9_610).await;

    let resolved = store.latest_risk(&risk_id).unwrap().unwrap();
    assert_eq!(resolved.state, RiskState::Resolved);
    assert_eq!(resolved.window_end, Some(T0 + 1_200));
    assert_eq!(resolved.severity_bps, 150);

    let labels: Vec<String> = store
        .snapshots_for(&risk_id)
        .unwrap()
        .into_iter()
        .map(|s| s.label)
        .collect();
    assert_eq!(labels, vec!["DEPEG_START", "DEPEG_END"]);

    // Claim against the resolved window.
    let signer = AttestationSigner::from_hex(TEST_KEY).unwrap();
    let service = ClaimService::new(store.clone(), Some(signer), Some(Address::ZERO), 1);
    let policy = Policy {
        policy_id: "42".to_string(),
        risk_id: risk_id.clone(),
        owner: "0x000000000000000000000000000000000000beef".to_string(),
        insured_amount: "1000000000".to_string(),
        coverage_cap: "800000000".to_string(),
        deductible_bps: 25,
        k_bps: 5_000,
        start_at: T0 - 86_400,
        active_at: T0 - 86_400,
        end_at: T0 + 86_400,
        claimed_up_to: "0".to_string(),
    };

    let preview = service.preview_at(&policy, T0 + 2_000).unwrap();
    assert_eq!(preview.severity_bps, 150);
    // floor(800_000_000 * 5000 * (150 - 25) / 1e8) = 5_000_000
    assert_eq!(preview.payout, "5000000");
    assert_eq!(preview.cur_value, "995000000");
    assert!(!preview.coverage_cap_applied);
    assert_eq!(preview.window_end, T0 + 1_200);
    assert_eq!(preview.snapshots.len(), 2);

    let claim = service.sign_at(&policy, None, T0 + 2_000).unwrap();
    assert_eq!(claim.nonce, 1);
    assert!(claim.signature.starts_with("0x"));
    assert_eq!(claim.signature.len(), 132);
    assert_eq!(claim.expires_at, T0 + 2_000 + 3_600);
    assert_eq!(claim.typed_data.domain.name, "LiquidityGuardPayout");
    assert_eq!(claim.typed_data.message.payout, "5000000");

    // Replay protection: a second attestation gets a fresh nonce.
    let again = service.sign_at(&policy, None, T0 + 2_100).unwrap();
    assert_eq!(again.nonce, 2);
    assert_ne!(again.signature, claim.signature);
    assert_eq!(store.claim_count(&risk_id).unwrap(), 2);
}
