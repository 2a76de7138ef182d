//! Claim preview and signed attestation issuance.
//!
//! `preview` is computation-only. `sign` consumes a nonce and persists
//! a claim record before the signature leaves this module; an
//! attestation is never returned without its audit trail row. All
//! preconditions are checked before any nonce is consumed.

use alloy::primitives::{Address, U256};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::{GuardError, Result};
use crate::payout::compute_payout_breakdown;
use crate::signing::{self, AttestationSigner, ClaimPayload};
use crate::store::{ClaimRecord, EventStore, SnapshotRecord};

const DEFAULT_DEADLINE_SECS: i64 = 3_600;

fn default_k_bps() -> u32 {
    5_000
}

fn default_amount() -> String {
    "0".to_string()
}

/// Caller-supplied coverage terms. Read-only input, never persisted
/// by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub policy_id: String,
    pub risk_id: String,
    pub owner: String,
    pub insured_amount: String,
    pub coverage_cap: String,
    pub deductible_bps: u32,
    #[serde(default = "default_k_bps")]
    pub k_bps: u32,
    pub start_at: i64,
    pub active_at: i64,
    pub end_at: i64,
    #[serde(default = "default_amount")]
    pub claimed_up_to: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimPreview {
    pub policy_id: String,
    pub risk_id: String,
    pub window_start: i64,
    /// 0 while the window is still open.
    pub window_end: i64,
    pub severity_bps: u32,
    pub ref_value: String,
    pub cur_value: String,
    pub payout: String,
    pub deductible_applied_bps: u32,
    pub coverage_cap_applied: bool,
    pub min_r_bps: Option<i64>,
    pub avg_twap_bps: Option<f64>,
    pub samples: i64,
    pub snapshots: Vec<SnapshotRecord>,
}

/// JSON mirror of the EIP-712 structure a verifier needs to recompute
/// the digest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTypedData {
    pub domain: TypedDomain,
    pub primary_type: &'static str,
    pub message: TypedMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedDomain {
    pub name: &'static str,
    pub version: &'static str,
    pub chain_id: u64,
    pub verifying_contract: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedMessage {
    pub policy_id: String,
    pub risk_id: String,
    pub window_start: u64,
    pub window_end: u64,
    pub severity_bps: u32,
    pub ref_value: String,
    pub cur_value: String,
    pub payout: String,
    pub nonce: u64,
    pub deadline: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedClaim {
    pub policy_id: String,
    pub risk_id: String,
    pub signature: String,
    pub nonce: u64,
    pub expires_at: i64,
    pub typed_data: ClaimTypedData,
    pub preview: ClaimPreview,
}

fn parse_amount(field: &str, value: &str) -> Result<U256> {
    value
        .parse()
        .map_err(|e| GuardError::Internal(anyhow::anyhow!("invalid {field} amount {value}: {e}")))
}

pub struct ClaimService {
    store: EventStore,
    signer: Option<AttestationSigner>,
    verifier: Option<Address>,
    chain_id: u64,
}

impl ClaimService {
    pub fn new(
        store: EventStore,
        signer: Option<AttestationSigner>,
        verifier: Option<Address>,
        chain_id: u64,
    ) -> Self {
        Self {
            store,
            signer,
            verifier,
            chain_id,
        }
    }

    pub fn preview(&self, policy: &Policy) -> Result<ClaimPreview> {
        self.preview_at(policy, Utc::now().timestamp())
    }

    /// Compute a claim preview against the window state at `now`.
    pub fn preview_at(&self, policy: &Policy, now: i64) -> Result<ClaimPreview> {
        let risk = self
            .store
            .latest_risk(&policy.risk_id)?
            .ok_or_else(|| GuardError::RiskNotFound(policy.risk_id.clone()))?;

        // Still-open windows aggregate up to "now" provisionally.
        let metrics_end = risk.window_end.unwrap_or(now);
        let metrics = self
            .store
            .window_metrics(&risk.pool_id, risk.window_start, metrics_end)?;

        // Empty aggregates fall back to the window's recorded severity.
        let severity_bps = metrics
            .max_loss_bps
            .unwrap_or(risk.severity_bps)
            .max(0) as u32;

        let insured = parse_amount("insured", &policy.insured_amount)?;
        let coverage_cap = parse_amount("coverage cap", &policy.coverage_cap)?;
        let breakdown =
            compute_payout_breakdown(coverage_cap, policy.k_bps, policy.deductible_bps, severity_bps);
        let cur_value = insured.saturating_sub(breakdown.amount);

        Ok(ClaimPreview {
            policy_id: policy.policy_id.clone(),
            risk_id: policy.risk_id.clone(),
            window_start: risk.window_start,
            window_end: risk.window_end.unwrap_or(0),
            severity_bps,
            ref_value: insured.to_string(),
            cur_value: cur_value.to_string(),
            payout: breakdown.amount.to_string(),
            deductible_applied_bps: breakdown.severity_applied_bps,
            coverage_cap_applied: breakdown.cap_applied,
            min_r_bps: metrics.min_r_bps,
            avg_twap_bps: metrics.avg_twap_bps,
            samples: metrics.samples,
            snapshots: self.store.snapshots_for(&policy.risk_id)?,
        })
    }

    pub fn sign(&self, policy: &Policy, deadline: Option<i64>) -> Result<SignedClaim> {
        self.sign_at(policy, deadline, Utc::now().timestamp())
    }

    /// Produce a signed, nonced attestation for the policy's window.
    pub fn sign_at(&self, policy: &Policy, deadline: Option<i64>, now: i64) -> Result<SignedClaim> {
        // Preconditions fail before any nonce is consumed.
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| GuardError::Configuration("signer key not configured".to_string()))?;
        let verifier = self
            .verifier
            .ok_or_else(|| GuardError::Configuration("payout verifier not configured".to_string()))?;

        let preview = self.preview_at(policy, now)?;
        // Re-fetch to defend against races between preview and sign.
        let risk = self
            .store
            .latest_risk(&policy.risk_id)?
            .ok_or_else(|| GuardError::RiskNotFound(policy.risk_id.clone()))?;

        let nonce = self.store.next_nonce(&policy.policy_id, &policy.risk_id, now)?;
        let deadline = deadline.unwrap_or(now + DEFAULT_DEADLINE_SECS);

        let policy_id_value: U256 = policy.policy_id.parse().map_err(|e| {
            GuardError::Internal(anyhow::anyhow!(
                "policy id {} is not numeric: {e}",
                policy.policy_id
            ))
        })?;
        let window_start = risk.window_start.max(0) as u64;
        let window_end = risk.window_end.unwrap_or(0).max(0) as u64;

        let payload = ClaimPayload {
            policyId: policy_id_value,
            riskId: signing::risk_id_digest(&policy.risk_id),
            windowStart: window_start,
            windowEnd: window_end,
            severityBps: U256::from(preview.severity_bps),
            refValue: parse_amount("insured", &preview.ref_value)?,
            curValue: parse_amount("current", &preview.cur_value)?,
            payout: parse_amount("payout", &preview.payout)?,
            nonce: U256::from(nonce),
            deadline: U256::from(deadline.max(0) as u64),
        };

        let domain = signing::claim_domain(self.chain_id, verifier);
        let signature = signer.sign(&domain, &payload)?;

        // The record must be durable before the signature is returned.
        let record = ClaimRecord {
            claim_id: Uuid::new_v4().to_string(),
            policy_id: policy.policy_id.clone(),
            risk_id: policy.risk_id.clone(),
            mode: "FINAL".to_string(),
            payout_amount: preview.payout.clone(),
            deductible_bps: policy.deductible_bps,
            coverage_cap: policy.coverage_cap.clone(),
            nonce,
            signature: signature.clone(),
            state: "SIGNED".to_string(),
            created_at: now,
        };
        self.store.insert_claim(&record)?;

        info!(
            risk_id = %policy.risk_id,
            policy_id = %policy.policy_id,
            nonce,
            payout = %preview.payout,
            "claim signed"
        );

        Ok(SignedClaim {
            policy_id: policy.policy_id.clone(),
            risk_id: policy.risk_id.clone(),
            signature,
            nonce,
            expires_at: deadline,
            typed_data: ClaimTypedData {
                domain: TypedDomain {
                    name: signing::DOMAIN_NAME,
                    version: signing::DOMAIN_VERSION,
                    chain_id: self.chain_id,
                    verifying_contract: format!("{verifier:#x}"),
                },
                primary_type: "ClaimPayload",
                message: TypedMessage {
                    policy_id: policy.policy_id.clone(),
                    risk_id: format!("{:#x}", signing::risk_id_digest(&policy.risk_id)),
                    window_start,
                    window_end,
                    severity_bps: preview.severity_bps,
                    ref_value: preview.ref_value.clone(),
                    cur_value: preview.cur_value.clone(),
                    payout: preview.payout.clone(),
                    nonce,
                    deadline,
                },
            },
            preview,
        })
    }
}
