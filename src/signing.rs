//! EIP-712 typed attestation signing.
//!
//! The payload layout and domain must match the verifier contract that
//! recomputes the digest independently; field order here is load-bearing.

use alloy::{
    primitives::{keccak256, Address, B256},
    signers::{local::PrivateKeySigner, SignerSync},
    sol,
    sol_types::{eip712_domain, Eip712Domain, SolStruct},
};

use crate::errors::{GuardError, Result};

sol! {
    /// Attestation message consumed by the payout verifier.
    #[derive(Debug)]
    struct ClaimPayload {
        uint256 policyId;
        bytes32 riskId;
        uint64 windowStart;
        uint64 windowEnd;
        uint256 severityBps;
        uint256 refValue;
        uint256 curValue;
        uint256 payout;
        uint256 nonce;
        uint256 deadline;
    }
}

pub const DOMAIN_NAME: &str = "LiquidityGuardPayout";
pub const DOMAIN_VERSION: &str = "1";

/// Domain-separated signing context for one chain + verifier pair.
pub fn claim_domain(chain_id: u64, verifying_contract: Address) -> Eip712Domain {
    eip712_domain! {
        name: DOMAIN_NAME,
        version: DOMAIN_VERSION,
        chain_id: chain_id,
        verifying_contract: verifying_contract,
    }
}

/// Stable bytes32 form of a human-readable risk id.
pub fn risk_id_digest(risk_id: &str) -> B256 {
    keccak256(risk_id.as_bytes())
}

/// EIP-712 digest a verifier must reproduce for this payload.
pub fn signing_digest(domain: &Eip712Domain, payload: &ClaimPayload) -> B256 {
    payload.eip712_signing_hash(domain)
}

pub struct AttestationSigner {
    signer: PrivateKeySigner,
}

impl AttestationSigner {
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|e| GuardError::Configuration(format!("invalid signer key: {e}")))?;
        Ok(Self { signer })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Sign the typed payload; returns the 65-byte signature as 0x-hex.
    pub fn sign(&self, domain: &Eip712Domain, payload: &ClaimPayload) -> Result<String> {
        let digest = signing_digest(domain, payload);
        let signature = self
            .signer
            .sign_hash_sync(&digest)
            .map_err(|e| GuardError::Internal(anyhow::anyhow!("signing failed: {e}")))?;
        Ok(format!("0x{}", hex::encode(signature.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    const TEST_KEY: &str = "0x0123456789012345678901234567890123456789012345678901234567890123";

    fn payload(nonce: u64) -> ClaimPayload {
        ClaimPayload {
            policyId: U256::from(7u64),
            riskId: risk_id_digest("curve-pool|1000"),
            windowStart: 1_000,
            windowEnd: 2_200,
            severityBps: U256::from(150u64),
            refValue: U256::from(1_000_000_000u64),
            curValue: U256::from(995_000_000u64),
            payout: U256::from(5_000_000u64),
            nonce: U256::from(nonce),
            deadline: U256::from(9_999_999_999u64),
        }
    }

    #[test]
    fn test_digest_is_deterministic_and_nonce_sensitive() {
        let domain = claim_domain(1, Address::ZERO);
        assert_eq!(
            signing_digest(&domain, &payload(1)),
            signing_digest(&domain, &payload(1))
        );
        assert_ne!(
            signing_digest(&domain, &payload(1)),
            signing_digest(&domain, &payload(2))
        );
    }

    #[test]
    fn test_domain_separation() {
        let d1 = claim_domain(1, Address::ZERO);
        let d2 = claim_domain(137, Address::ZERO);
        assert_ne!(
            signing_digest(&d1, &payload(1)),
            signing_digest(&d2, &payload(1))
        );
    }

    #[test]
    fn test_signature_recovers_to_signer() {
        let signer = AttestationSigner::from_hex(TEST_KEY).unwrap();
        let domain = claim_domain(1, Address::ZERO);
        let payload = payload(1);
        let digest = signing_digest(&domain, &payload);

        let signature_hex = signer.sign(&domain, &payload).unwrap();
        let bytes = hex::decode(signature_hex.trim_start_matches("0x")).unwrap();
        assert_eq!(bytes.len(), 65);

        let signature = alloy::primitives::Signature::from_raw(&bytes).unwrap();
        let recovered = signature.recover_address_from_prehash(&digest).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_bad_key_is_configuration_error() {
        assert!(matches!(
            AttestationSigner::from_hex("not-a-key"),
            Err(GuardError::Configuration(_))
        ));
    }
}
