//! Minimal 32-byte-word ABI encoding for `eth_call` payloads.
//!
//! All the contract variants we probe take and return plain words
//! (indices, amounts, addresses), so we avoid a full ABI machinery and
//! compute selectors from signature strings with keccak256.

use alloy::primitives::keccak256;
use anyhow::{anyhow, Result};

pub type Word = [u8; 32];

/// First four bytes of the keccak256 of a canonical function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Build calldata: selector followed by the argument words.
pub fn encode_call(signature: &str, words: &[Word]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + words.len() * 32);
    data.extend_from_slice(&selector(signature));
    for word in words {
        data.extend_from_slice(word);
    }
    data
}

/// Right-aligned unsigned word. Also valid for the small non-negative
/// signed indices (`int128`/`int256`) the quote variants take, since
/// two's-complement encoding matches for non-negative values.
pub fn uint_word(value: u64) -> Word {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn u128_word(value: u128) -> Word {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Right-aligned 20-byte address word from a 0x-prefixed hex string.
pub fn address_word(address: &str) -> Result<Word> {
    let bytes = hex::decode(address.trim_start_matches("0x"))
        .map_err(|e| anyhow!("invalid address {address}: {e}"))?;
    if bytes.len() != 20 {
        return Err(anyhow!("invalid address length: {address}"));
    }
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&bytes);
    Ok(word)
}

fn word_at(bytes: &[u8], index: usize) -> Option<&[u8]> {
    let start = index * 32;
    bytes.get(start..start + 32)
}

/// Decode word `index` as u128. Fails if high bytes are set; the values
/// we read (balances, decimals, supplies) fit comfortably.
pub fn decode_u128(bytes: &[u8], index: usize) -> Option<u128> {
    let word = word_at(bytes, index)?;
    if word[..16].iter().any(|&b| b != 0) {
        return None;
    }
    Some(u128::from_be_bytes(word[16..].try_into().ok()?))
}

pub fn decode_u64(bytes: &[u8], index: usize) -> Option<u64> {
    let value = decode_u128(bytes, index)?;
    u64::try_from(value).ok()
}

/// Decode word `index` as a sign-extended i128 (tick cumulatives,
/// Chainlink answers).
pub fn decode_i128(bytes: &[u8], index: usize) -> Option<i128> {
    let word = word_at(bytes, index)?;
    let negative = word[0] & 0x80 != 0;
    let expected_fill = if negative { 0xff } else { 0x00 };
    if word[..16].iter().any(|&b| b != expected_fill) {
        return None;
    }
    Some(i128::from_be_bytes(word[16..].try_into().ok()?))
}

/// Decode word `index` as a 0x-prefixed lowercase address string.
pub fn decode_address(bytes: &[u8], index: usize) -> Option<String> {
    let word = word_at(bytes, index)?;
    if word[..12].iter().any(|&b| b != 0) {
        return None;
    }
    Some(format!("0x{}", hex::encode(&word[12..])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_selectors() {
        assert_eq!(selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(selector("totalSupply()"), [0x18, 0x16, 0x0d, 0xdd]);
        assert_eq!(selector("decimals()"), [0x31, 0x3c, 0xe5, 0x67]);
        assert_eq!(selector("latestRoundData()"), [0xfe, 0xaf, 0x96, 0x8c]);
    }

    #[test]
    fn test_word_roundtrip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&uint_word(7));
        bytes.extend_from_slice(&u128_word(u128::MAX / 2));
        assert_eq!(decode_u128(&bytes, 0), Some(7));
        assert_eq!(decode_u128(&bytes, 1), Some(u128::MAX / 2));
        assert_eq!(decode_u64(&bytes, 1), None);
    }

    #[test]
    fn test_signed_decode() {
        let mut word = [0xffu8; 32];
        word[16..].copy_from_slice(&(-42i128).to_be_bytes());
        assert_eq!(decode_i128(&word, 0), Some(-42));
        assert_eq!(decode_i128(&uint_word(42), 0), Some(42));
    }

    #[test]
    fn test_address_word_roundtrip() {
        let addr = "0xc907e116054ad103354f2d350fd2514433d57f6f";
        let word = address_word(addr).unwrap();
        assert_eq!(decode_address(&word, 0).as_deref(), Some(addr));
        assert!(address_word("0x1234").is_err());
    }
}
