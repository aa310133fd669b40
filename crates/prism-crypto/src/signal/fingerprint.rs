//! Safety numbers for out-of-band identity verification.

use sha2::{Digest, Sha512};

use crate::error::CryptoError;

const FINGERPRINT_VERSION: [u8; 2] = [0x00, 0x00];
const CHUNKS: usize = 6;

/// Safety number for a pair of identity keys, identical from either side.
///
/// Rendered as 12 space-separated groups of five digits, the smaller key's
/// 30 digits first.
pub fn safety_number(
    local_identity: &[u8],
    remote_identity: &[u8],
    iterations: u32,
) -> Result<String, CryptoError> {
    if local_identity.len() != 32 || remote_identity.len() != 32 {
        return Err(CryptoError::InvalidKey("identity keys must be 32 bytes".into()));
    }
    if iterations == 0 {
        return Err(CryptoError::Config("safety number needs at least one iteration".into()));
    }

    let (first, second) = if local_identity <= remote_identity {
        (local_identity, remote_identity)
    } else {
        (remote_identity, local_identity)
    };
    let digits = fingerprint_digits(first, iterations) + &fingerprint_digits(second, iterations);

    let groups: Vec<&str> = (0..digits.len())
        .step_by(5)
        .map(|start| &digits[start..start + 5])
        .collect();
    Ok(groups.join(" "))
}

fn fingerprint_digits(key: &[u8], iterations: u32) -> String {
    let mut hash = Sha512::new()
        .chain_update(FINGERPRINT_VERSION)
        .chain_update(key)
        .chain_update(key)
        .finalize();
    for _ in 1..iterations {
        hash = Sha512::new().chain_update(hash).chain_update(key).finalize();
    }

    let mut digits = String::with_capacity(CHUNKS * 5);
    for chunk in hash[..CHUNKS * 5].chunks_exact(5) {
        let value = chunk.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        digits.push_str(&format!("{:05}", value % 100_000));
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answer() {
        assert_eq!(
            safety_number(&[1u8; 32], &[2u8; 32], 5200).unwrap(),
            "90065 10035 03980 63284 48565 52618 09660 03372 41519 75212 31969 66406"
        );
        assert_eq!(
            safety_number(&[1u8; 32], &[2u8; 32], 1).unwrap(),
            "42942 92982 80281 95647 05528 71918 10907 43701 94075 77087 78994 71990"
        );
    }

    #[test]
    fn order_independent() {
        let a = [0x11u8; 32];
        let b = [0x99u8; 32];
        assert_eq!(
            safety_number(&a, &b, 100).unwrap(),
            safety_number(&b, &a, 100).unwrap()
        );
    }

    #[test]
    fn twelve_groups_of_five_digits() {
        let number = safety_number(&[3u8; 32], &[4u8; 32], 10).unwrap();
        let groups: Vec<&str> = number.split(' ').collect();
        assert_eq!(groups.len(), 12);
        assert!(groups
            .iter()
            .all(|g| g.len() == 5 && g.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn different_peer_different_number() {
        let me = [5u8; 32];
        assert_ne!(
            safety_number(&me, &[6u8; 32], 10).unwrap(),
            safety_number(&me, &[7u8; 32], 10).unwrap()
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(safety_number(&[1u8; 31], &[2u8; 32], 10).is_err());
        assert!(safety_number(&[1u8; 32], &[2u8; 32], 0).is_err());
    }
}
