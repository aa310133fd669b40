//! BIP-39 recovery phrases (12 words, 128-bit entropy).
//!
//! The 4-bit checksum is the top nibble of SHA-256(entropy). Seeds are
//! PBKDF2-HMAC-SHA512 over the phrase with salt `"mnemonic" + passphrase`.

use std::sync::OnceLock;

use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::primitives;

pub const WORD_COUNT: usize = 12;
pub const ENTROPY_LEN: usize = 16;
pub const SEED_LEN: usize = 64;

const BITS_PER_WORD: usize = 11;

static WORDLIST: OnceLock<Vec<&'static str>> = OnceLock::new();

/// The English BIP-39 word list, sorted.
pub fn wordlist() -> &'static [&'static str] {
    WORDLIST.get_or_init(|| include_str!("../../wordlist/english.txt").lines().collect())
}

fn word_index(word: &str) -> Option<usize> {
    wordlist()
        .binary_search_by(|probe| (*probe).cmp(word))
        .ok()
}

/// A validated 12-word phrase, held as its entropy.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Mnemonic {
    entropy: [u8; ENTROPY_LEN],
}

impl Mnemonic {
    /// Fresh phrase from 128 bits of OS randomness.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            entropy: primitives::random_bytes()?,
        })
    }

    pub fn from_entropy(entropy: &[u8; ENTROPY_LEN]) -> Self {
        Self { entropy: *entropy }
    }

    /// Parse and validate a phrase. Words are matched case-insensitively and
    /// may be separated by any whitespace.
    pub fn parse(phrase: &str) -> Result<Self, CryptoError> {
        let words: Vec<Zeroizing<String>> = phrase
            .split_whitespace()
            .map(|w| Zeroizing::new(w.to_lowercase()))
            .collect();
        if words.len() != WORD_COUNT {
            return Err(CryptoError::InvalidMnemonic(format!(
                "expected {WORD_COUNT} words, got {}",
                words.len()
            )));
        }

        // 132 bits: entropy followed by the checksum nibble.
        let mut bits = Zeroizing::new([0u8; ENTROPY_LEN + 1]);
        for (position, word) in words.iter().enumerate() {
            let index = word_index(word).ok_or_else(|| {
                CryptoError::InvalidMnemonic(format!(
                    "word {} is not in the word list",
                    position + 1
                ))
            })?;
            for bit in 0..BITS_PER_WORD {
                if index & (1 << (BITS_PER_WORD - 1 - bit)) != 0 {
                    let offset = position * BITS_PER_WORD + bit;
                    bits[offset / 8] |= 0x80 >> (offset % 8);
                }
            }
        }

        let mut entropy = [0u8; ENTROPY_LEN];
        entropy.copy_from_slice(&bits[..ENTROPY_LEN]);
        let mnemonic = Self { entropy };
        if bits[ENTROPY_LEN] != mnemonic.checksum() {
            return Err(CryptoError::InvalidMnemonic("checksum mismatch".into()));
        }
        Ok(mnemonic)
    }

    pub fn to_entropy(&self) -> &[u8; ENTROPY_LEN] {
        &self.entropy
    }

    fn checksum(&self) -> u8 {
        Sha256::digest(self.entropy)[0] & 0xF0
    }

    /// The 12 words in order.
    pub fn words(&self) -> Vec<&'static str> {
        let mut bits = Zeroizing::new([0u8; ENTROPY_LEN + 1]);
        bits[..ENTROPY_LEN].copy_from_slice(&self.entropy);
        bits[ENTROPY_LEN] = self.checksum();

        let list = wordlist();
        (0..WORD_COUNT)
            .map(|position| {
                let index = (0..BITS_PER_WORD).fold(0usize, |acc, bit| {
                    let offset = position * BITS_PER_WORD + bit;
                    let set = bits[offset / 8] & (0x80 >> (offset % 8)) != 0;
                    (acc << 1) | usize::from(set)
                });
                list[index]
            })
            .collect()
    }

    /// Words joined by single spaces.
    pub fn phrase(&self) -> Zeroizing<String> {
        Zeroizing::new(self.words().join(" "))
    }

    /// 64-byte seed for this phrase and `passphrase`.
    pub fn to_seed(
        &self,
        passphrase: &str,
        rounds: u32,
    ) -> Result<Zeroizing<[u8; SEED_LEN]>, CryptoError> {
        if rounds == 0 {
            return Err(CryptoError::Config("PBKDF2 needs at least one round".into()));
        }
        let phrase = self.phrase();
        let salt = Zeroizing::new(format!("mnemonic{passphrase}"));
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha512>(phrase.as_bytes(), salt.as_bytes(), rounds, &mut seed[..]);
        Ok(seed)
    }
}

impl std::fmt::Debug for Mnemonic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Mnemonic(..)")
    }
}

/// Generate a fresh 12-word phrase.
pub fn generate_mnemonic() -> Result<Mnemonic, CryptoError> {
    Mnemonic::generate()
}

/// Word count, word list membership and checksum.
pub fn validate_mnemonic(phrase: &str) -> bool {
    Mnemonic::parse(phrase).is_ok()
}

/// Validate `phrase` and derive its 64-byte seed.
pub fn mnemonic_to_seed(
    phrase: &str,
    passphrase: &str,
    rounds: u32,
) -> Result<Zeroizing<[u8; SEED_LEN]>, CryptoError> {
    Mnemonic::parse(phrase)?.to_seed(passphrase, rounds)
}
