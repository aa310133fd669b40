use serde::{Deserialize, Serialize};

use crate::CryptoError;

/// Tunables for the protocol core.
///
/// Every field has a production default; a JSON document only needs to name
/// the fields it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// One-time prekeys generated at account creation and per replenishment.
    pub prekey_batch_size: u32,
    /// Replenish the pool when it drops below this many keys.
    pub prekey_low_water_mark: u32,
    /// Signed prekeys older than this should be rotated.
    pub signed_prekey_max_age_secs: u64,
    /// Device id advertised in prekey bundles.
    pub device_id: u32,
    /// SHA-512 iterations per identity for safety numbers.
    pub safety_number_iterations: u32,
    /// PBKDF2-HMAC-SHA512 rounds for mnemonic → seed.
    pub mnemonic_pbkdf2_rounds: u32,
    /// Argon2id cost for sealing the recovery seed under a PIN.
    pub backup_kdf: KdfParams,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            prekey_batch_size: 100,
            prekey_low_water_mark: 20,
            signed_prekey_max_age_secs: 7 * 24 * 60 * 60,
            device_id: 1,
            safety_number_iterations: 5200,
            mnemonic_pbkdf2_rounds: 2048,
            backup_kdf: KdfParams::default(),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    pub(crate) fn to_argon2(self) -> Result<argon2::Params, CryptoError> {
        argon2::Params::new(self.memory_kib, self.iterations, self.parallelism, Some(32))
            .map_err(|e| CryptoError::Config(format!("invalid argon2 parameters: {e}")))
    }
}

impl ProtocolConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CryptoError::Config(format!("parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.prekey_batch_size == 0 {
            return Err(CryptoError::Config("prekey_batch_size must be at least 1".into()));
        }
        if self.prekey_low_water_mark >= self.prekey_batch_size {
            return Err(CryptoError::Config(
                "prekey_low_water_mark must be below prekey_batch_size".into(),
            ));
        }
        if self.signed_prekey_max_age_secs == 0 {
            return Err(CryptoError::Config(
                "signed_prekey_max_age_secs must be positive".into(),
            ));
        }
        if self.device_id == 0 {
            return Err(CryptoError::Config("device_id must be at least 1".into()));
        }
        if self.safety_number_iterations == 0 {
            return Err(CryptoError::Config(
                "safety_number_iterations must be at least 1".into(),
            ));
        }
        if self.mnemonic_pbkdf2_rounds < 2048 {
            return Err(CryptoError::Config(
                "mnemonic_pbkdf2_rounds must be at least 2048".into(),
            ));
        }
        self.backup_kdf.to_argon2()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProtocolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.prekey_batch_size, 100);
        assert_eq!(config.prekey_low_water_mark, 20);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ProtocolConfig::from_json(r#"{ "prekey_batch_size": 10, "prekey_low_water_mark": 2 }"#)
            .unwrap();
        assert_eq!(config.prekey_batch_size, 10);
        assert_eq!(config.prekey_low_water_mark, 2);
        assert_eq!(config.mnemonic_pbkdf2_rounds, 2048);
    }

    #[test]
    fn rejects_inconsistent_values() {
        assert!(ProtocolConfig::from_json(r#"{ "prekey_low_water_mark": 100 }"#).is_err());
        assert!(ProtocolConfig::from_json(r#"{ "mnemonic_pbkdf2_rounds": 10 }"#).is_err());
        assert!(ProtocolConfig::from_json(r#"{ "backup_kdf": { "memory_kib": 1 } }"#).is_err());
        assert!(ProtocolConfig::from_json("not json").is_err());
    }
}
