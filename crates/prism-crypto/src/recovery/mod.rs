pub mod backup;
pub mod mnemonic;

pub use backup::{open_seed, seal_seed};
pub use mnemonic::{generate_mnemonic, mnemonic_to_seed, validate_mnemonic, Mnemonic};
