//! X3DH key agreement, initiator and responder halves.
//!
//! Both halves feed DH1‖DH2‖DH3[‖DH4] into HKDF-SHA256 (zero salt,
//! [`X3DH_INFO`]) and split 64 bytes into root key and chain key. The DH
//! order is part of the wire protocol.

use x25519_dalek::{PublicKey as X25519Public, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::primitives;
use crate::signal::prekeys::PreKeyBundle;

pub(crate) const X3DH_INFO: &[u8] = b"Prism-X3DH-v1";

/// Root key and initial chain key shared by both parties.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct X3dhOutput {
    pub(crate) root_key: [u8; 32],
    pub(crate) chain_key: [u8; 32],
}

/// Initiator result: the shared keys plus the ephemeral public key the
/// responder needs (the session's base key).
pub(crate) struct Initiated {
    pub(crate) keys: X3dhOutput,
    pub(crate) base_key: [u8; 32],
}

/// Run X3DH against a peer's bundle.
///
/// The bundle signature is checked first; nothing is derived from a bundle
/// that fails verification.
pub(crate) fn initiate(
    identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<Initiated, CryptoError> {
    // 1. Signed prekey must be signed by the bundle's identity
    bundle.verify_signature()?;

    // 2. Peer keys on Curve25519
    let their_identity = IdentityKeyPair::peer_x25519_public(&bundle.identity_key)?;
    let their_signed_prekey = x25519_public(&bundle.signed_prekey.public_key, "signed prekey")?;
    let their_one_time = bundle
        .prekey
        .as_ref()
        .map(|prekey| x25519_public(&prekey.public_key, "one-time prekey"))
        .transpose()?;

    // 3. Fresh ephemeral, used for this agreement only
    let ephemeral = StaticSecret::from(*Zeroizing::new(primitives::random_bytes::<32>()?));
    let base_key = X25519Public::from(&ephemeral).to_bytes();

    // 4. DH1 = DH(IK_A, SPK_B), DH2 = DH(EK_A, IK_B), DH3 = DH(EK_A, SPK_B), DH4 = DH(EK_A, OPK_B)
    let our_identity = identity.to_x25519_secret();
    let mut shared = vec![
        our_identity.diffie_hellman(&their_signed_prekey),
        ephemeral.diffie_hellman(&their_identity),
        ephemeral.diffie_hellman(&their_signed_prekey),
    ];
    if let Some(one_time) = &their_one_time {
        shared.push(ephemeral.diffie_hellman(one_time));
    }

    Ok(Initiated {
        keys: derive(&shared)?,
        base_key,
    })
}

/// Mirror of [`initiate`] run by the bundle owner.
pub(crate) fn respond(
    identity: &IdentityKeyPair,
    signed_prekey: &StaticSecret,
    one_time_prekey: Option<&StaticSecret>,
    their_identity_key: &[u8],
    base_key: &[u8; 32],
) -> Result<X3dhOutput, CryptoError> {
    let their_identity = IdentityKeyPair::peer_x25519_public(their_identity_key)?;
    let their_ephemeral = X25519Public::from(*base_key);
    let our_identity = identity.to_x25519_secret();

    let mut shared = vec![
        signed_prekey.diffie_hellman(&their_identity),
        our_identity.diffie_hellman(&their_ephemeral),
        signed_prekey.diffie_hellman(&their_ephemeral),
    ];
    if let Some(one_time) = one_time_prekey {
        shared.push(one_time.diffie_hellman(&their_ephemeral));
    }

    derive(&shared)
}

fn derive(shared: &[SharedSecret]) -> Result<X3dhOutput, CryptoError> {
    // Low-order peer points yield an all-zero secret.
    if shared.iter().any(|secret| !secret.was_contributory()) {
        return Err(CryptoError::InvalidKey("non-contributory DH output".into()));
    }

    let mut ikm = Zeroizing::new(Vec::with_capacity(shared.len() * 32));
    for secret in shared {
        ikm.extend_from_slice(secret.as_bytes());
    }

    let mut okm = Zeroizing::new([0u8; 64]);
    primitives::hkdf_sha256(&ikm, None, X3DH_INFO, &mut okm[..])?;

    let mut output = X3dhOutput {
        root_key: [0u8; 32],
        chain_key: [0u8; 32],
    };
    output.root_key.copy_from_slice(&okm[..32]);
    output.chain_key.copy_from_slice(&okm[32..]);
    Ok(output)
}

fn x25519_public(bytes: &[u8], what: &str) -> Result<X25519Public, CryptoError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{what} must be 32 bytes")))?;
    Ok(X25519Public::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::prekeys::{PreKeyPair, SignedPreKeyPair};

    struct Responder {
        identity: IdentityKeyPair,
        signed: SignedPreKeyPair,
        one_time: PreKeyPair,
    }

    fn responder() -> Responder {
        let identity = IdentityKeyPair::generate().unwrap();
        let signed = SignedPreKeyPair::generate(1, &identity, 0).unwrap();
        let one_time = PreKeyPair::generate(5).unwrap();
        Responder {
            identity,
            signed,
            one_time,
        }
    }

    fn bundle(r: &Responder, with_one_time: bool) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: 1,
            device_id: 1,
            identity_key: r.identity.public_key_bytes().to_vec(),
            signed_prekey: r.signed.to_public(),
            prekey: with_one_time.then(|| r.one_time.to_public()),
        }
    }

    #[test]
    fn both_sides_derive_same_keys() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = responder();

        for with_one_time in [true, false] {
            let initiated = initiate(&alice, &bundle(&bob, with_one_time)).unwrap();
            let responded = respond(
                &bob.identity,
                bob.signed.pair().secret(),
                with_one_time.then(|| bob.one_time.secret()),
                &alice.public_key_bytes(),
                &initiated.base_key,
            )
            .unwrap();
            assert_eq!(initiated.keys.root_key, responded.root_key);
            assert_eq!(initiated.keys.chain_key, responded.chain_key);
            assert_ne!(responded.root_key, responded.chain_key);
        }
    }

    #[test]
    fn one_time_key_changes_output() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = responder();
        let initiated = initiate(&alice, &bundle(&bob, true)).unwrap();
        let without = respond(
            &bob.identity,
            bob.signed.pair().secret(),
            None,
            &alice.public_key_bytes(),
            &initiated.base_key,
        )
        .unwrap();
        assert_ne!(initiated.keys.root_key, without.root_key);
    }

    #[test]
    fn fresh_ephemeral_per_agreement() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = responder();
        let a = initiate(&alice, &bundle(&bob, false)).unwrap();
        let b = initiate(&alice, &bundle(&bob, false)).unwrap();
        assert_ne!(a.base_key, b.base_key);
        assert_ne!(a.keys.root_key, b.keys.root_key);
    }

    #[test]
    fn tampered_bundle_rejected() {
        let alice = IdentityKeyPair::generate().unwrap();
        let bob = responder();
        let mut tampered = bundle(&bob, true);
        tampered.signed_prekey.public_key[3] ^= 0x40;
        assert!(matches!(
            initiate(&alice, &tampered),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn low_order_base_key_rejected() {
        let bob = responder();
        let alice = IdentityKeyPair::generate().unwrap();
        let result = respond(
            &bob.identity,
            bob.signed.pair().secret(),
            None,
            &alice.public_key_bytes(),
            &[0u8; 32],
        );
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }
}
