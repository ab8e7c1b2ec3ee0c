// src/crypto.rs
//
// Signing primitive used to bind a sender to a transaction pair during the
// commit phase. Curve choice is an external concern (see DESIGN.md); this
// follows the teacher's identity module in using Ed25519.

use ed25519_dalek::{Keypair as DalekKeypair, PublicKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;

pub struct Keypair {
    inner: DalekKeypair,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Keypair {
            inner: DalekKeypair::generate(&mut csprng),
        }
    }

    pub fn public(&self) -> PublicKey {
        self.inner.public
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.inner.sign(msg)
    }
}

pub fn verify(pubkey: &PublicKey, msg: &[u8], signature: &Signature) -> bool {
    pubkey.verify(msg, signature).is_ok()
}
