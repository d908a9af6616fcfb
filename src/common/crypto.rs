use std::fmt;

use ed25519_dalek::{ed25519::signature::Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha256};

pub const HASH_LEN: usize = 32;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::finish(hasher)
    }

    pub fn finish(hasher: Sha256) -> Self {
        let result = hasher.finalize();
        let mut digest = [0u8; HASH_LEN];
        digest.copy_from_slice(&result[..]);
        Hash(digest)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

pub trait Hashable {
    fn hash(&self) -> Hash;
}

/// A message that can be signed.
///
/// Every signable kind carries its own tag, and the signed digest is
/// `sha256(TAG || hash)`, so a signature over one kind never verifies as
/// another kind with the same body hash.
pub trait Signable: Hashable {
    const TAG: &'static [u8];

    fn signing_digest(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(Self::TAG);
        hasher.update(self.hash().as_bytes());
        Hash::finish(hasher)
    }
}

#[derive(Clone)]
pub struct Keypair {
    pubkey: PublicKey,
    dalek_signer: SigningKey,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub key: [u8; 32],
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Signature {
    pub signer: PublicKey,
    pub sig: ed25519_dalek::Signature,
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Rebuilds a keypair from its 32-byte secret key.
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(dalek_signer: SigningKey) -> Self {
        let pubkey = PublicKey::from(&dalek_signer.verifying_key().to_bytes());
        Keypair {
            pubkey,
            dalek_signer,
        }
    }

    pub fn sign(&self, digest: &Hash) -> Signature {
        Signature {
            signer: self.pubkey,
            sig: self.dalek_signer.sign(digest.as_bytes()),
        }
    }

    pub fn pubkey(&self) -> PublicKey {
        self.pubkey
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("pubkey", &self.pubkey).finish_non_exhaustive()
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl From<&[u8; 32]> for PublicKey {
    fn from(bytes: &[u8; 32]) -> Self {
        PublicKey { key: *bytes }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.key[..4]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.key))
    }
}

impl Signature {
    pub fn verify(&self, digest: &Hash) -> bool {
        match VerifyingKey::from_bytes(&self.signer.key) {
            Ok(dalek_pubkey) => dalek_pubkey.verify_strict(digest.as_bytes(), &self.sig).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Note(u64);

    impl Hashable for Note {
        fn hash(&self) -> Hash {
            Hash::of(&self.0.to_be_bytes())
        }
    }

    impl Signable for Note {
        const TAG: &'static [u8] = b"note";
    }

    struct Memo(u64);

    impl Hashable for Memo {
        fn hash(&self) -> Hash {
            Hash::of(&self.0.to_be_bytes())
        }
    }

    impl Signable for Memo {
        const TAG: &'static [u8] = b"memo";
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::new_pair();
        let digest = Hash([4; 32]);
        let signature = keypair.sign(&digest);

        assert_eq!(signature.signer, keypair.pubkey);
        assert!(signature.verify(&digest));
        assert!(!signature.verify(&Hash([5; 32])));
    }

    #[test]
    fn test_from_secret_is_deterministic() {
        let a = Keypair::from_secret(&[7u8; 32]);
        let b = Keypair::from_secret(&[7u8; 32]);
        assert_eq!(a.pubkey(), b.pubkey());
    }

    #[test]
    fn test_domain_tags_separate_kinds() {
        let keypair = Keypair::new_pair();
        let note = Note(9);
        let memo = Memo(9);
        assert_eq!(note.hash(), memo.hash());

        let sig = keypair.sign(&note.signing_digest());
        assert!(sig.verify(&note.signing_digest()));
        assert!(!sig.verify(&memo.signing_digest()));
    }
}
