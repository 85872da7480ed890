//! Shared cryptographic primitives: SHA-256 hex hashing, recoverable ECDSA
//! signatures over protocol messages, and sealing of the player's secret
//! number at funding time.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ChaCha20Poly1305 for authenticated encryption of the funding secret
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

const SALT_SIZE: usize = 32;
const PBKDF2_ROUNDS: u32 = 100_000;

/// SHA-256 of a UTF-8 string, as lowercase hex.
///
/// All hash chains and commitments operate on the hex representation of the
/// previous element, so this is the single hashing entry point.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Checks that a commitment is a well-formed 32-byte lowercase hex digest.
pub fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Generates a random 32-byte secret, hex encoded.
pub fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A 20-byte account address derived from a secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; 20]);

impl Address {
    pub fn from_pubkey(pubkey: &PublicKey) -> Self {
        let digest = Sha256::digest(pubkey.serialize_uncompressed());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..]);
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// A signing identity for one party of a channel.
#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
    address: Address,
}

impl Keypair {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret, public) = secp.generate_keypair(&mut rand::thread_rng());
        let address = Address::from_pubkey(&public);
        Keypair {
            secret,
            public,
            address,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address)
            .finish()
    }
}

/// A recoverable ECDSA signature over a tightly packed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySig {
    /// 64-byte compact signature, hex encoded.
    pub compact: String,
    /// Recovery id (0-3).
    pub rec_id: i32,
}

fn message_digest(message: &str) -> Message {
    let digest: [u8; 32] = Sha256::digest(message.as_bytes()).into();
    Message::from_digest(digest)
}

/// Signs a message string, returning a signature the verifier can recover
/// the signer's address from.
pub fn sign_message(message: &str, keypair: &Keypair) -> RecoverySig {
    let secp = Secp256k1::new();
    let sig = secp.sign_ecdsa_recoverable(&message_digest(message), &keypair.secret);
    let (rec_id, compact) = sig.serialize_compact();
    RecoverySig {
        compact: hex::encode(compact),
        rec_id: rec_id.to_i32(),
    }
}

/// Recovers the address that signed a message.
pub fn recover_signer(message: &str, sig: &RecoverySig) -> crate::Result<Address> {
    let compact = hex::decode(&sig.compact).map_err(|_| crate::ChannelError::BadSignature)?;
    let rec_id =
        RecoveryId::from_i32(sig.rec_id).map_err(|_| crate::ChannelError::BadSignature)?;
    let sig = RecoverableSignature::from_compact(&compact, rec_id)
        .map_err(|_| crate::ChannelError::BadSignature)?;
    let secp = Secp256k1::new();
    let pubkey = secp
        .recover_ecdsa(&message_digest(message), &sig)
        .map_err(|_| crate::ChannelError::BadSignature)?;
    Ok(Address::from_pubkey(&pubkey))
}

/// The player's secret number, sealed for publication at funding time.
///
/// The plaintext stays recoverable by the player (the sealing key is derived
/// from material only they can produce) while the published record binds them
/// to the number they committed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Seal a secret string under a passphrase using ChaCha20Poly1305.
pub fn seal_secret(secret: &str, passphrase: &str) -> crate::Result<SealedSecret> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let key = derive_key(passphrase, &salt);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let cipher = ChaCha20Poly1305::new(&key);

    let ciphertext = cipher
        .encrypt(&nonce, secret.as_bytes())
        .map_err(|e| crate::ChannelError::crypto(format!("sealing failed: {}", e)))?;

    Ok(SealedSecret {
        salt: salt.to_vec(),
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Open a sealed secret with the passphrase it was sealed under.
pub fn open_secret(sealed: &SealedSecret, passphrase: &str) -> crate::Result<String> {
    let key = derive_key(passphrase, &sealed.salt);
    let cipher = ChaCha20Poly1305::new(&key);
    let nonce = Nonce::from_slice(&sealed.nonce);

    let plaintext = cipher
        .decrypt(nonce, sealed.ciphertext.as_ref())
        .map_err(|e| crate::ChannelError::crypto(format!("unsealing failed: {}", e)))?;

    String::from_utf8(plaintext)
        .map_err(|e| crate::ChannelError::crypto(format!("unsealed secret not utf-8: {}", e)))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Key {
    use pbkdf2::pbkdf2_hmac;

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    *Key::from_slice(&key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_roundtrip() {
        let keypair = Keypair::generate();
        let sig = sign_message("hello channel", &keypair);
        let recovered = recover_signer("hello channel", &sig).unwrap();
        assert_eq!(recovered, keypair.address());
    }

    #[test]
    fn recover_rejects_tampered_message() {
        let keypair = Keypair::generate();
        let sig = sign_message("hello channel", &keypair);
        let recovered = recover_signer("hello chann3l", &sig).unwrap();
        assert_ne!(recovered, keypair.address());
    }

    #[test]
    fn seal_and_open_secret() {
        let secret = random_secret();
        let sealed = seal_secret(&secret, "pass").unwrap();
        assert_eq!(open_secret(&sealed, "pass").unwrap(), secret);
        assert!(open_secret(&sealed, "wrong").is_err());
    }

    #[test]
    fn hex_digest_shape() {
        let h = sha256_hex("seed");
        assert!(is_hex_digest(&h));
        assert!(!is_hex_digest("abc"));
        assert!(!is_hex_digest(&h.to_uppercase()));
    }
}
