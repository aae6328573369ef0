//! Key management - Ark keychain derived from the wallet seed.
//!
//! Layout: `m/350/i` (non-hardened) from the BIP32 master of the BIP39 seed.
//! The onchain wallet uses BIP84 paths from the same master, so the two
//! keychains never overlap.

use std::str::FromStr;

use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, Fingerprint, Xpriv};
use bitcoin::secp256k1::{ecdsa, All, Keypair, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sign_message::signed_msg_hash;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::Network;
use crate::error::{Result, WalletError};

/// BIP32 purpose index of the Ark keychain.
pub const ARK_PURPOSE_INDEX: u32 = 350;

const PAYMENT_SECRET_TAG: &[u8] = b"arkwallet/payment-secret";
const PREIMAGE_TAG: &[u8] = b"arkwallet/preimage";

/// A derived keypair. The secret is wiped when the value is dropped.
pub struct KeyPair {
    pub index: u32,
    pub public_key: PublicKey,
    secret_key: SecretKey,
}

impl KeyPair {
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Serialisable view for diagnostics and backups.
    pub fn peek(&self) -> KeyPairView {
        KeyPairView {
            index: self.index,
            public_key: self.public_key.to_string(),
            secret_key: self.secret_hex(),
        }
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.secret_key.non_secure_erase();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("index", &self.index)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairView {
    pub index: u32,
    pub public_key: String,
    pub secret_key: String,
}

/// ECDSA signature over the Bitcoin signed-message hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSignature {
    /// DER, hex encoded.
    pub signature: String,
    pub public_key: String,
    pub index: u32,
}

/// Owns the seed; derives every Ark key on demand.
pub struct KeyManager {
    seed: Zeroizing<[u8; 64]>,
    network: Network,
    fingerprint: Fingerprint,
    ark_root: Xpriv,
    secp: Secp256k1<All>,
}

impl KeyManager {
    pub fn from_mnemonic(mnemonic: &Mnemonic, network: Network) -> Result<Self> {
        Self::from_seed(&mnemonic.to_seed(""), network)
    }

    pub fn from_seed(seed: &[u8; 64], network: Network) -> Result<Self> {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network.to_bitcoin(), seed)
            .map_err(|e| WalletError::KeyDerivation(format!("master key: {}", e)))?;
        let ark_root = master
            .derive_priv(&secp, &[child(ARK_PURPOSE_INDEX)?])
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
        Ok(Self {
            seed: Zeroizing::new(*seed),
            network,
            fingerprint: master.fingerprint(&secp),
            ark_root,
            secp,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Master key fingerprint, used to check a mnemonic against a datadir.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub(crate) fn seed(&self) -> &[u8; 64] {
        &self.seed
    }

    pub(crate) fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// Deterministic keypair at `m/350/index`.
    pub fn derive_keypair(&self, index: u32) -> Result<KeyPair> {
        let xpriv = self
            .ark_root
            .derive_priv(&self.secp, &[child(index)?])
            .map_err(|e| WalletError::KeyDerivation(e.to_string()))?;
        Ok(to_keypair(index, &xpriv, &self.secp))
    }

    pub fn sign_message(&self, message: &str, index: u32) -> Result<MessageSignature> {
        let keypair = self.derive_keypair(index)?;
        let signature = self.secp.sign_ecdsa(&message_digest(message), keypair.secret_key());
        Ok(MessageSignature {
            signature: signature.to_string(),
            public_key: keypair.public_key.to_string(),
            index,
        })
    }

    /// Secret handed to the Ark server alongside a Lightning receive.
    pub fn payment_secret(&self, payment_hash: &[u8; 32]) -> [u8; 32] {
        self.tagged_hmac(PAYMENT_SECRET_TAG, payment_hash)
    }

    /// Preimage of the `index`-th Lightning receive. Recoverable from the
    /// mnemonic alone.
    pub fn preimage(&self, index: u32) -> [u8; 32] {
        self.tagged_hmac(PREIMAGE_TAG, &index.to_be_bytes())
    }

    fn tagged_hmac(&self, tag: &[u8], data: &[u8]) -> [u8; 32] {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.seed[..])
            .expect("HMAC accepts any key length");
        mac.update(tag);
        mac.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

fn child(index: u32) -> Result<ChildNumber> {
    ChildNumber::from_normal_idx(index)
        .map_err(|_| WalletError::KeyDerivation(format!("index {} is out of the non-hardened range", index)))
}

fn to_keypair(index: u32, xpriv: &Xpriv, secp: &Secp256k1<All>) -> KeyPair {
    let keypair: Keypair = xpriv.to_keypair(secp);
    KeyPair {
        index,
        public_key: keypair.public_key(),
        secret_key: keypair.secret_key(),
    }
}

fn message_digest(message: &str) -> Message {
    use bitcoin::hashes::Hash;
    Message::from_digest(signed_msg_hash(message).to_byte_array())
}

/// Check a DER hex signature. Malformed signatures verify as `false`.
pub fn verify_message(message: &str, signature: &str, public_key: &PublicKey) -> bool {
    let Ok(signature) = ecdsa::Signature::from_str(signature.trim()) else {
        return false;
    };
    Secp256k1::verification_only()
        .verify_ecdsa(&message_digest(message), &signature, public_key)
        .is_ok()
}

/// Fresh 12-word mnemonic from OS randomness.
pub fn generate_mnemonic() -> Result<Mnemonic> {
    let mut entropy = Zeroizing::new([0u8; 16]);
    rand::rngs::OsRng.fill_bytes(&mut entropy[..]);
    Mnemonic::from_entropy(&entropy[..]).map_err(|e| WalletError::KeyDerivation(e.to_string()))
}

pub fn parse_mnemonic(words: &str) -> Result<Mnemonic> {
    Mnemonic::parse_normalized(words.trim()).map_err(|e| WalletError::invalid(format!("mnemonic: {}", e)))
}

/// Wallet-less derivation for hosts that only hold a mnemonic.
pub fn derive_keypair_from_mnemonic(mnemonic: &str, network: Network, index: u32) -> Result<KeyPair> {
    KeyManager::from_mnemonic(&parse_mnemonic(mnemonic)?, network)?.derive_keypair(index)
}

pub fn sign_message_with_mnemonic(message: &str, mnemonic: &str, network: Network, index: u32) -> Result<MessageSignature> {
    KeyManager::from_mnemonic(&parse_mnemonic(mnemonic)?, network)?.sign_message(message, index)
}

/// Parse a compressed public key given as hex.
pub fn parse_pubkey(value: &str) -> Result<PublicKey> {
    PublicKey::from_str(value.trim()).map_err(|e| WalletError::invalid(format!("public key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn manager() -> KeyManager {
        KeyManager::from_mnemonic(&parse_mnemonic(TEST_MNEMONIC).unwrap(), Network::Regtest).unwrap()
    }

    #[test]
    fn test_derivation_deterministic() {
        let a = manager();
        let b = manager();
        for index in [0, 1, 7, 1000] {
            assert_eq!(a.derive_keypair(index).unwrap().public_key, b.derive_keypair(index).unwrap().public_key);
        }
        assert_ne!(a.derive_keypair(0).unwrap().public_key, a.derive_keypair(1).unwrap().public_key);
    }

    #[test]
    fn test_matches_mnemonic_helper() {
        let from_manager = manager().derive_keypair(3).unwrap();
        let from_helper = derive_keypair_from_mnemonic(TEST_MNEMONIC, Network::Regtest, 3).unwrap();
        assert_eq!(from_manager.public_key, from_helper.public_key);
        assert_eq!(from_manager.secret_hex(), from_helper.secret_hex());
    }

    #[test]
    fn test_hardened_index_rejected() {
        let err = manager().derive_keypair(1 << 31).unwrap_err();
        assert!(matches!(err, WalletError::KeyDerivation(_)));
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = manager();
        let signed = keys.sign_message("hello ark", 2).unwrap();
        let pk = parse_pubkey(&signed.public_key).unwrap();
        assert!(verify_message("hello ark", &signed.signature, &pk));
        assert!(!verify_message("hello bark", &signed.signature, &pk));
        assert!(!verify_message("hello ark", "not-a-signature", &pk));

        let other = keys.derive_keypair(3).unwrap().public_key;
        assert!(!verify_message("hello ark", &signed.signature, &other));
    }

    #[test]
    fn test_sign_with_mnemonic_matches_wallet() {
        let a = manager().sign_message("msg", 0).unwrap();
        let b = sign_message_with_mnemonic("msg", TEST_MNEMONIC, Network::Regtest, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_mnemonic() {
        let m = generate_mnemonic().unwrap();
        assert_eq!(m.word_count(), 12);
        assert_ne!(m.to_string(), generate_mnemonic().unwrap().to_string());
    }

    #[test]
    fn test_invalid_mnemonic() {
        assert!(matches!(parse_mnemonic("not a mnemonic"), Err(WalletError::InvalidArgument(_))));
    }

    #[test]
    fn test_payment_secret_deterministic() {
        let keys = manager();
        assert_eq!(keys.payment_secret(&[1u8; 32]), keys.payment_secret(&[1u8; 32]));
        assert_ne!(keys.payment_secret(&[1u8; 32]), keys.payment_secret(&[2u8; 32]));
    }

    #[test]
    fn test_preimage_per_index() {
        let keys = manager();
        assert_eq!(keys.preimage(0), manager().preimage(0));
        assert_ne!(keys.preimage(0), keys.preimage(1));
        assert_ne!(keys.preimage(0), keys.payment_secret(&[0u8; 32]));
    }
}
