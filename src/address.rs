//! Ark addresses: bech32m encoding of (server pubkey, user pubkey).

use std::fmt;
use std::str::FromStr;

use bitcoin::bech32::{self, Bech32m, Hrp};
use bitcoin::secp256k1::PublicKey;

use crate::config::Network;
use crate::error::{Result, WalletError};

const HRP_MAINNET: &str = "ark";
const HRP_TESTNET: &str = "tark";
const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArkAddress {
    testnet: bool,
    server_pubkey: PublicKey,
    user_pubkey: PublicKey,
}

impl ArkAddress {
    pub fn new(network: Network, server_pubkey: PublicKey, user_pubkey: PublicKey) -> Self {
        Self { testnet: !network.is_mainnet(), server_pubkey, user_pubkey }
    }

    pub fn server_pubkey(&self) -> PublicKey {
        self.server_pubkey
    }

    pub fn user_pubkey(&self) -> PublicKey {
        self.user_pubkey
    }

    pub fn is_testnet(&self) -> bool {
        self.testnet
    }

    /// Reject addresses minted for another network or another server.
    pub fn check_for(&self, network: Network, server_pubkey: &PublicKey) -> Result<()> {
        if self.testnet == network.is_mainnet() {
            return Err(WalletError::invalid(format!("ark address is not valid on {}", network.as_str())));
        }
        if &self.server_pubkey != server_pubkey {
            return Err(WalletError::invalid("ark address belongs to a different server"));
        }
        Ok(())
    }
}

impl fmt::Display for ArkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hrp = Hrp::parse(if self.testnet { HRP_TESTNET } else { HRP_MAINNET }).map_err(|_| fmt::Error)?;
        let mut payload = Vec::with_capacity(67);
        payload.push(VERSION);
        payload.extend_from_slice(&self.server_pubkey.serialize());
        payload.extend_from_slice(&self.user_pubkey.serialize());
        let encoded = bech32::encode::<Bech32m>(hrp, &payload).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

impl FromStr for ArkAddress {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        let (hrp, payload) = bech32::decode(s.trim()).map_err(|e| WalletError::invalid(format!("ark address: {}", e)))?;
        let testnet = match hrp.to_lowercase().as_str() {
            HRP_MAINNET => false,
            HRP_TESTNET => true,
            other => return Err(WalletError::invalid(format!("unknown ark address prefix {}", other))),
        };
        if payload.len() != 67 || payload[0] != VERSION {
            return Err(WalletError::invalid("unsupported ark address payload"));
        }
        let key = |bytes: &[u8]| {
            PublicKey::from_slice(bytes).map_err(|e| WalletError::invalid(format!("ark address key: {}", e)))
        };
        Ok(ArkAddress {
            testnet,
            server_pubkey: key(&payload[1..34])?,
            user_pubkey: key(&payload[34..67])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn key(b: u8) -> PublicKey {
        SecretKey::from_slice(&[b; 32]).unwrap().public_key(&Secp256k1::new())
    }

    #[test]
    fn test_address_encoding() {
        let addr = ArkAddress::new(Network::Regtest, key(1), key(2));
        let s = addr.to_string();
        assert!(s.starts_with("tark1"));
        let parsed = ArkAddress::from_str(&s).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.user_pubkey(), key(2));

        let main = ArkAddress::new(Network::Bitcoin, key(1), key(2));
        assert!(main.to_string().starts_with("ark1"));
    }

    #[test]
    fn test_check_for() {
        let addr = ArkAddress::new(Network::Signet, key(1), key(2));
        assert!(addr.check_for(Network::Regtest, &key(1)).is_ok());
        assert!(addr.check_for(Network::Bitcoin, &key(1)).is_err());
        assert!(addr.check_for(Network::Signet, &key(3)).is_err());
    }

    #[test]
    fn test_rejects_other_prefix() {
        let hrp = Hrp::parse("bc").unwrap();
        let s = bech32::encode::<Bech32m>(hrp, &[1u8; 67]).unwrap();
        assert!(ArkAddress::from_str(&s).is_err());
    }
}
