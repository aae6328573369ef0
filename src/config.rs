//! Wallet configuration - passed from higher layers, immutable once a wallet is open.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WalletError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Bitcoin,
    Signet,
    Regtest,
}

impl Default for Network {
    fn default() -> Self { Self::Signet }
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Bitcoin => "bitcoin",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" => Some(Network::Bitcoin),
            "signet" => Some(Network::Signet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn to_bitcoin(&self) -> bitcoin::Network {
        match self {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(self, Network::Bitcoin)
    }
}

/// How to authenticate against bitcoind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitcoindAuth {
    Cookie(PathBuf),
    UserPass { user: String, pass: String },
}

/// Chain backend selection. Exactly one is active per wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ChainConfig {
    Esplora { url: String },
    Bitcoind { url: String, auth: BitcoindAuth },
}

impl ChainConfig {
    /// Build from loosely-typed host options. Empty strings count as absent.
    pub fn from_parts(
        esplora: Option<&str>,
        bitcoind: Option<&str>,
        bitcoind_cookie: Option<&str>,
        bitcoind_user: Option<&str>,
        bitcoind_pass: Option<&str>,
    ) -> Result<Self> {
        let esplora = non_empty(esplora);
        let bitcoind = non_empty(bitcoind);
        match (esplora, bitcoind) {
            (Some(_), Some(_)) => Err(WalletError::Configuration(
                "Both esplora and bitcoind are set, pick one chain source".into(),
            )),
            (None, None) => Err(WalletError::Configuration(
                "Provide either an esplora or a bitcoind url".into(),
            )),
            (Some(url), None) => Ok(ChainConfig::Esplora { url: normalize_url(url) }),
            (None, Some(url)) => {
                let auth = match (non_empty(bitcoind_cookie), non_empty(bitcoind_user), non_empty(bitcoind_pass)) {
                    (Some(cookie), _, _) => BitcoindAuth::Cookie(PathBuf::from(cookie)),
                    (None, Some(user), Some(pass)) => BitcoindAuth::UserPass { user: user.into(), pass: pass.into() },
                    _ => return Err(WalletError::Configuration(
                        "bitcoind needs either a cookie file or both user and pass".into(),
                    )),
                };
                Ok(ChainConfig::Bitcoind { url: normalize_url(url), auth })
            }
        }
    }

    pub fn url(&self) -> &str {
        match self {
            ChainConfig::Esplora { url } | ChainConfig::Bitcoind { url, .. } => url,
        }
    }
}

pub const DEFAULT_REFRESH_EXPIRY_THRESHOLD: u32 = 288;
pub const DEFAULT_HTLC_RECV_CLAIM_DELTA: u16 = 18;
pub const DEFAULT_VTXO_EXIT_MARGIN: u16 = 12;
pub const DEFAULT_ROUND_TX_REQUIRED_CONFIRMATIONS: u32 = 6;
pub const DEFAULT_LN_RECEIVE_WAIT_SECS: u64 = 30;

/// Wallet configuration. Higher layers construct this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConfig {
    pub network: Network,
    /// Ark server endpoint.
    pub server_url: String,
    pub chain: Option<ChainConfig>,
    /// First block the onchain wallet needs to scan.
    pub birthday_height: Option<u32>,
    /// VTXOs expiring within this many blocks get refreshed by maintenance.
    pub vtxo_refresh_expiry_threshold: u32,
    /// sat/vB used when the caller passes no fee rate.
    pub fallback_fee_rate: Option<u64>,
    /// Minimum blocks left before an inbound HTLC expires for it to be claimed.
    pub htlc_recv_claim_delta: u16,
    /// Extra blocks on top of a VTXO's exit delta before its exit is claimable.
    pub vtxo_exit_margin: u16,
    pub round_tx_required_confirmations: u32,
    /// Upper bound for `check_and_claim_ln_receive(.., wait = true)`.
    pub ln_receive_wait_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            server_url: String::new(),
            chain: None,
            birthday_height: None,
            vtxo_refresh_expiry_threshold: DEFAULT_REFRESH_EXPIRY_THRESHOLD,
            fallback_fee_rate: None,
            htlc_recv_claim_delta: DEFAULT_HTLC_RECV_CLAIM_DELTA,
            vtxo_exit_margin: DEFAULT_VTXO_EXIT_MARGIN,
            round_tx_required_confirmations: DEFAULT_ROUND_TX_REQUIRED_CONFIRMATIONS,
            ln_receive_wait_secs: DEFAULT_LN_RECEIVE_WAIT_SECS,
        }
    }
}

impl WalletConfig {
    pub fn new(network: Network) -> Self {
        Self { network, ..Default::default() }
    }
    pub fn mainnet() -> Self { Self::new(Network::Bitcoin) }
    pub fn signet() -> Self { Self::new(Network::Signet) }
    pub fn regtest() -> Self {
        Self { network: Network::Regtest, round_tx_required_confirmations: 1, ..Default::default() }
    }

    pub fn with_server(mut self, url: impl AsRef<str>) -> Self { self.server_url = normalize_url(url.as_ref()); self }
    pub fn with_esplora(mut self, url: impl AsRef<str>) -> Self {
        self.chain = Some(ChainConfig::Esplora { url: normalize_url(url.as_ref()) });
        self
    }
    pub fn with_bitcoind(mut self, url: impl AsRef<str>, auth: BitcoindAuth) -> Self {
        self.chain = Some(ChainConfig::Bitcoind { url: normalize_url(url.as_ref()), auth });
        self
    }
    pub fn with_birthday(mut self, height: u32) -> Self { self.birthday_height = Some(height); self }
    pub fn with_refresh_threshold(mut self, blocks: u32) -> Self { self.vtxo_refresh_expiry_threshold = blocks; self }
    pub fn with_fallback_fee_rate(mut self, sat_per_vb: u64) -> Self { self.fallback_fee_rate = Some(sat_per_vb); self }
    pub fn with_htlc_recv_claim_delta(mut self, blocks: u16) -> Self { self.htlc_recv_claim_delta = blocks; self }
    pub fn with_exit_margin(mut self, blocks: u16) -> Self { self.vtxo_exit_margin = blocks; self }
    pub fn with_round_confirmations(mut self, confs: u32) -> Self { self.round_tx_required_confirmations = confs; self }
    pub fn with_ln_receive_wait(mut self, secs: u64) -> Self { self.ln_receive_wait_secs = secs; self }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(WalletError::Configuration("Ark server url is required".into()));
        }
        if let Some(chain) = &self.chain {
            if chain.url().is_empty() {
                return Err(WalletError::Configuration("Chain backend url is empty".into()));
            }
        }
        if self.fallback_fee_rate == Some(0) {
            return Err(WalletError::Configuration("fallback_fee_rate must be at least 1 sat/vB".into()));
        }
        if self.vtxo_refresh_expiry_threshold == 0 {
            return Err(WalletError::Configuration("vtxo_refresh_expiry_threshold must be positive".into()));
        }
        if self.round_tx_required_confirmations == 0 {
            return Err(WalletError::Configuration("round_tx_required_confirmations must be positive".into()));
        }
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Prefix `https://` when the url carries no scheme.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() || url.contains("://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("ark.example.com"), "https://ark.example.com");
        assert_eq!(normalize_url("http://localhost:3535/"), "http://localhost:3535");
        assert_eq!(normalize_url(""), "");
    }

    #[test]
    fn test_chain_from_parts() {
        let esplora = ChainConfig::from_parts(Some("esplora.test"), Some(""), None, None, None).unwrap();
        assert_eq!(esplora, ChainConfig::Esplora { url: "https://esplora.test".into() });

        let rpc = ChainConfig::from_parts(None, Some("http://127.0.0.1:18443"), None, Some("u"), Some("p")).unwrap();
        assert!(matches!(rpc, ChainConfig::Bitcoind { auth: BitcoindAuth::UserPass { .. }, .. }));

        let cookie = ChainConfig::from_parts(None, Some("127.0.0.1:18443"), Some("/tmp/.cookie"), Some("u"), None).unwrap();
        assert!(matches!(cookie, ChainConfig::Bitcoind { auth: BitcoindAuth::Cookie(_), .. }));
    }

    #[test]
    fn test_chain_from_parts_rejects_ambiguous() {
        assert!(ChainConfig::from_parts(None, None, None, None, None).is_err());
        assert!(ChainConfig::from_parts(Some("a"), Some("b"), None, None, None).is_err());
        assert!(ChainConfig::from_parts(None, Some("b"), None, Some("user"), None).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(WalletConfig::regtest().validate().is_err());
        let config = WalletConfig::regtest().with_server("localhost:3535");
        assert!(config.validate().is_ok());
        assert!(config.clone().with_fallback_fee_rate(0).validate().is_err());
        assert_eq!(config.round_tx_required_confirmations, 1);
    }

    #[test]
    fn test_network_roundtrip() {
        for net in [Network::Bitcoin, Network::Signet, Network::Regtest] {
            assert_eq!(Network::from_str(net.as_str()), Some(net));
        }
        assert_eq!(Network::from_str("testnet4"), None);
    }
}
