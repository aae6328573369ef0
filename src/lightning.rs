//! Lightning types: payment hashes, preimages, invoices, offers and the
//! receive/send records the wallet keeps.
//!
//! Invoices and offers are compact bech32 tokens signed by the issuing node.
//! They carry everything the wallet needs to lock an HTLC (payment hash,
//! amount, expiry, payee) and nothing else.

use std::fmt;
use std::str::FromStr;

use bitcoin::bech32::{self, Bech32, Hrp};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::Amount;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::address::ArkAddress;
use crate::config::Network;
use crate::error::{Result, WalletError};
use crate::vtxo::VtxoId;

/// Default invoice lifetime.
pub const DEFAULT_INVOICE_EXPIRY_SECS: u32 = 3600;

macro_rules! impl_hex_newtype {
    ($name:ident, $what:literal) => {
        impl $name {
            pub fn from_byte_array(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn to_byte_array(self) -> [u8; 32] {
                self.0
            }

            pub fn as_byte_array(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = WalletError;
            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s.trim()).map_err(|e| WalletError::invalid(format!("{}: {}", $what, e)))?;
                let array: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| WalletError::invalid(format!("{} must be 32 bytes", $what)))?;
                Ok(Self(array))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                $name::from_str(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaymentHash([u8; 32]);
impl_hex_newtype!(PaymentHash, "payment hash");

impl From<sha256::Hash> for PaymentHash {
    fn from(h: sha256::Hash) -> Self {
        Self(h.to_byte_array())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Preimage([u8; 32]);
impl_hex_newtype!(Preimage, "preimage");

impl Preimage {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn compute_payment_hash(&self) -> PaymentHash {
        sha256::Hash::hash(&self.0).into()
    }
}

fn hrp_for(prefix: &str, network: Network) -> &'static str {
    match (prefix, network) {
        ("ln", Network::Bitcoin) => "lnbc",
        ("ln", Network::Signet) => "lntbs",
        ("ln", Network::Regtest) => "lnbcrt",
        _ => "lno",
    }
}

fn network_for_invoice_hrp(hrp: &str) -> Option<Network> {
    match hrp {
        "lnbc" => Some(Network::Bitcoin),
        "lntbs" => Some(Network::Signet),
        "lnbcrt" => Some(Network::Regtest),
        _ => None,
    }
}

/// Cursor over a decoded token payload.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(WalletError::invalid("truncated lightning token"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn pubkey(&mut self) -> Result<PublicKey> {
        PublicKey::from_slice(self.take(33)?).map_err(|e| WalletError::invalid(format!("lightning token key: {}", e)))
    }

    fn string(&mut self) -> Result<String> {
        let len = u16::from_be_bytes(self.array()?) as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|_| WalletError::invalid("lightning token text is not utf-8"))
    }
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn token_digest(hrp: &str, payload: &[u8]) -> Message {
    let mut engine = sha256::Hash::engine();
    bitcoin::hashes::HashEngine::input(&mut engine, hrp.as_bytes());
    bitcoin::hashes::HashEngine::input(&mut engine, payload);
    Message::from_digest(sha256::Hash::from_engine(engine).to_byte_array())
}

fn encode_token(hrp: &str, data: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(hrp).map_err(|e| WalletError::Protocol(format!("hrp: {}", e)))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| WalletError::Protocol(format!("bech32: {}", e)))
}

fn decode_token(s: &str) -> Result<(String, Vec<u8>)> {
    let (hrp, data) = bech32::decode(s.trim()).map_err(|e| WalletError::invalid(format!("bech32: {}", e)))?;
    Ok((hrp.to_lowercase(), data))
}

/// A signed payment request for a fixed payment hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub network: Network,
    pub payment_hash: PaymentHash,
    /// `None` lets the payer choose.
    pub amount_msat: Option<u64>,
    pub created_at: u64,
    pub expiry_secs: u32,
    pub payee: PublicKey,
    pub payment_secret: [u8; 32],
    pub description: String,
    signature: ecdsa::Signature,
}

impl Invoice {
    const VERSION: u8 = 0;

    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        secp: &Secp256k1<All>,
        network: Network,
        payment_hash: PaymentHash,
        amount_msat: Option<u64>,
        expiry_secs: u32,
        payment_secret: [u8; 32],
        description: &str,
        payee_key: &SecretKey,
    ) -> Invoice {
        let created_at = Utc::now().timestamp().max(0) as u64;
        let payee = payee_key.public_key(secp);
        let body = invoice_payload(&payment_hash, amount_msat, created_at, expiry_secs, &payee, &payment_secret, description);
        let signature = secp.sign_ecdsa(&token_digest(hrp_for("ln", network), &body), payee_key);
        Invoice {
            network,
            payment_hash,
            amount_msat,
            created_at,
            expiry_secs,
            payee,
            payment_secret,
            description: description.to_string(),
            signature,
        }
    }

    fn hrp(&self) -> &'static str {
        hrp_for("ln", self.network)
    }

    fn unsigned_payload(&self) -> Vec<u8> {
        invoice_payload(
            &self.payment_hash,
            self.amount_msat,
            self.created_at,
            self.expiry_secs,
            &self.payee,
            &self.payment_secret,
            &self.description,
        )
    }

    pub fn amount(&self) -> Option<Amount> {
        self.amount_msat.map(|msat| Amount::from_sat(msat / 1000))
    }

    pub fn expires_at(&self) -> u64 {
        self.created_at + self.expiry_secs as u64
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp().max(0) as u64 >= self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn verify_signature(&self) -> bool {
        let digest = token_digest(self.hrp(), &self.unsigned_payload());
        Secp256k1::verification_only().verify_ecdsa(&digest, &self.signature, &self.payee).is_ok()
    }
}

fn invoice_payload(
    payment_hash: &PaymentHash,
    amount_msat: Option<u64>,
    created_at: u64,
    expiry_secs: u32,
    payee: &PublicKey,
    payment_secret: &[u8; 32],
    description: &str,
) -> Vec<u8> {
    let mut buf = vec![Invoice::VERSION];
    buf.extend_from_slice(payment_hash.as_byte_array());
    buf.extend_from_slice(&amount_msat.unwrap_or(0).to_be_bytes());
    buf.extend_from_slice(&created_at.to_be_bytes());
    buf.extend_from_slice(&(expiry_secs as u64).to_be_bytes());
    buf.extend_from_slice(&payee.serialize());
    buf.extend_from_slice(payment_secret);
    push_string(&mut buf, description);
    buf
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut data = self.unsigned_payload();
        data.extend_from_slice(&self.signature.serialize_compact());
        match encode_token(self.hrp(), &data) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl FromStr for Invoice {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        let (hrp, data) = decode_token(strip_scheme(s, "lightning:"))?;
        let network = network_for_invoice_hrp(&hrp)
            .ok_or_else(|| WalletError::invalid(format!("unknown invoice prefix {}", hrp)))?;
        let mut r = Reader { data: &data };
        if r.array::<1>()?[0] != Self::VERSION {
            return Err(WalletError::invalid("unsupported invoice version"));
        }
        let payment_hash = PaymentHash(r.array()?);
        let amount_msat = Some(r.u64()?).filter(|a| *a > 0);
        let created_at = r.u64()?;
        let expiry_secs = u32::try_from(r.u64()?).map_err(|_| WalletError::invalid("invoice expiry out of range"))?;
        let payee = r.pubkey()?;
        let payment_secret = r.array()?;
        let description = r.string()?;
        let signature = ecdsa::Signature::from_compact(r.take(64)?)
            .map_err(|e| WalletError::invalid(format!("invoice signature: {}", e)))?;
        if !r.data.is_empty() {
            return Err(WalletError::invalid("trailing data in invoice"));
        }
        let invoice = Invoice {
            network,
            payment_hash,
            amount_msat,
            created_at,
            expiry_secs,
            payee,
            payment_secret,
            description,
            signature,
        };
        if !invoice.verify_signature() {
            return Err(WalletError::invalid("invoice signature does not match payee"));
        }
        Ok(invoice)
    }
}

/// A reusable offer a node answers with fresh invoices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub payee: PublicKey,
    pub amount_msat: Option<u64>,
    pub description: String,
}

impl Offer {
    const HRP: &'static str = "lno";

    fn payload(&self) -> Vec<u8> {
        let mut buf = self.payee.serialize().to_vec();
        buf.extend_from_slice(&self.amount_msat.unwrap_or(0).to_be_bytes());
        push_string(&mut buf, &self.description);
        buf
    }
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match encode_token(Self::HRP, &self.payload()) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl FromStr for Offer {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        let (hrp, data) = decode_token(s)?;
        if hrp != Self::HRP {
            return Err(WalletError::invalid(format!("not an offer: {}", hrp)));
        }
        let mut r = Reader { data: &data };
        let payee = r.pubkey()?;
        let amount_msat = Some(r.u64()?).filter(|a| *a > 0);
        let description = r.string()?;
        Ok(Offer { payee, amount_msat, description })
    }
}

/// `user@domain`, resolved through LNURL-pay by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LightningAddress {
    pub user: String,
    pub domain: String,
}

impl LightningAddress {
    pub fn lnurlp_url(&self) -> String {
        format!("https://{}/.well-known/lnurlp/{}", self.domain, self.user)
    }
}

impl fmt::Display for LightningAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.domain)
    }
}

impl FromStr for LightningAddress {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        let s = strip_scheme(s, "lightning:");
        let (user, domain) = s
            .split_once('@')
            .ok_or_else(|| WalletError::invalid("lightning address needs user@domain"))?;
        let valid_user = !user.is_empty()
            && user.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'));
        let valid_domain = !domain.is_empty()
            && !domain.contains('@')
            && domain.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':'));
        if !valid_user || !valid_domain {
            return Err(WalletError::invalid(format!("invalid lightning address {}", s)));
        }
        Ok(LightningAddress { user: user.to_ascii_lowercase(), domain: domain.to_ascii_lowercase() })
    }
}

/// Decode an `lnurl1...` string into its url.
pub fn decode_lnurl(s: &str) -> Result<String> {
    let (hrp, data) = decode_token(strip_scheme(s, "lightning:"))?;
    if hrp != "lnurl" {
        return Err(WalletError::invalid("not an lnurl"));
    }
    String::from_utf8(data).map_err(|_| WalletError::invalid("lnurl does not encode a url"))
}

pub fn encode_lnurl(url: &str) -> Result<String> {
    Ok(encode_token("lnurl", url.as_bytes())?.to_uppercase())
}

fn strip_scheme<'a>(s: &'a str, scheme: &str) -> &'a str {
    let s = s.trim();
    match s.get(..scheme.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(scheme) => &s[scheme.len()..],
        _ => s,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Arkoor,
    Bolt11,
    Bolt12,
    LightningAddress,
    Lnurl,
    Onchain,
}

/// Anything the wallet can pay to.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentDestination {
    Ark(ArkAddress),
    ArkPubkey(PublicKey),
    Bolt11(Invoice),
    Bolt12(Offer),
    LightningAddress(LightningAddress),
    Lnurl(String),
    Onchain(bitcoin::Address),
}

impl PaymentDestination {
    /// Detect the kind of `s`. Ark destinations first, then Lightning, then
    /// onchain addresses.
    pub fn parse(s: &str, network: Network) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(WalletError::invalid("empty destination"));
        }
        let lower = trimmed.to_ascii_lowercase();
        let bare = strip_scheme(&lower, "lightning:");

        if bare.starts_with("ark1") || bare.starts_with("tark1") {
            return Ok(PaymentDestination::Ark(ArkAddress::from_str(bare)?));
        }
        if bare.len() == 66 && bare.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(PaymentDestination::ArkPubkey(crate::keys::parse_pubkey(bare)?));
        }
        if bare.starts_with("lnbc") || bare.starts_with("lntb") {
            let invoice = Invoice::from_str(bare)?;
            if invoice.network != network {
                return Err(WalletError::invalid(format!(
                    "invoice is for {} but wallet is on {}",
                    invoice.network.as_str(),
                    network.as_str()
                )));
            }
            return Ok(PaymentDestination::Bolt11(invoice));
        }
        if bare.starts_with("lno1") {
            return Ok(PaymentDestination::Bolt12(Offer::from_str(bare)?));
        }
        if bare.starts_with("lnurl1") {
            return Ok(PaymentDestination::Lnurl(decode_lnurl(bare)?));
        }
        if bare.contains('@') {
            return Ok(PaymentDestination::LightningAddress(LightningAddress::from_str(bare)?));
        }
        let address = bitcoin::Address::from_str(strip_scheme(trimmed, "bitcoin:"))
            .map_err(|e| WalletError::invalid(format!("unrecognised destination: {}", e)))?
            .require_network(network.to_bitcoin())
            .map_err(|e| WalletError::invalid(format!("address network: {}", e)))?;
        Ok(PaymentDestination::Onchain(address))
    }

    pub fn payment_type(&self) -> PaymentType {
        match self {
            PaymentDestination::Ark(_) | PaymentDestination::ArkPubkey(_) => PaymentType::Arkoor,
            PaymentDestination::Bolt11(_) => PaymentType::Bolt11,
            PaymentDestination::Bolt12(_) => PaymentType::Bolt12,
            PaymentDestination::LightningAddress(_) => PaymentType::LightningAddress,
            PaymentDestination::Lnurl(_) => PaymentType::Lnurl,
            PaymentDestination::Onchain(_) => PaymentType::Onchain,
        }
    }
}

/// Returned by `bolt11_invoice`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bolt11Receive {
    pub invoice: String,
    pub payment_secret: String,
    pub payment_hash: PaymentHash,
}

/// View of an inbound Lightning payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightningReceive {
    pub payment_hash: PaymentHash,
    /// Only populated once the preimage was revealed to claim the HTLC.
    pub payment_preimage: Option<Preimage>,
    pub invoice: String,
    #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
    pub amount: Option<Amount>,
    pub created_at: DateTime<Utc>,
    pub preimage_revealed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub htlc_vtxos: Vec<VtxoId>,
}

/// Persisted record behind [LightningReceive]. Holds the preimage from the start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ReceiveRecord {
    pub payment_hash: PaymentHash,
    pub preimage: Preimage,
    pub invoice: String,
    #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
    pub amount: Option<Amount>,
    pub created_at: DateTime<Utc>,
    pub preimage_revealed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub htlc_vtxos: Vec<VtxoId>,
    pub failure: Option<String>,
}

impl ReceiveRecord {
    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }

    pub fn view(&self) -> LightningReceive {
        LightningReceive {
            payment_hash: self.payment_hash,
            payment_preimage: self.preimage_revealed_at.map(|_| self.preimage),
            invoice: self.invoice.clone(),
            amount: self.amount,
            created_at: self.created_at,
            preimage_revealed_at: self.preimage_revealed_at,
            finished_at: self.finished_at,
            htlc_vtxos: self.htlc_vtxos.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Outgoing payment tracked until the server settles or revokes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SendRecord {
    pub payment_hash: PaymentHash,
    pub invoice: String,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee: Amount,
    pub htlc_vtxos: Vec<VtxoId>,
    pub inputs: Vec<VtxoId>,
    pub status: SendStatus,
    pub preimage: Option<Preimage>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightningSendResult {
    pub invoice: String,
    pub payment_hash: PaymentHash,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee: Amount,
    pub htlc_vtxos: Vec<VtxoId>,
    pub status: SendStatus,
    /// Present once the payment settled.
    pub preimage: Option<Preimage>,
}

impl SendRecord {
    pub fn result(&self) -> LightningSendResult {
        LightningSendResult {
            invoice: self.invoice.clone(),
            payment_hash: self.payment_hash,
            amount: self.amount,
            fee: self.fee,
            htlc_vtxos: self.htlc_vtxos.clone(),
            status: self.status,
            preimage: self.preimage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payee() -> (Secp256k1<All>, SecretKey) {
        (Secp256k1::new(), SecretKey::from_slice(&[9u8; 32]).unwrap())
    }

    #[test]
    fn test_preimage_hash() {
        let preimage = Preimage::random();
        let hash = preimage.compute_payment_hash();
        assert_eq!(hash, PaymentHash::from(sha256::Hash::hash(preimage.as_byte_array())));
        assert_eq!(PaymentHash::from_str(&hash.to_string()).unwrap(), hash);
        assert!(PaymentHash::from_str("abcd").is_err());
    }

    #[test]
    fn test_invoice_encoding() {
        let (secp, key) = payee();
        let hash = Preimage::random().compute_payment_hash();
        let invoice = Invoice::sign(&secp, Network::Regtest, hash, Some(100_000), 600, [3u8; 32], "coffee", &key);
        let encoded = invoice.to_string();
        assert!(encoded.starts_with("lnbcrt1"));

        let decoded = Invoice::from_str(&encoded).unwrap();
        assert_eq!(decoded, invoice);
        assert_eq!(decoded.amount(), Some(Amount::from_sat(100)));
        assert!(!decoded.is_expired());
        assert!(Invoice::from_str(&format!("lightning:{}", encoded)).is_ok());
    }

    #[test]
    fn test_invoice_tamper_detected() {
        let (secp, key) = payee();
        let hash = Preimage::random().compute_payment_hash();
        let mut invoice = Invoice::sign(&secp, Network::Signet, hash, None, 600, [0u8; 32], "", &key);
        invoice.amount_msat = Some(1);
        assert!(!invoice.verify_signature());
        assert!(Invoice::from_str(&invoice.to_string()).is_err());
    }

    #[test]
    fn test_invoice_expiry() {
        let (secp, key) = payee();
        let hash = Preimage::random().compute_payment_hash();
        let invoice = Invoice::sign(&secp, Network::Regtest, hash, None, 10, [0u8; 32], "", &key);
        let later = Utc::now() + chrono::Duration::seconds(11);
        assert!(invoice.is_expired_at(later));
    }

    #[test]
    fn test_offer_and_lnurl() {
        let (secp, key) = payee();
        let offer = Offer { payee: key.public_key(&secp), amount_msat: None, description: "tips".into() };
        let s = offer.to_string();
        assert!(s.starts_with("lno1"));
        assert_eq!(Offer::from_str(&s).unwrap(), offer);

        let lnurl = encode_lnurl("https://example.com/lnurlp/alice").unwrap();
        assert!(lnurl.starts_with("LNURL1"));
        assert_eq!(decode_lnurl(&lnurl.to_lowercase()).unwrap(), "https://example.com/lnurlp/alice");
    }

    #[test]
    fn test_lightning_address() {
        let addr = LightningAddress::from_str("Alice@Example.com").unwrap();
        assert_eq!(addr.to_string(), "alice@example.com");
        assert_eq!(addr.lnurlp_url(), "https://example.com/.well-known/lnurlp/alice");
        assert!(LightningAddress::from_str("@example.com").is_err());
        assert!(LightningAddress::from_str("alice@").is_err());
    }

    #[test]
    fn test_destination_detection() {
        let (secp, key) = payee();
        let pk = key.public_key(&secp);
        assert_eq!(
            PaymentDestination::parse(&pk.to_string(), Network::Regtest).unwrap().payment_type(),
            PaymentType::Arkoor
        );

        let hash = Preimage::random().compute_payment_hash();
        let invoice = Invoice::sign(&secp, Network::Regtest, hash, Some(1000), 600, [0u8; 32], "", &key).to_string();
        assert_eq!(PaymentDestination::parse(&invoice, Network::Regtest).unwrap().payment_type(), PaymentType::Bolt11);
        assert!(PaymentDestination::parse(&invoice, Network::Bitcoin).is_err());

        let onchain = bitcoin::Address::p2wsh(&bitcoin::ScriptBuf::new(), bitcoin::Network::Regtest).to_string();
        assert_eq!(
            PaymentDestination::parse("bob@example.com", Network::Regtest).unwrap().payment_type(),
            PaymentType::LightningAddress
        );
        assert_eq!(
            PaymentDestination::parse(&onchain, Network::Regtest).unwrap().payment_type(),
            PaymentType::Onchain
        );
        assert!(PaymentDestination::parse("", Network::Regtest).is_err());
        assert!(PaymentDestination::parse("garbage", Network::Regtest).is_err());
    }
}
