//! Error taxonomy for the wallet engine.
//!
//! Every public operation returns [`Result<T>`]. The binding layer maps
//! [`WalletError::kind`] onto its host exception type and shows the
//! `Display` message; it never needs to parse the message text.

use bitcoin::Amount;

use crate::chain::ChainError;
use crate::server::ServerError;

/// Lightning-specific failures surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LightningError {
    #[error("Invoice expired")]
    InvoiceExpired,
    #[error("Lightning counterparty timed out: {0}")]
    Timeout(String),
    #[error("Insufficient Lightning liquidity: need {needed}, available {available}")]
    InsufficientLiquidity { needed: Amount, available: Amount },
    #[error("Lightning payment failed: {0}")]
    PaymentFailed(String),
}

/// Top-level wallet error.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// Bad network, backend or server parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: Amount, available: Amount },
    /// Malformed input from the caller (empty id list, bad address, zero amount).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Chain backend or Ark server unreachable or timed out.
    #[error("Network error: {0}")]
    Network(String),
    /// Round rejected, cosigner failure, HTLC mismatch.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Operation invalid in the current wallet or VTXO state.
    #[error("Invalid state: {0}")]
    State(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Lightning error: {0}")]
    Lightning(#[from] LightningError),
    /// Datadir could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Flat discriminant of [`WalletError`] for binding layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    KeyDerivation,
    InsufficientFunds,
    InvalidArgument,
    Network,
    Protocol,
    State,
    NotFound,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::KeyDerivation => "key_derivation",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Network => "network",
            ErrorKind::Protocol => "protocol",
            ErrorKind::State => "state",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Storage => "storage",
        }
    }
}

impl WalletError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WalletError::Configuration(_) => ErrorKind::Configuration,
            WalletError::KeyDerivation(_) => ErrorKind::KeyDerivation,
            WalletError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            WalletError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            WalletError::Network(_) => ErrorKind::Network,
            WalletError::Protocol(_) => ErrorKind::Protocol,
            WalletError::State(_) => ErrorKind::State,
            WalletError::NotFound(_) => ErrorKind::NotFound,
            WalletError::Storage(_) => ErrorKind::Storage,
            WalletError::Lightning(e) => match e {
                LightningError::InvoiceExpired => ErrorKind::InvalidArgument,
                LightningError::Timeout(_) => ErrorKind::Network,
                LightningError::InsufficientLiquidity { .. } => ErrorKind::InsufficientFunds,
                LightningError::PaymentFailed(_) => ErrorKind::Protocol,
            },
        }
    }

    /// Whether re-invoking the same call may succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Network(_) | WalletError::Lightning(LightningError::Timeout(_)))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        WalletError::InvalidArgument(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        WalletError::State(msg.into())
    }
}

impl From<std::io::Error> for WalletError {
    fn from(e: std::io::Error) -> Self {
        WalletError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(e: serde_json::Error) -> Self {
        WalletError::Storage(format!("JSON: {}", e))
    }
}

impl From<ChainError> for WalletError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::Rejected(msg) => WalletError::Protocol(format!("Transaction rejected: {}", msg)),
            ChainError::NotFound(msg) => WalletError::NotFound(msg),
            other => WalletError::Network(other.to_string()),
        }
    }
}

impl From<ServerError> for WalletError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::Transport(msg) => WalletError::Network(format!("Ark server: {}", msg)),
            ServerError::Rejected(msg) => WalletError::Protocol(msg),
            ServerError::NotFound(msg) => WalletError::NotFound(msg),
            ServerError::Lightning(e) => WalletError::Lightning(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(WalletError::invalid("x").kind(), ErrorKind::InvalidArgument);
        assert_eq!(WalletError::state("x").kind(), ErrorKind::State);
        let e: WalletError = LightningError::Timeout("peer".into()).into();
        assert_eq!(e.kind(), ErrorKind::Network);
        assert!(e.is_retryable());
    }

    #[test]
    fn test_chain_error_conversion() {
        let e: WalletError = ChainError::Rejected("bad-txns".into()).into();
        assert_eq!(e.kind(), ErrorKind::Protocol);
        let e: WalletError = ChainError::Transport("refused".into()).into();
        assert_eq!(e.kind(), ErrorKind::Network);
        assert!(e.is_retryable());
    }

    #[test]
    fn test_messages_are_human_readable() {
        let e = WalletError::InsufficientFunds {
            needed: Amount::from_sat(1000),
            available: Amount::from_sat(10),
        };
        assert!(e.to_string().contains("Insufficient funds"));
        assert_eq!(e.kind().as_str(), "insufficient_funds");
    }
}
