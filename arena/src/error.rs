use std::fmt::Formatter;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// No staking contract address is configured.
    NotConfigured,
    /// A read against the ledger failed (transport or call error).
    Read(String),
    /// A write was refused or failed; carries the raw message from the signer or node.
    Write(String),
    /// The ledger answered with something we cannot interpret.
    Protocol(String),
    UnknownOutcome(u8),
    InvalidAmount(String),
    InvalidTransition(String),
    SlotBusy,
    Config(String),
    Io(std::io::Error),
    Db(redis::RedisError),
    Json(serde_json::Error),
    Unknown(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotConfigured => write!(f, "staking contract address is not configured"),
            Error::Read(e) => write!(f, "ledger read failed: {}", e),
            Error::Write(e) => write!(f, "ledger write failed: {}", e),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::UnknownOutcome(o) => write!(f, "unknown outcome ordinal {}", o),
            Error::InvalidAmount(a) => write!(f, "invalid amount: {}", a),
            Error::InvalidTransition(e) => write!(f, "invalid transaction transition: {}", e),
            Error::SlotBusy => write!(f, "a transaction is already in flight for this action"),
            Error::Config(e) => write!(f, "config error: {}", e),
            Error::Io(e) => write!(f, "Io error {:?}", e),
            Error::Db(e) => write!(f, "Database error {:?}", e),
            Error::Json(e) => write!(f, "Json error {}", e),
            Error::Unknown(e) => write!(f, "a unknown error happened: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Db(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Db(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<web3::Error> for Error {
    fn from(e: web3::Error) -> Self {
        Error::Read(e.to_string())
    }
}

impl From<web3::contract::Error> for Error {
    fn from(e: web3::contract::Error) -> Self {
        Error::Read(crate::utils::handle_error(e))
    }
}

impl From<web3::ethabi::Error> for Error {
    fn from(e: web3::ethabi::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Why a write ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    UserRejected,
    InsufficientBalance,
    AlreadyFinalized,
    ContractNotConfigured,
    Unknown(String),
}

/// Error taxonomy as seen by the views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigurationError,
    UserCancelled,
    InsufficientFunds,
    AlreadyFinalized,
    TransientReadFailure,
    UnknownWriteFailure,
}

/// What a view should put in front of the user for a failed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// Blocks the action until an operator fixes the setup.
    Blocking(String),
    /// Shown next to the input, the user may retry.
    Inline(String),
    /// Distinct from a generic failure so the view can suggest another contest.
    Finalized(String),
    Failure(String),
}

impl FailureReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FailureReason::UserRejected => ErrorKind::UserCancelled,
            FailureReason::InsufficientBalance => ErrorKind::InsufficientFunds,
            FailureReason::AlreadyFinalized => ErrorKind::AlreadyFinalized,
            FailureReason::ContractNotConfigured => ErrorKind::ConfigurationError,
            FailureReason::Unknown(_) => ErrorKind::UnknownWriteFailure,
        }
    }

    pub fn alert(&self) -> Option<Alert> {
        match self {
            FailureReason::UserRejected => None,
            FailureReason::InsufficientBalance => Some(Alert::Inline("Insufficient balance".to_string())),
            FailureReason::AlreadyFinalized => Some(Alert::Finalized(
                "Winners have already been set for this hackathon. Select a different hackathon.".to_string(),
            )),
            FailureReason::ContractNotConfigured => Some(Alert::Blocking(
                "Staking contract not configured. Deploy the contract and set its address in the config.".to_string(),
            )),
            FailureReason::Unknown(raw) => Some(Alert::Failure(format!("Transaction failed: {}", raw))),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::ContractNotConfigured | FailureReason::AlreadyFinalized)
    }

    /// Classify a raw wallet or node message.
    pub fn classify(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        if lower.contains("user rejected") || lower.contains("user denied") || lower.contains("rejected the request")
        {
            FailureReason::UserRejected
        } else if lower.contains("insufficient funds") || lower.contains("insufficient balance") {
            FailureReason::InsufficientBalance
        } else if lower.contains("winners already set") {
            FailureReason::AlreadyFinalized
        } else {
            FailureReason::Unknown(raw.to_string())
        }
    }
}

impl From<&Error> for FailureReason {
    fn from(e: &Error) -> Self {
        match e {
            Error::NotConfigured => FailureReason::ContractNotConfigured,
            Error::Write(raw) => FailureReason::classify(raw),
            other => FailureReason::classify(&other.to_string()),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::UserRejected => write!(f, "user rejected the request"),
            FailureReason::InsufficientBalance => write!(f, "insufficient balance"),
            FailureReason::AlreadyFinalized => write!(f, "winners already set"),
            FailureReason::ContractNotConfigured => write!(f, "contract not configured"),
            FailureReason::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}
