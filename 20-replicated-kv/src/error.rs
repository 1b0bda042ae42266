//! Client-visible error vocabulary.

use thiserror::Error;

/// Errors returned to clients by the RPC front-end.
///
/// The wire form is the fixed string from [`KvError::code`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    #[error("no such key")]
    NoSuchKey,

    #[error("node unavailable")]
    Unavailable,
}

pub const OK: &str = "OK";

impl KvError {
    pub fn code(&self) -> &'static str {
        match self {
            KvError::InvalidArgument(_) => "InvalidArgument",
            KvError::NotLeader { .. } => "NotLeader",
            KvError::NoSuchKey => "NoSuchKey",
            KvError::Unavailable => "Unavailable",
        }
    }

    /// Parses a wire code back into an error. `"OK"` and unknown codes give `None`.
    pub fn from_code(code: &str, leader: Option<u64>) -> Option<Self> {
        match code {
            "InvalidArgument" => Some(KvError::InvalidArgument("rejected by server")),
            "NotLeader" => Some(KvError::NotLeader { leader }),
            "NoSuchKey" => Some(KvError::NoSuchKey),
            "Unavailable" => Some(KvError::Unavailable),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for err in [
            KvError::InvalidArgument("x"),
            KvError::NotLeader { leader: Some(2) },
            KvError::NoSuchKey,
            KvError::Unavailable,
        ] {
            let parsed = KvError::from_code(err.code(), Some(2)).map(|e| e.code());
            assert_eq!(parsed, Some(err.code()));
        }
        assert_eq!(KvError::from_code(OK, None), None);
    }
}
