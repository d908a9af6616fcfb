//! Error types.

use thiserror::Error;

use super::crypto::PublicKey;
use crate::consensus::message::View;

pub type Result<T> = std::result::Result<T, Error>;

/// Ways a peer message can violate the protocol.
///
/// A message that fails with one of these is dropped whole, never partially
/// applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("invalid signature from {0:?}")]
    BadSignature(PublicKey),

    #[error("signer {0:?} is not a committee member")]
    NotMember(PublicKey),

    #[error("duplicate signer {0:?}")]
    DuplicateSigner(PublicKey),

    #[error("insufficient quorum: {got} valid signers, need {need}")]
    InsufficientQuorum { got: usize, need: usize },

    #[error("proposal for {view:?} signed by {signer:?}, leader is {leader:?}")]
    WrongLeader {
        view: View,
        signer: PublicKey,
        leader: PublicKey,
    },

    #[error("block of lane {lane:?} signed by {signer:?}")]
    WrongLane { lane: PublicKey, signer: PublicKey },

    #[error("view mismatch: expected {expected:?}, got {got:?}")]
    ViewMismatch { expected: View, got: View },

    #[error("index mismatch: expected {expected}, got {got}")]
    IndexMismatch { expected: u64, got: u64 },

    #[error("malformed lane range: {0}")]
    BadRange(String),

    #[error("reproposal does not match the highest prepare QC")]
    BadReproposal,

    #[error("invalid justification: {0}")]
    BadJustification(String),

    #[error("invalid app proposal: {0}")]
    BadAppProposal(String),

    #[error("hash mismatch: {0}")]
    HashMismatch(String),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("canceled")]
    Canceled,

    #[error("pruned: requested {requested}, first retained is {first}")]
    Pruned { requested: u64, first: u64 },

    #[error("out of order: got {got}, expected at least {expected}")]
    OutOfOrder { got: u64, expected: u64 },

    #[error("not available yet: requested {requested}, next is {next}")]
    NotAvailable { requested: u64, next: u64 },

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("corrupt persisted state: {0}")]
    Corrupt(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True if this error, or any error it wraps, is a cancellation.
    pub fn is_canceled(&self) -> bool {
        match self {
            Error::Canceled => true,
            Error::Context { source, .. } => source.is_canceled(),
            _ => false,
        }
    }

    pub fn is_pruned(&self) -> bool {
        match self {
            Error::Pruned { .. } => true,
            Error::Context { source, .. } => source.is_pruned(),
            _ => false,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            return Error::Canceled;
        }
        Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}
