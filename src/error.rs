//! Error types for DIMSE operations

use std::fmt;

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("PDU exchange error: {0}")]
    Pdu(String),

    #[error("Command set error: {0}")]
    Command(String),

    #[error("Association rejected: {0}")]
    AssociationRejected(String),

    #[error("No association is currently active")]
    IllegalAssociation,

    #[error("No presentation context with id {0} was negotiated")]
    IllegalContext(u8),

    #[error("Cannot handle DIMSE command 0x{0:04x}")]
    UnsupportedCommand(u16),

    #[error("No acceptable presentation contexts")]
    NoAcceptablePresentationContexts,

    #[error("No valid presentation context for {0}")]
    NoValidPresentationContext(String),

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new PDU exchange error
    pub fn pdu(msg: impl Into<String>) -> Self {
        Self::Pdu(msg.into())
    }

    /// Create a new command set error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a new operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }
}

/// Peer-visible reasons for refusing an incoming association request.
///
/// A refusal is a normal branch of the accept path, not an error: the
/// listener answers with an A-ASSOCIATE-RJ and goes back to waiting for the
/// next connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefuseReason {
    /// The application context name proposed by the peer is not the DICOM
    /// standard application context.
    BadApplicationContext(String),
    /// The called AE title is not one this server answers for.
    CalledAeTitleNotRecognized(String),
    /// Negotiation left zero accepted presentation contexts.
    NoAcceptablePresentationContexts,
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefuseReason::BadApplicationContext(name) => {
                write!(f, "bad application context name '{}'", name)
            }
            RefuseReason::CalledAeTitleNotRecognized(aet) => {
                write!(f, "called AE title '{}' not recognized", aet)
            }
            RefuseReason::NoAcceptablePresentationContexts => {
                write!(f, "no acceptable presentation contexts")
            }
        }
    }
}
