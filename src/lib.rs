//! DIMSE session layer for Modality Performed Procedure Step and
//! Storage Commitment.
//!
//! The crate provides two roles over the DICOM upper layer protocol:
//!
//! * [`MppsScp`], an association acceptor that answers C-ECHO and
//!   acknowledges procedure step N-CREATE and N-SET requests;
//! * [`StorageCommitmentScu`], an association requestor that verifies
//!   a peer with C-ECHO and delivers storage commitment results with
//!   N-EVENT-REPORT.
//!
//! PDU encoding and transport framing are handled by `dicom-ul`; this
//! crate owns association acceptance policy, presentation context
//! bookkeeping, command set encoding and command routing.

pub mod association;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod profile;
pub mod scp;
pub mod scu;
pub mod types;

pub use config::{ScpConfig, ScuConfig};
pub use dispatch::{CommandDispatcher, DispatchOutcome};
pub use error::{DimseError, RefuseReason, Result};
pub use events::{AssociationInfo, CommandInfo, LogMonitor, NoopMonitor, SessionMonitor};
pub use profile::{ContextDef, ContextProfile, ProfileRegistry};
pub use scp::MppsScp;
pub use scu::StorageCommitmentScu;
pub use types::{CommandField, CommandSet};

/// Default port for DICOM associations.
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Default maximum PDU length advertised to peers.
pub const DEFAULT_MAX_PDU: u32 = 16384;

/// The DICOM application context name; associations proposing any
/// other context are refused.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Implementation class UID sent during association negotiation.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.168305201948997404608674384314462060252";

/// Implementation version name sent during association negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DIMSE_MPPS_01";
