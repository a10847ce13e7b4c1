//! Association lifecycle observation.
//!
//! The acceptor reports what happens on each association through a
//! [`SessionMonitor`] so that embedding applications can meter, audit
//! or persist procedure steps without the protocol code growing hooks
//! for each concern. The default monitor logs through `tracing`.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{DimseError, RefuseReason};
use crate::types::CommandField;

/// Identity of an association as negotiated.
#[derive(Debug, Clone)]
pub struct AssociationInfo {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub peer_addr: SocketAddr,
    pub received_at: DateTime<Utc>,
}

/// A command observed on an established association.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    pub context_id: u8,
    pub field: CommandField,
    pub message_id: Option<u16>,
    /// Size of the data set accompanying the command, if any.
    pub payload_bytes: Option<usize>,
}

/// Callbacks for the life of an acceptor-side association.
///
/// All methods default to doing nothing, so implementors only write
/// the ones they care about.
pub trait SessionMonitor: Send + Sync {
    /// An association request arrived and was parsed.
    fn association_received(&self, _info: &AssociationInfo) {}

    /// The association was accepted and acknowledged.
    fn association_acknowledged(&self, _info: &AssociationInfo) {}

    /// The association was refused before establishment.
    fn association_refused(&self, _info: &AssociationInfo, _reason: &RefuseReason) {}

    /// The peer requested a release and we acknowledged it.
    fn release_requested(&self, _info: &AssociationInfo) {}

    /// The peer aborted the association.
    fn abort_received(&self, _info: &AssociationInfo) {}

    /// The association ended and the transport is closed.
    fn association_terminated(&self, _info: &AssociationInfo) {}

    /// A command was received and routed.
    fn command_dispatched(&self, _info: &AssociationInfo, _command: &CommandInfo) {}

    /// A message exchange failed; the association is being aborted.
    fn dimse_error(&self, _info: &AssociationInfo, _error: &DimseError) {}
}

/// A monitor that ignores everything.
pub struct NoopMonitor;

impl SessionMonitor for NoopMonitor {}

/// The default monitor: structured logs for each lifecycle event.
pub struct LogMonitor;

impl SessionMonitor for LogMonitor {
    fn association_received(&self, info: &AssociationInfo) {
        info!(
            peer = %info.peer_addr,
            calling = %info.calling_ae_title,
            called = %info.called_ae_title,
            "association received"
        );
    }

    fn association_acknowledged(&self, info: &AssociationInfo) {
        info!(
            peer = %info.peer_addr,
            calling = %info.calling_ae_title,
            "association acknowledged"
        );
    }

    fn association_refused(&self, info: &AssociationInfo, reason: &RefuseReason) {
        warn!(
            peer = %info.peer_addr,
            calling = %info.calling_ae_title,
            called = %info.called_ae_title,
            %reason,
            "association refused"
        );
    }

    fn release_requested(&self, info: &AssociationInfo) {
        info!(peer = %info.peer_addr, "association release requested");
    }

    fn abort_received(&self, info: &AssociationInfo) {
        warn!(peer = %info.peer_addr, "association aborted by peer");
    }

    fn association_terminated(&self, info: &AssociationInfo) {
        info!(peer = %info.peer_addr, "association terminated");
    }

    fn command_dispatched(&self, info: &AssociationInfo, command: &CommandInfo) {
        info!(
            peer = %info.peer_addr,
            context = command.context_id,
            field = %command.field,
            message_id = command.message_id,
            payload_bytes = command.payload_bytes,
            "command dispatched"
        );
    }

    fn dimse_error(&self, info: &AssociationInfo, error: &DimseError) {
        warn!(peer = %info.peer_addr, %error, "message exchange failed, aborting association");
    }
}
