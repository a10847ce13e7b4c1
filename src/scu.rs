//! The storage commitment requestor.
//!
//! Opens an association to a peer, verifies it with C-ECHO and pushes
//! commitment result notifications with N-EVENT-REPORT. The requestor
//! can either own its association for a single exchange or keep one
//! open across several notifications.

use std::net::TcpStream;
use std::time::Duration;

use dicom_object::InMemDicomObject;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_ul::{ClientAssociation, ClientAssociationOptions};
use tracing::{debug, info};

use crate::association::presentation::{ContextRole, NegotiatedContext, PresentationContextTable};
use crate::config::ScuConfig;
use crate::error::{DimseError, Result};
use crate::profile::{ContextDef, ContextProfile};
use crate::types::{
    lookup_transfer_syntax, CommandField, CommandSet, EXPLICIT_VR_BIG_ENDIAN,
    EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN, STATUS_SUCCESS,
    STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS, STORAGE_COMMITMENT_PUSH_MODEL_SOP_INSTANCE,
};

/// Data fragment size for outgoing data sets.
const DATA_CHUNK: usize = 4096;

/// Presentation context identifiers are odd 8-bit values, so an
/// association can carry at most this many proposals.
const MAX_PROPOSED_CONTEXTS: usize = 128;

/// Storage Commitment Push Model requestor.
pub struct StorageCommitmentScu {
    config: ScuConfig,
    profile: ContextProfile,
    extra_contexts: Vec<ContextDef>,
    assoc: Option<ClientAssociation<TcpStream>>,
    contexts: PresentationContextTable,
    next_message_id: u16,
}

impl StorageCommitmentScu {
    /// Creates the requestor. The configuration is validated up front
    /// so a misconfigured peer address fails before any connection.
    pub fn new(config: ScuConfig, profile: ContextProfile) -> Result<Self> {
        config.validate()?;
        if profile.is_empty() {
            return Err(DimseError::config("profile has no presentation contexts"));
        }
        Ok(Self {
            config,
            profile,
            extra_contexts: Vec::new(),
            assoc: None,
            contexts: PresentationContextTable::new(),
            next_message_id: 1,
        })
    }

    /// Adds a presentation context to propose beyond the profile.
    /// Takes effect on the next `connect`.
    pub fn add_presentation_context(&mut self, context: ContextDef) {
        self.extra_contexts.push(context);
    }

    pub fn is_connected(&self) -> bool {
        self.assoc.is_some()
    }

    pub fn contexts(&self) -> &PresentationContextTable {
        &self.contexts
    }

    /// Opens an association to the configured peer, proposing the
    /// profile's contexts plus any extras. Fails when the peer rejects
    /// the association or accepts none of the proposed contexts.
    pub fn connect(&mut self) -> Result<()> {
        if self.assoc.is_some() {
            return Err(DimseError::IllegalAssociation);
        }

        let proposed: Vec<&ContextDef> = self
            .profile
            .contexts
            .iter()
            .chain(self.extra_contexts.iter())
            .collect();
        if proposed.len() > MAX_PROPOSED_CONTEXTS {
            return Err(DimseError::config(format!(
                "{} presentation contexts proposed, at most {} fit in an association",
                proposed.len(),
                MAX_PROPOSED_CONTEXTS
            )));
        }

        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.config.calling_aet.clone())
            .called_ae_title(self.config.peer_aet.clone())
            .max_pdu_length(self.config.max_pdu)
            .read_timeout(Duration::from_millis(self.config.acse_timeout_ms))
            .connection_timeout(Duration::from_millis(self.config.acse_timeout_ms));
        for def in &proposed {
            options = options.with_presentation_context(
                def.abstract_syntax.clone(),
                def.transfer_syntaxes.clone(),
            );
        }

        let address = self.config.peer_address();
        debug!(%address, "opening association");
        let assoc = options
            .establish_with(&address)
            .map_err(|e| DimseError::AssociationRejected(e.to_string()))?;

        let mut contexts = PresentationContextTable::new();
        for result in assoc.presentation_contexts() {
            use dicom_ul::pdu::PresentationContextResultReason as Reason;
            if result.reason != Reason::Acceptance {
                continue;
            }
            contexts.insert(NegotiatedContext {
                id: result.id,
                abstract_syntax: result.abstract_syntax.clone(),
                transfer_syntax: result.transfer_syntax.clone(),
                role: ContextRole::Requestor,
            });
        }

        if contexts.is_empty() {
            // nothing to talk over
            if let Err(e) = assoc.abort() {
                debug!("failed to abort unusable association: {e}");
            }
            return Err(DimseError::NoAcceptablePresentationContexts);
        }

        info!(
            peer = %self.config.peer_aet,
            contexts = contexts.len(),
            "association established"
        );
        self.contexts = contexts;
        self.assoc = Some(assoc);
        Ok(())
    }

    /// Resolves the context to use for an operation. A nonzero
    /// requested identifier must name a negotiated context; zero picks
    /// one for the abstract syntax, preferring Explicit VR Little
    /// Endian, then Explicit VR Big Endian, then Implicit VR.
    pub fn resolve_context(&self, requested: u8, abstract_syntax: &str) -> Result<u8> {
        if requested != 0 {
            return match self.contexts.get(requested) {
                Some(_) => Ok(requested),
                None => Err(DimseError::IllegalContext(requested)),
            };
        }
        for ts in [
            EXPLICIT_VR_LITTLE_ENDIAN,
            EXPLICIT_VR_BIG_ENDIAN,
            IMPLICIT_VR_LITTLE_ENDIAN,
        ] {
            if let Some(ctx) = self.contexts.find(abstract_syntax, Some(ts)) {
                return Ok(ctx.id);
            }
        }
        Err(DimseError::NoValidPresentationContext(
            abstract_syntax.to_string(),
        ))
    }

    fn take_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    /// Verifies the association with a C-ECHO exchange.
    pub fn send_echo(&mut self, presentation_context_id: u8) -> Result<()> {
        let message_id = self.take_message_id();
        let request = CommandSet::echo_rq(message_id);
        self.send_command(presentation_context_id, &request)?;

        let response = self.receive_command(presentation_context_id)?;
        if response.field != CommandField::CEchoRsp {
            return Err(DimseError::command(format!(
                "expected C-ECHO response, got {}",
                response.field
            )));
        }
        if response.responded_to != Some(message_id) {
            return Err(DimseError::command(format!(
                "C-ECHO response correlates to {:?}, expected {message_id}",
                response.responded_to
            )));
        }
        match response.status {
            Some(STATUS_SUCCESS) => Ok(()),
            status => Err(DimseError::operation_failed(format!(
                "C-ECHO failed with status {status:04X?}"
            ))),
        }
    }

    /// Pushes a commitment result notification. The notification is
    /// one-way: no response is awaited, matching peers that deliver
    /// the result over their own association.
    pub fn send_event_report(
        &mut self,
        presentation_context_id: u8,
        event_type_id: u16,
        report: &InMemDicomObject,
    ) -> Result<()> {
        let context = self
            .contexts
            .get(presentation_context_id)
            .ok_or(DimseError::IllegalContext(presentation_context_id))?;
        let transfer_syntax = lookup_transfer_syntax(&context.transfer_syntax)?;

        let mut encoded = Vec::new();
        report
            .write_dataset_with_ts(&mut encoded, transfer_syntax)
            .map_err(|e| DimseError::command(format!("encoding commitment result: {e}")))?;

        let message_id = self.take_message_id();
        let command = CommandSet::n_event_report_rq(
            message_id,
            STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS,
            STORAGE_COMMITMENT_PUSH_MODEL_SOP_INSTANCE,
            event_type_id,
            !encoded.is_empty(),
        );
        self.send_command(presentation_context_id, &command)?;

        if encoded.is_empty() {
            return Ok(());
        }
        let chunks: Vec<&[u8]> = encoded.chunks(DATA_CHUNK).collect();
        let count = chunks.len();
        let assoc = self.assoc.as_mut().ok_or(DimseError::IllegalAssociation)?;
        for (i, chunk) in chunks.into_iter().enumerate() {
            assoc
                .send(&Pdu::PData {
                    data: vec![PDataValue {
                        presentation_context_id,
                        value_type: PDataValueType::Data,
                        is_last: i + 1 == count,
                        data: chunk.to_vec(),
                    }],
                })
                .map_err(|e| DimseError::pdu(format!("sending commitment result: {e}")))?;
        }
        info!(
            message_id,
            event_type_id,
            bytes = encoded.len(),
            "commitment result sent"
        );
        Ok(())
    }

    fn send_command(&mut self, presentation_context_id: u8, command: &CommandSet) -> Result<()> {
        if self.contexts.get(presentation_context_id).is_none() {
            return Err(DimseError::IllegalContext(presentation_context_id));
        }
        let encoded = command.encode()?;
        let assoc = self.assoc.as_mut().ok_or(DimseError::IllegalAssociation)?;
        assoc
            .send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: encoded,
                }],
            })
            .map_err(|e| DimseError::pdu(format!("sending command: {e}")))?;
        Ok(())
    }

    fn receive_command(&mut self, presentation_context_id: u8) -> Result<CommandSet> {
        let assoc = self.assoc.as_mut().ok_or(DimseError::IllegalAssociation)?;
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let pdu = assoc
                .receive()
                .map_err(|e| DimseError::pdu(format!("receiving response: {e}")))?;
            match pdu {
                Pdu::PData { data } => {
                    for value in data {
                        if value.value_type != PDataValueType::Command {
                            return Err(DimseError::pdu(
                                "data fragment received while awaiting a command",
                            ));
                        }
                        if value.presentation_context_id != presentation_context_id {
                            return Err(DimseError::IllegalContext(
                                value.presentation_context_id,
                            ));
                        }
                        let is_last = value.is_last;
                        buffer.extend_from_slice(&value.data);
                        if is_last {
                            return CommandSet::decode(&buffer);
                        }
                    }
                }
                Pdu::AbortRQ { source } => {
                    return Err(DimseError::pdu(format!(
                        "association aborted by peer while awaiting response ({source:?})"
                    )));
                }
                other => {
                    return Err(DimseError::pdu(format!(
                        "unexpected PDU while awaiting response: {other:?}"
                    )));
                }
            }
        }
    }

    /// Gracefully releases the association, if one is open.
    pub fn close(&mut self) -> Result<()> {
        self.contexts.clear();
        if let Some(assoc) = self.assoc.take() {
            assoc
                .release()
                .map_err(|e| DimseError::pdu(format!("releasing association: {e}")))?;
            info!(peer = %self.config.peer_aet, "association released");
        }
        Ok(())
    }

    /// Aborts the association, if one is open.
    pub fn abort(&mut self) {
        self.contexts.clear();
        if let Some(assoc) = self.assoc.take() {
            if let Err(e) = assoc.abort() {
                debug!("failed to abort association: {e}");
            }
        }
    }

    /// Delivers one commitment result: verifies the peer with C-ECHO,
    /// sends the notification and releases. When an association is
    /// already open with a usable context, it is reused and left open.
    pub fn run(&mut self, event_type_id: u16, report: &InMemDicomObject) -> Result<()> {
        let pre_resolved = self
            .resolve_context(0, STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS)
            .ok();
        let owns_association = pre_resolved.is_none();
        if owns_association {
            self.connect()?;
        }

        let result = (|| {
            let context = match pre_resolved {
                Some(id) => id,
                None => self.resolve_context(0, STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS)?,
            };
            self.send_echo(context)?;
            self.send_event_report(context, event_type_id, report)
        })();

        if owns_association {
            match result {
                Ok(()) => self.close()?,
                Err(_) => self.abort(),
            }
        } else if result.is_err() {
            self.abort();
        }
        result
    }

    /// Runs the delivery on a blocking worker task, handing the
    /// requestor back together with the outcome.
    pub fn spawn(
        mut self,
        event_type_id: u16,
        report: InMemDicomObject,
    ) -> tokio::task::JoinHandle<(Self, Result<()>)> {
        tokio::task::spawn_blocking(move || {
            let result = self.run(event_type_id, &report);
            (self, result)
        })
    }
}

impl Drop for StorageCommitmentScu {
    fn drop(&mut self) {
        if self.is_connected() {
            self.abort();
        }
    }
}
