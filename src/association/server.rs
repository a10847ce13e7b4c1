//! Acceptor-side association establishment and message exchange.
//!
//! Establishment reads the A-ASSOCIATE-RQ and answers with either an
//! A-ASSOCIATE-AC or an A-ASSOCIATE-RJ, checking the application
//! context, the called AE title and the proposed presentation contexts
//! in that order. An established session then surfaces commands,
//! release requests and aborts one at a time, and tears the trans-
//! port down exactly once no matter which way the association ends.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dicom_ul::association::read_pdu_from_wire;
use dicom_ul::pdu::{
    AbortRQSource, AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
    PDataValue, PDataValueType, Pdu, UserVariableItem,
};
use dicom_ul::write_pdu;
use tracing::{debug, warn};

use crate::association::negotiate;
use crate::association::presentation::PresentationContextTable;
use crate::config::ScpConfig;
use crate::error::{DimseError, RefuseReason, Result};
use crate::events::{AssociationInfo, SessionMonitor};
use crate::profile::ContextProfile;
use crate::types::CommandSet;
use crate::{APPLICATION_CONTEXT_NAME, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Room the P-DATA-TF framing takes out of the peer's PDU allowance.
const PDU_HEADER_OVERHEAD: u32 = 12;

/// How association establishment ended.
pub enum AcceptOutcome {
    Established(ServerSession),
    Refused(RefuseReason),
}

/// What the peer sent next on an established association.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A complete command set arrived on the given context.
    Command { context_id: u8, command: CommandSet },
    /// The peer asked to release the association.
    Released,
    /// The peer aborted the association.
    Aborted,
}

/// Reads the association request from a fresh connection and answers
/// it. On refusal the RJ has already been written and the connection
/// closed; the caller only has to log.
pub fn establish(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: &ScpConfig,
    profile: &ContextProfile,
    monitor: &dyn SessionMonitor,
) -> Result<AcceptOutcome> {
    let mut stream = stream;
    stream.set_read_timeout(Some(config.acse_timeout()))?;
    stream.set_write_timeout(Some(config.acse_timeout()))?;

    // Partial PDU bytes stay in this buffer between reads, so it has
    // to live as long as the connection does.
    let mut read_buffer = BytesMut::with_capacity(config.max_pdu as usize);
    let msg = read_pdu_from_wire(&mut stream, &mut read_buffer, config.max_pdu, false)
        .map_err(|e| DimseError::pdu(format!("reading association request: {e}")))?;
    let rq = match msg {
        Pdu::AssociationRQ(rq) => rq,
        other => {
            return Err(DimseError::pdu(format!(
                "expected association request, got {}",
                pdu_name(&other)
            )));
        }
    };

    let info = AssociationInfo {
        calling_ae_title: rq.calling_ae_title.trim().to_string(),
        called_ae_title: rq.called_ae_title.trim().to_string(),
        peer_addr,
        received_at: Utc::now(),
    };
    monitor.association_received(&info);

    if rq.application_context_name != APPLICATION_CONTEXT_NAME {
        let reason = RefuseReason::BadApplicationContext(rq.application_context_name.clone());
        monitor.association_refused(&info, &reason);
        refuse(
            &mut stream,
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
        );
        return Ok(AcceptOutcome::Refused(reason));
    }

    if !config.accepts_called_aet(&rq.called_ae_title) {
        let reason = RefuseReason::CalledAeTitleNotRecognized(info.called_ae_title.clone());
        monitor.association_refused(&info, &reason);
        refuse(
            &mut stream,
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        );
        return Ok(AcceptOutcome::Refused(reason));
    }

    let outcome = negotiate::evaluate(&rq.presentation_contexts, profile);
    if outcome.all_rejected() {
        let reason = RefuseReason::NoAcceptablePresentationContexts;
        monitor.association_refused(&info, &reason);
        refuse(&mut stream, AssociationRJServiceUserReason::NoReasonGiven);
        return Ok(AcceptOutcome::Refused(reason));
    }

    let peer_max_pdu = rq
        .user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
        .unwrap_or(crate::DEFAULT_MAX_PDU);

    let ac = Pdu::AssociationAC(dicom_ul::pdu::AssociationAC {
        protocol_version: rq.protocol_version,
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: outcome.results,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        user_variables: vec![
            UserVariableItem::MaxLength(config.max_pdu),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ],
    });
    send_pdu(&mut stream, &ac)?;

    stream.set_read_timeout(config.dimse_timeout())?;
    stream.set_write_timeout(config.dimse_timeout())?;

    Ok(AcceptOutcome::Established(ServerSession {
        stream: Some(stream),
        info,
        contexts: outcome.accepted,
        peer_max_pdu,
        max_pdu: config.max_pdu,
        read_buffer,
        pending: VecDeque::new(),
    }))
}

fn refuse(stream: &mut TcpStream, reason: AssociationRJServiceUserReason) {
    let rj = Pdu::AssociationRJ(dicom_ul::pdu::AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(reason),
    });
    // the connection is going away either way
    if let Err(e) = send_pdu(stream, &rj) {
        debug!("failed to send association rejection: {e}");
    }
    let _ = stream.shutdown(Shutdown::Both);
}

fn send_pdu(stream: &mut TcpStream, pdu: &Pdu) -> Result<()> {
    let mut buffer = Vec::new();
    write_pdu(&mut buffer, pdu).map_err(|e| DimseError::pdu(format!("encoding {}: {e}", pdu_name(pdu))))?;
    stream.write_all(&buffer)?;
    Ok(())
}

fn pdu_name(pdu: &Pdu) -> &'static str {
    match pdu {
        Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
        Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
        Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
        Pdu::PData { .. } => "P-DATA-TF",
        Pdu::ReleaseRQ => "A-RELEASE-RQ",
        Pdu::ReleaseRP => "A-RELEASE-RP",
        Pdu::AbortRQ { .. } => "A-ABORT",
        _ => "unknown PDU",
    }
}

/// An established acceptor-side association.
///
/// Owns the transport; dropping the session aborts the association if
/// it was not terminated first.
pub struct ServerSession {
    stream: Option<TcpStream>,
    info: AssociationInfo,
    contexts: PresentationContextTable,
    peer_max_pdu: u32,
    max_pdu: u32,
    read_buffer: BytesMut,
    pending: VecDeque<PDataValue>,
}

impl ServerSession {
    pub fn association_info(&self) -> &AssociationInfo {
        &self.info
    }

    pub fn contexts(&self) -> &PresentationContextTable {
        &self.contexts
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(DimseError::IllegalAssociation)
    }

    fn read_next(&mut self) -> Result<Pdu> {
        let stream = self.stream.as_mut().ok_or(DimseError::IllegalAssociation)?;
        read_pdu_from_wire(stream, &mut self.read_buffer, self.max_pdu, false)
            .map_err(|e| DimseError::pdu(format!("reading PDU: {e}")))
    }

    fn next_value(&mut self) -> Result<Option<PDataValue>> {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return Ok(Some(value));
            }
            match self.read_next()? {
                Pdu::PData { data } => self.pending.extend(data),
                Pdu::ReleaseRQ | Pdu::AbortRQ { .. } => return Ok(None),
                other => {
                    return Err(DimseError::pdu(format!(
                        "unexpected {} on established association",
                        pdu_name(&other)
                    )));
                }
            }
        }
    }

    /// Waits for the next DIMSE message or association termination.
    pub fn receive_message(&mut self) -> Result<ReceiveOutcome> {
        let mut context_id: Option<u8> = None;
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            if self.pending.is_empty() {
                match self.read_next()? {
                    Pdu::PData { data } => self.pending.extend(data),
                    Pdu::ReleaseRQ => {
                        if context_id.is_some() {
                            return Err(DimseError::pdu(
                                "release request arrived before the command was complete",
                            ));
                        }
                        return Ok(ReceiveOutcome::Released);
                    }
                    Pdu::AbortRQ { source } => {
                        debug!(?source, "association aborted by peer");
                        return Ok(ReceiveOutcome::Aborted);
                    }
                    other => {
                        return Err(DimseError::pdu(format!(
                            "unexpected {} on established association",
                            pdu_name(&other)
                        )));
                    }
                }
                continue;
            }

            let Some(value) = self.pending.pop_front() else {
                continue;
            };
            if value.value_type != PDataValueType::Command {
                return Err(DimseError::pdu(
                    "data fragment received while awaiting a command",
                ));
            }
            match context_id {
                None => context_id = Some(value.presentation_context_id),
                Some(id) if id != value.presentation_context_id => {
                    return Err(DimseError::pdu(
                        "command fragments interleaved across contexts",
                    ));
                }
                Some(_) => {}
            }
            buffer.extend_from_slice(&value.data);
            if value.is_last {
                let id = context_id.unwrap_or_default();
                if self.contexts.get(id).is_none() {
                    return Err(DimseError::IllegalContext(id));
                }
                let command = CommandSet::decode(&buffer)?;
                return Ok(ReceiveOutcome::Command {
                    context_id: id,
                    command,
                });
            }
        }
    }

    /// Collects the data set that follows a command, reassembling
    /// fragments until the last one.
    pub fn receive_payload(&mut self, context_id: u8) -> Result<Bytes> {
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let value = match self.next_value()? {
                Some(value) => value,
                None => {
                    return Err(DimseError::pdu(
                        "association terminated while awaiting data",
                    ));
                }
            };
            if value.value_type != PDataValueType::Data {
                return Err(DimseError::pdu(
                    "command fragment received while awaiting data",
                ));
            }
            if value.presentation_context_id != context_id {
                return Err(DimseError::IllegalContext(value.presentation_context_id));
            }
            buffer.extend_from_slice(&value.data);
            if value.is_last {
                return Ok(Bytes::from(buffer));
            }
        }
    }

    /// Sends a command set on the given context, fragmented to the
    /// peer's advertised PDU allowance.
    pub fn send_command(&mut self, context_id: u8, command: &CommandSet) -> Result<()> {
        if self.contexts.get(context_id).is_none() {
            return Err(DimseError::IllegalContext(context_id));
        }
        let encoded = command.encode()?;
        let chunk_len = (self.peer_max_pdu.saturating_sub(PDU_HEADER_OVERHEAD)).max(64) as usize;
        let chunks: Vec<&[u8]> = if encoded.is_empty() {
            vec![&[]]
        } else {
            encoded.chunks(chunk_len).collect()
        };
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let pdu = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: context_id,
                    value_type: PDataValueType::Command,
                    is_last: i + 1 == count,
                    data: chunk.to_vec(),
                }],
            };
            let stream = self.stream()?;
            send_pdu(stream, &pdu)?;
        }
        Ok(())
    }

    /// Confirms the peer's release request and closes the transport.
    pub fn acknowledge_release(&mut self) -> Result<()> {
        let stream = self.stream()?;
        send_pdu(stream, &Pdu::ReleaseRP)?;
        self.close();
        Ok(())
    }

    /// Aborts the association. Write errors are ignored since the
    /// transport is going away regardless.
    pub fn abort(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let pdu = Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            };
            if let Err(e) = send_pdu(stream, &pdu) {
                warn!("failed to send abort: {e}");
            }
        }
        self.close();
    }

    /// Tears the transport down. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.pending.clear();
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if self.is_open() {
            self.abort();
        }
    }
}
