//! Common types for DIMSE operations: command fields, command sets,
//! status codes and well-known UIDs.

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::mem::InMemElement;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use uuid::Uuid;

use crate::error::{DimseError, Result};

/// Verification SOP class (C-ECHO)
pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// Modality Performed Procedure Step SOP class, the single object class the
/// SCP answers N-CREATE/N-SET for
pub const MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS: &str = "1.2.840.10008.3.1.2.3.3";

/// Storage Commitment Push Model SOP class (N-EVENT-REPORT)
pub const STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS: &str = "1.2.840.10008.1.20.1";

/// Well-known Storage Commitment Push Model SOP instance
pub const STORAGE_COMMITMENT_PUSH_MODEL_SOP_INSTANCE: &str = "1.2.840.10008.1.20.1.1";

/// Implicit VR Little Endian transfer syntax
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

/// Explicit VR Little Endian transfer syntax
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

/// Explicit VR Big Endian transfer syntax
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// DIMSE status: operation completed successfully
pub const STATUS_SUCCESS: u16 = 0x0000;

/// DIMSE status: the requested SOP class is not supported by this service
pub const STATUS_NO_SUCH_SOP_CLASS: u16 = 0x0118;

/// CommandDataSetType value signalling that no data set follows the command
const DATA_SET_NULL: u16 = 0x0101;

/// CommandDataSetType value signalling that a data set follows the command
const DATA_SET_PRESENT: u16 = 0x0000;

/// DIMSE command field values handled by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandField {
    /// C-ECHO request
    CEchoRq,
    /// C-ECHO response
    CEchoRsp,
    /// N-EVENT-REPORT request
    NEventReportRq,
    /// N-EVENT-REPORT response
    NEventReportRsp,
    /// N-SET request
    NSetRq,
    /// N-SET response
    NSetRsp,
    /// N-CREATE request
    NCreateRq,
    /// N-CREATE response
    NCreateRsp,
    /// Any command field this crate does not process
    Other(u16),
}

impl CommandField {
    /// Interpret a raw command field value
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0100 => CommandField::NEventReportRq,
            0x8100 => CommandField::NEventReportRsp,
            0x0120 => CommandField::NSetRq,
            0x8120 => CommandField::NSetRsp,
            0x0140 => CommandField::NCreateRq,
            0x8140 => CommandField::NCreateRsp,
            other => CommandField::Other(other),
        }
    }

    /// The raw command field value
    pub fn as_u16(&self) -> u16 {
        match self {
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::NEventReportRq => 0x0100,
            CommandField::NEventReportRsp => 0x8100,
            CommandField::NSetRq => 0x0120,
            CommandField::NSetRsp => 0x8120,
            CommandField::NCreateRq => 0x0140,
            CommandField::NCreateRsp => 0x8140,
            CommandField::Other(value) => *value,
        }
    }
}

impl std::fmt::Display for CommandField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandField::CEchoRq => write!(f, "C-ECHO-RQ"),
            CommandField::CEchoRsp => write!(f, "C-ECHO-RSP"),
            CommandField::NEventReportRq => write!(f, "N-EVENT-REPORT-RQ"),
            CommandField::NEventReportRsp => write!(f, "N-EVENT-REPORT-RSP"),
            CommandField::NSetRq => write!(f, "N-SET-RQ"),
            CommandField::NSetRsp => write!(f, "N-SET-RSP"),
            CommandField::NCreateRq => write!(f, "N-CREATE-RQ"),
            CommandField::NCreateRsp => write!(f, "N-CREATE-RSP"),
            CommandField::Other(value) => write!(f, "UNKNOWN(0x{:04x})", value),
        }
    }
}

/// One DIMSE command, decoded from or encoded to a command set data set.
///
/// A command set is always encoded in Implicit VR Little Endian, regardless
/// of the transfer syntax negotiated for the presentation context it travels
/// on. Requests are transient: a command is received, dispatched, and its
/// response synthesized and sent before the next one is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    /// The operation this command performs
    pub field: CommandField,
    /// Message identifier (requests)
    pub message_id: Option<u16>,
    /// Message identifier this command responds to (responses)
    pub responded_to: Option<u16>,
    /// Affected SOP class UID
    pub affected_sop_class: Option<String>,
    /// Requested SOP class UID (N-SET requests)
    pub requested_sop_class: Option<String>,
    /// Affected SOP instance UID
    pub affected_sop_instance: Option<String>,
    /// Requested SOP instance UID (N-SET requests)
    pub requested_sop_instance: Option<String>,
    /// DIMSE status code (responses)
    pub status: Option<u16>,
    /// Event type identifier (N-EVENT-REPORT)
    pub event_type_id: Option<u16>,
    /// Whether a data set follows this command
    pub has_dataset: bool,
}

impl CommandSet {
    fn empty(field: CommandField) -> Self {
        Self {
            field,
            message_id: None,
            responded_to: None,
            affected_sop_class: None,
            requested_sop_class: None,
            affected_sop_instance: None,
            requested_sop_instance: None,
            status: None,
            event_type_id: None,
            has_dataset: false,
        }
    }

    /// Build a C-ECHO request
    pub fn echo_rq(message_id: u16) -> Self {
        Self {
            message_id: Some(message_id),
            affected_sop_class: Some(VERIFICATION_SOP_CLASS.to_string()),
            ..Self::empty(CommandField::CEchoRq)
        }
    }

    /// Build the success response to a C-ECHO request
    pub fn echo_rsp(request: &CommandSet) -> Self {
        Self {
            responded_to: request.message_id,
            affected_sop_class: Some(VERIFICATION_SOP_CLASS.to_string()),
            status: Some(STATUS_SUCCESS),
            ..Self::empty(CommandField::CEchoRsp)
        }
    }

    /// Build the response to an N-CREATE request.
    ///
    /// The affected SOP instance UID is only populated on success; a
    /// "no such SOP class" response omits the field entirely.
    pub fn n_create_rsp(request: &CommandSet, status: u16, instance: Option<String>) -> Self {
        Self {
            responded_to: request.message_id,
            affected_sop_instance: instance,
            status: Some(status),
            ..Self::empty(CommandField::NCreateRsp)
        }
    }

    /// Build the response to an N-SET request
    pub fn n_set_rsp(request: &CommandSet, status: u16) -> Self {
        Self {
            responded_to: request.message_id,
            status: Some(status),
            ..Self::empty(CommandField::NSetRsp)
        }
    }

    /// Build an N-EVENT-REPORT request
    pub fn n_event_report_rq(
        message_id: u16,
        sop_class: &str,
        sop_instance: &str,
        event_type_id: u16,
        has_dataset: bool,
    ) -> Self {
        Self {
            message_id: Some(message_id),
            affected_sop_class: Some(sop_class.to_string()),
            affected_sop_instance: Some(sop_instance.to_string()),
            event_type_id: Some(event_type_id),
            has_dataset,
            ..Self::empty(CommandField::NEventReportRq)
        }
    }

    /// Encode this command into command set bytes (Implicit VR Little Endian)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut elements: Vec<InMemElement<StandardDataDictionary>> = Vec::new();
        elements.push(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [self.field.as_u16()]),
        ));
        if let Some(id) = self.message_id {
            elements.push(DataElement::new(
                tags::MESSAGE_ID,
                VR::US,
                dicom_value!(U16, [id]),
            ));
        }
        if let Some(id) = self.responded_to {
            elements.push(DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [id]),
            ));
        }
        if let Some(uid) = &self.affected_sop_class {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, uid.as_str()),
            ));
        }
        if let Some(uid) = &self.requested_sop_class {
            elements.push(DataElement::new(
                tags::REQUESTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, uid.as_str()),
            ));
        }
        if let Some(uid) = &self.affected_sop_instance {
            elements.push(DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, uid.as_str()),
            ));
        }
        if let Some(uid) = &self.requested_sop_instance {
            elements.push(DataElement::new(
                tags::REQUESTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, uid.as_str()),
            ));
        }
        if let Some(status) = self.status {
            elements.push(DataElement::new(
                tags::STATUS,
                VR::US,
                dicom_value!(U16, [status]),
            ));
        }
        if let Some(event_type) = self.event_type_id {
            elements.push(DataElement::new(
                tags::EVENT_TYPE_ID,
                VR::US,
                dicom_value!(U16, [event_type]),
            ));
        }
        let data_set_type = if self.has_dataset {
            DATA_SET_PRESENT
        } else {
            DATA_SET_NULL
        };
        elements.push(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [data_set_type]),
        ));

        let obj = InMemDicomObject::command_from_element_iter(elements);
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut data = Vec::new();
        obj.write_dataset_with_ts(&mut data, &ts)
            .map_err(|e| DimseError::command(e.to_string()))?;
        Ok(data)
    }

    /// Decode a command from command set bytes (Implicit VR Little Endian)
    pub fn decode(data: &[u8]) -> Result<Self> {
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj = InMemDicomObject::read_dataset_with_ts(data, &ts)
            .map_err(|e| DimseError::command(e.to_string()))?;

        let raw_field = read_u16(&obj, tags::COMMAND_FIELD)?
            .ok_or_else(|| DimseError::command("command set carries no command field"))?;
        let data_set_type = read_u16(&obj, tags::COMMAND_DATA_SET_TYPE)?.unwrap_or(DATA_SET_NULL);

        Ok(Self {
            field: CommandField::from_u16(raw_field),
            message_id: read_u16(&obj, tags::MESSAGE_ID)?,
            responded_to: read_u16(&obj, tags::MESSAGE_ID_BEING_RESPONDED_TO)?,
            affected_sop_class: read_uid(&obj, tags::AFFECTED_SOP_CLASS_UID),
            requested_sop_class: read_uid(&obj, tags::REQUESTED_SOP_CLASS_UID),
            affected_sop_instance: read_uid(&obj, tags::AFFECTED_SOP_INSTANCE_UID),
            requested_sop_instance: read_uid(&obj, tags::REQUESTED_SOP_INSTANCE_UID),
            status: read_u16(&obj, tags::STATUS)?,
            event_type_id: read_u16(&obj, tags::EVENT_TYPE_ID)?,
            has_dataset: data_set_type != DATA_SET_NULL,
        })
    }
}

fn read_u16(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Result<Option<u16>> {
    match obj.element(tag) {
        Ok(element) => {
            let value = element
                .to_int::<u16>()
                .map_err(|e| DimseError::command(e.to_string()))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

fn read_uid(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<String> {
    let value = obj
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())?;
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Generate a fresh, globally unique DICOM UID (UUID-derived, `2.25.` root)
pub fn generate_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// Look up a registered transfer syntax by UID
pub fn lookup_transfer_syntax(uid: &str) -> Result<&'static TransferSyntax> {
    TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| DimseError::command(format!("unsupported transfer syntax '{}'", uid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_field_roundtrip() {
        assert_eq!(CommandField::from_u16(0x0030), CommandField::CEchoRq);
        assert_eq!(CommandField::from_u16(0x8140), CommandField::NCreateRsp);
        assert_eq!(CommandField::from_u16(0x0001), CommandField::Other(0x0001));
        assert_eq!(CommandField::Other(0x0001).as_u16(), 0x0001);
    }

    #[test]
    fn test_echo_command_encode_decode() {
        let rq = CommandSet::echo_rq(7);
        let data = rq.encode().unwrap();
        let decoded = CommandSet::decode(&data).unwrap();

        assert_eq!(decoded.field, CommandField::CEchoRq);
        assert_eq!(decoded.message_id, Some(7));
        assert_eq!(
            decoded.affected_sop_class.as_deref(),
            Some(VERIFICATION_SOP_CLASS)
        );
        assert!(!decoded.has_dataset);
    }

    #[test]
    fn test_n_create_rsp_omits_instance_on_failure() {
        let rq = CommandSet {
            message_id: Some(3),
            affected_sop_class: Some("1.2.3.4".to_string()),
            ..CommandSet::empty(CommandField::NCreateRq)
        };
        let rsp = CommandSet::n_create_rsp(&rq, STATUS_NO_SUCH_SOP_CLASS, None);
        let decoded = CommandSet::decode(&rsp.encode().unwrap()).unwrap();

        assert_eq!(decoded.field, CommandField::NCreateRsp);
        assert_eq!(decoded.responded_to, Some(3));
        assert_eq!(decoded.status, Some(STATUS_NO_SUCH_SOP_CLASS));
        assert!(decoded.affected_sop_instance.is_none());
    }

    #[test]
    fn test_event_report_rq_flags_dataset() {
        let rq = CommandSet::n_event_report_rq(
            11,
            STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS,
            STORAGE_COMMITMENT_PUSH_MODEL_SOP_INSTANCE,
            1,
            true,
        );
        let decoded = CommandSet::decode(&rq.encode().unwrap()).unwrap();

        assert_eq!(decoded.field, CommandField::NEventReportRq);
        assert_eq!(decoded.event_type_id, Some(1));
        assert!(decoded.has_dataset);
    }

    #[test]
    fn test_generated_uids_are_valid_and_unique() {
        let a = generate_uid();
        let b = generate_uid();
        assert_ne!(a, b);
        for uid in [&a, &b] {
            assert!(uid.len() <= 64);
            assert!(uid.starts_with("2.25."));
            assert!(uid.chars().all(|c| c.is_ascii_digit() || c == '.'));
            assert!(!uid.contains(".."));
        }
    }

    #[test]
    fn test_transfer_syntax_lookup() {
        assert!(lookup_transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN).is_ok());
        assert!(lookup_transfer_syntax("1.2.3.999").is_err());
    }
}
