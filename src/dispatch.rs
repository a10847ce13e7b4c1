//! Command routing for the acceptor.

use tracing::{debug, warn};

use crate::error::{DimseError, Result};
use crate::types::{
    generate_uid, CommandField, CommandSet, MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS,
    STATUS_NO_SUCH_SOP_CLASS, STATUS_SUCCESS,
};

/// What dispatch produced for a request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Send this response back on the same context.
    Reply(CommandSet),
    /// The message was consumed and expects no response.
    NoReply,
}

/// Routes incoming DIMSE requests to their handlers.
///
/// Verification is always answered. N-CREATE and N-SET are acknowledged
/// for the supported SOP class and refused with "no such SOP class"
/// otherwise; the procedure step content itself is not interpreted.
/// Storage commitment result notifications are accepted silently so a
/// committing peer can deliver them over an association it opened to us.
pub struct CommandDispatcher {
    supported_sop_class: String,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self {
            supported_sop_class: MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS.to_string(),
        }
    }
}

impl CommandDispatcher {
    pub fn new(supported_sop_class: impl Into<String>) -> Self {
        Self {
            supported_sop_class: supported_sop_class.into(),
        }
    }

    pub fn dispatch(&self, request: &CommandSet) -> Result<DispatchOutcome> {
        match request.field {
            CommandField::CEchoRq => {
                debug!(message_id = request.message_id, "answering C-ECHO");
                Ok(DispatchOutcome::Reply(CommandSet::echo_rsp(request)))
            }
            CommandField::NCreateRq => Ok(DispatchOutcome::Reply(self.handle_create(request))),
            CommandField::NSetRq => Ok(DispatchOutcome::Reply(self.handle_set(request))),
            CommandField::NEventReportRq => {
                debug!(
                    message_id = request.message_id,
                    event_type_id = request.event_type_id,
                    "consuming event report notification"
                );
                Ok(DispatchOutcome::NoReply)
            }
            other => Err(DimseError::UnsupportedCommand(other.as_u16())),
        }
    }

    fn handle_create(&self, request: &CommandSet) -> CommandSet {
        let class = request.affected_sop_class.as_deref().unwrap_or_default();
        if class != self.supported_sop_class {
            warn!(sop_class = class, "refusing N-CREATE for unsupported SOP class");
            return CommandSet::n_create_rsp(request, STATUS_NO_SUCH_SOP_CLASS, None);
        }
        // the peer may leave instance selection to us
        let instance = request
            .affected_sop_instance
            .clone()
            .unwrap_or_else(generate_uid);
        debug!(
            message_id = request.message_id,
            instance = %instance,
            "procedure step created"
        );
        CommandSet::n_create_rsp(request, STATUS_SUCCESS, Some(instance))
    }

    fn handle_set(&self, request: &CommandSet) -> CommandSet {
        let class = request.requested_sop_class.as_deref().unwrap_or_default();
        if class != self.supported_sop_class {
            warn!(sop_class = class, "refusing N-SET for unsupported SOP class");
            return CommandSet::n_set_rsp(request, STATUS_NO_SUCH_SOP_CLASS);
        }
        debug!(
            message_id = request.message_id,
            instance = request.requested_sop_instance.as_deref(),
            "procedure step updated"
        );
        CommandSet::n_set_rsp(request, STATUS_SUCCESS)
    }
}
