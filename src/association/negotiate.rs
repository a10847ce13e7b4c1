//! Acceptor-side presentation context negotiation.

use dicom_ul::pdu::{
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
};
use tracing::debug;

use crate::association::presentation::{
    ContextRole, NegotiatedContext, PresentationContextTable,
};
use crate::profile::ContextProfile;

/// The answer to a set of proposed presentation contexts: one result
/// per proposal, in proposal order, plus the accepted table.
#[derive(Debug)]
pub struct NegotiationOutcome {
    pub results: Vec<PresentationContextResult>,
    pub accepted: PresentationContextTable,
}

impl NegotiationOutcome {
    pub fn all_rejected(&self) -> bool {
        self.accepted.is_empty()
    }
}

/// Evaluates each proposed context against the profile.
///
/// A context is accepted with the first proposed transfer syntax the
/// profile allows for its abstract syntax. Unknown abstract syntaxes
/// and proposals with no allowed transfer syntax are rejected with the
/// matching reason, and every proposal gets an answer either way.
pub fn evaluate(
    proposed: &[PresentationContextProposed],
    profile: &ContextProfile,
) -> NegotiationOutcome {
    let mut results = Vec::with_capacity(proposed.len());
    let mut accepted = PresentationContextTable::new();

    for context in proposed {
        let allowed = match profile.allowed_for(&context.abstract_syntax) {
            Some(def) => def,
            None => {
                debug!(
                    id = context.id,
                    abstract_syntax = %context.abstract_syntax,
                    "rejecting context: abstract syntax not supported"
                );
                results.push(PresentationContextResult {
                    id: context.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: "1.2.840.10008.1.2".to_string(),
                });
                continue;
            }
        };

        let chosen = context
            .transfer_syntaxes
            .iter()
            .find(|ts| allowed.transfer_syntaxes.iter().any(|a| a == *ts));

        match chosen {
            Some(ts) => {
                debug!(
                    id = context.id,
                    abstract_syntax = %context.abstract_syntax,
                    transfer_syntax = %ts,
                    "accepting context"
                );
                results.push(PresentationContextResult {
                    id: context.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: ts.clone(),
                });
                accepted.insert(NegotiatedContext {
                    id: context.id,
                    abstract_syntax: context.abstract_syntax.clone(),
                    transfer_syntax: ts.clone(),
                    role: ContextRole::Acceptor,
                });
            }
            None => {
                debug!(
                    id = context.id,
                    abstract_syntax = %context.abstract_syntax,
                    "rejecting context: no acceptable transfer syntax"
                );
                results.push(PresentationContextResult {
                    id: context.id,
                    reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                    transfer_syntax: "1.2.840.10008.1.2".to_string(),
                });
            }
        }
    }

    NegotiationOutcome { results, accepted }
}
