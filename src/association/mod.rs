//! Association negotiation and session handling.

pub mod negotiate;
pub mod presentation;
pub mod server;

pub use negotiate::{evaluate, NegotiationOutcome};
pub use presentation::{ContextRole, NegotiatedContext, PresentationContextTable};
pub use server::{establish, AcceptOutcome, ReceiveOutcome, ServerSession};
