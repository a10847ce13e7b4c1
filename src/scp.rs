//! The procedure step acceptor service.
//!
//! Listens for incoming associations, negotiates them against a
//! context profile and serves DIMSE messages until the peer releases,
//! aborts or fails. Association I/O is synchronous and runs on
//! blocking worker tasks; the accept loop itself is async so shutdown
//! and connection limits stay responsive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::association::server::{establish, AcceptOutcome, ReceiveOutcome, ServerSession};
use crate::config::ScpConfig;
use crate::dispatch::{CommandDispatcher, DispatchOutcome};
use crate::error::{DimseError, Result};
use crate::events::{CommandInfo, LogMonitor, SessionMonitor};
use crate::profile::{ContextProfile, ProfileRegistry};

/// Modality Performed Procedure Step acceptor.
pub struct MppsScp {
    config: ScpConfig,
    profile: Arc<ContextProfile>,
    dispatcher: Arc<CommandDispatcher>,
    monitor: Arc<dyn SessionMonitor>,
    shutdown: CancellationToken,
    active: Arc<AtomicU32>,
}

impl MppsScp {
    /// Creates the acceptor with the default log monitor. The profile
    /// named in the configuration must exist in the registry.
    pub fn new(config: ScpConfig, registry: &ProfileRegistry) -> Result<Self> {
        Self::with_monitor(config, registry, Arc::new(LogMonitor))
    }

    pub fn with_monitor(
        config: ScpConfig,
        registry: &ProfileRegistry,
        monitor: Arc<dyn SessionMonitor>,
    ) -> Result<Self> {
        config.validate()?;
        let profile = registry
            .get(&config.profile_name)
            .ok_or_else(|| {
                DimseError::config(format!("unknown profile {:?}", config.profile_name))
            })?
            .clone();
        if profile.is_empty() {
            return Err(DimseError::config(format!(
                "profile {:?} has no presentation contexts",
                config.profile_name
            )));
        }
        Ok(Self {
            config,
            profile: Arc::new(profile),
            dispatcher: Arc::new(CommandDispatcher::default()),
            monitor,
            shutdown: CancellationToken::new(),
            active: Arc::new(AtomicU32::new(0)),
        })
    }

    /// A token that stops the accept loop when cancelled. Associations
    /// already in flight run to completion.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn active_associations(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, aet = %self.config.local_aet, "listening for associations");
        self.serve(listener).await
    }

    /// Serves associations from an already-bound listener. Useful for
    /// binding to an ephemeral port first.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                info!("shutdown requested, accept loop stopping");
                return Ok(());
            }

            let accepted = match timeout(self.config.accept_poll(), listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    warn!("accept failed: {e}");
                    continue;
                }
                // poll tick, check the shutdown flag again
                Err(_) => continue,
            };
            let (stream, peer_addr) = accepted;

            if self.active.load(Ordering::Acquire) >= self.config.max_associations {
                warn!(%peer_addr, "association limit reached, dropping connection");
                drop(stream);
                continue;
            }

            let stream = match stream.into_std() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer_addr, "cannot detach accepted socket: {e}");
                    continue;
                }
            };
            if let Err(e) = stream.set_nonblocking(false) {
                warn!(%peer_addr, "cannot configure accepted socket: {e}");
                continue;
            }

            let config = self.config.clone();
            let profile = Arc::clone(&self.profile);
            let dispatcher = Arc::clone(&self.dispatcher);
            let monitor = Arc::clone(&self.monitor);
            let active = Arc::clone(&self.active);

            active.fetch_add(1, Ordering::AcqRel);
            tokio::task::spawn_blocking(move || {
                handle_connection(stream, peer_addr, &config, &profile, &dispatcher, &*monitor);
                active.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }
}

fn handle_connection(
    stream: std::net::TcpStream,
    peer_addr: SocketAddr,
    config: &ScpConfig,
    profile: &ContextProfile,
    dispatcher: &CommandDispatcher,
    monitor: &dyn SessionMonitor,
) {
    let mut session = match establish(stream, peer_addr, config, profile, monitor) {
        Ok(AcceptOutcome::Established(session)) => session,
        Ok(AcceptOutcome::Refused(reason)) => {
            debug!(%peer_addr, %reason, "association refused");
            return;
        }
        Err(e) => {
            warn!(%peer_addr, "association establishment failed: {e}");
            return;
        }
    };

    monitor.association_acknowledged(session.association_info());
    serve_session(&mut session, dispatcher, monitor);
    let info = session.association_info().clone();
    session.close();
    monitor.association_terminated(&info);
}

fn serve_session(
    session: &mut ServerSession,
    dispatcher: &CommandDispatcher,
    monitor: &dyn SessionMonitor,
) {
    loop {
        match session.receive_message() {
            Ok(ReceiveOutcome::Command {
                context_id,
                command,
            }) => {
                if let Err(e) = handle_command(session, dispatcher, monitor, context_id, command) {
                    monitor.dimse_error(session.association_info(), &e);
                    session.abort();
                    return;
                }
            }
            Ok(ReceiveOutcome::Released) => {
                monitor.release_requested(session.association_info());
                if let Err(e) = session.acknowledge_release() {
                    warn!("failed to acknowledge release: {e}");
                }
                return;
            }
            Ok(ReceiveOutcome::Aborted) => {
                monitor.abort_received(session.association_info());
                session.close();
                return;
            }
            Err(e) => {
                monitor.dimse_error(session.association_info(), &e);
                session.abort();
                return;
            }
        }
    }
}

fn handle_command(
    session: &mut ServerSession,
    dispatcher: &CommandDispatcher,
    monitor: &dyn SessionMonitor,
    context_id: u8,
    command: crate::types::CommandSet,
) -> Result<()> {
    // consume the accompanying data set before anything else so the
    // stream stays aligned even when dispatch refuses the request
    let payload_bytes = if command.has_dataset {
        Some(session.receive_payload(context_id)?.len())
    } else {
        None
    };

    monitor.command_dispatched(
        session.association_info(),
        &CommandInfo {
            context_id,
            field: command.field,
            message_id: command.message_id,
            payload_bytes,
        },
    );

    match dispatcher.dispatch(&command)? {
        DispatchOutcome::Reply(response) => session.send_command(context_id, &response),
        DispatchOutcome::NoReply => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_profile_is_rejected_up_front() {
        let config = ScpConfig {
            profile_name: "NOPE".to_string(),
            ..ScpConfig::default()
        };
        let registry = ProfileRegistry::builtin();
        match MppsScp::new(config, &registry) {
            Err(DimseError::Config(msg)) => assert!(msg.contains("NOPE")),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected configuration error"),
        }
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = ScpConfig {
            local_aet: String::new(),
            ..ScpConfig::default()
        };
        let registry = ProfileRegistry::builtin();
        assert!(MppsScp::new(config, &registry).is_err());
    }
}
