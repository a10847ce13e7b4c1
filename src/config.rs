//! Configuration for the acceptor and requestor roles.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DimseError, Result};

fn default_scp_aet() -> String {
    "MPPSSCP".to_string()
}

fn default_scu_aet() -> String {
    "STORCMTSCU".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    11112
}

fn default_peer_port() -> u16 {
    104
}

fn default_max_pdu() -> u32 {
    16384
}

fn default_accept_poll_ms() -> u64 {
    1000
}

fn default_acse_timeout_ms() -> u64 {
    30_000
}

fn default_max_associations() -> u32 {
    16
}

fn default_profile_name() -> String {
    "DEFAULT".to_string()
}

/// Settings for the association acceptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScpConfig {
    /// Our application entity title.
    #[serde(default = "default_scp_aet")]
    pub local_aet: String,

    /// Called AE titles we answer to. Empty means only `local_aet`.
    #[serde(default)]
    pub accepted_called_aets: Vec<String>,

    /// Address to listen on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size we advertise to peers.
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// How often the accept loop wakes up to check for shutdown.
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,

    /// Socket timeout while negotiating an association.
    #[serde(default = "default_acse_timeout_ms")]
    pub acse_timeout_ms: u64,

    /// Socket timeout between messages on an established association.
    /// `None` waits indefinitely, matching peers that hold associations
    /// open between procedure steps.
    #[serde(default)]
    pub dimse_timeout_ms: Option<u64>,

    /// Maximum number of simultaneous associations.
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Name of the presentation context profile to negotiate with.
    #[serde(default = "default_profile_name")]
    pub profile_name: String,
}

impl Default for ScpConfig {
    fn default() -> Self {
        Self {
            local_aet: default_scp_aet(),
            accepted_called_aets: Vec::new(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            accept_poll_ms: default_accept_poll_ms(),
            acse_timeout_ms: default_acse_timeout_ms(),
            dimse_timeout_ms: None,
            max_associations: default_max_associations(),
            profile_name: default_profile_name(),
        }
    }
}

impl ScpConfig {
    /// Whether we answer to the given called AE title.
    pub fn accepts_called_aet(&self, called: &str) -> bool {
        let called = called.trim();
        if self.accepted_called_aets.is_empty() {
            return called == self.local_aet;
        }
        self.accepted_called_aets.iter().any(|a| a == called)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn acse_timeout(&self) -> Duration {
        Duration::from_millis(self.acse_timeout_ms)
    }

    pub fn dimse_timeout(&self) -> Option<Duration> {
        self.dimse_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        validate_aet("local_aet", &self.local_aet)?;
        for aet in &self.accepted_called_aets {
            validate_aet("accepted_called_aets", aet)?;
        }
        if self.port == 0 {
            return Err(DimseError::config("port must be non-zero"));
        }
        validate_max_pdu(self.max_pdu)?;
        if self.accept_poll_ms == 0 {
            return Err(DimseError::config("accept_poll_ms must be non-zero"));
        }
        Ok(())
    }
}

/// Settings for the association requestor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScuConfig {
    /// Our application entity title.
    #[serde(default = "default_scu_aet")]
    pub calling_aet: String,

    /// The peer's application entity title.
    pub peer_aet: String,

    /// The peer's host name or address.
    pub peer_host: String,

    /// The peer's TCP port.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    /// Maximum PDU size we advertise to the peer.
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Socket timeout while negotiating an association.
    #[serde(default = "default_acse_timeout_ms")]
    pub acse_timeout_ms: u64,

    /// Name of the presentation context profile to propose from.
    #[serde(default = "default_profile_name")]
    pub profile_name: String,
}

impl ScuConfig {
    pub fn new(peer_aet: impl Into<String>, peer_host: impl Into<String>, peer_port: u16) -> Self {
        Self {
            calling_aet: default_scu_aet(),
            peer_aet: peer_aet.into(),
            peer_host: peer_host.into(),
            peer_port,
            max_pdu: default_max_pdu(),
            acse_timeout_ms: default_acse_timeout_ms(),
            profile_name: default_profile_name(),
        }
    }

    /// The `AET@host:port` address form used when opening associations.
    pub fn peer_address(&self) -> String {
        format!("{}@{}:{}", self.peer_aet, self.peer_host, self.peer_port)
    }

    pub fn validate(&self) -> Result<()> {
        validate_aet("calling_aet", &self.calling_aet)?;
        validate_aet("peer_aet", &self.peer_aet)?;
        if self.peer_host.trim().is_empty() {
            return Err(DimseError::config("peer_host must not be empty"));
        }
        if self.peer_port == 0 {
            return Err(DimseError::config("peer_port must be non-zero"));
        }
        validate_max_pdu(self.max_pdu)?;
        Ok(())
    }
}

fn validate_aet(field: &str, aet: &str) -> Result<()> {
    if aet.is_empty() || aet.len() > 16 {
        return Err(DimseError::config(format!(
            "{field}: AE title must be 1 to 16 characters, got {:?}",
            aet
        )));
    }
    if !aet.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(DimseError::config(format!(
            "{field}: AE title contains non-printable characters"
        )));
    }
    Ok(())
}

fn validate_max_pdu(max_pdu: u32) -> Result<()> {
    if !(16384..=131_072).contains(&max_pdu) {
        return Err(DimseError::config(format!(
            "max_pdu must be between 16384 and 131072, got {max_pdu}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scp_defaults_validate() {
        let config = ScpConfig::default();
        config.validate().unwrap();
        assert_eq!(config.local_aet, "MPPSSCP");
        assert_eq!(config.port, 11112);
        assert!(config.dimse_timeout().is_none());
    }

    #[test]
    fn empty_accept_list_means_local_aet_only() {
        let config = ScpConfig::default();
        assert!(config.accepts_called_aet("MPPSSCP"));
        assert!(config.accepts_called_aet("MPPSSCP ")); // trailing padding
        assert!(!config.accepts_called_aet("OTHER"));

        let config = ScpConfig {
            accepted_called_aets: vec!["A".into(), "B".into()],
            ..ScpConfig::default()
        };
        assert!(config.accepts_called_aet("B"));
        assert!(!config.accepts_called_aet("MPPSSCP"));
    }

    #[test]
    fn rejects_bad_aet_and_pdu_sizes() {
        let config = ScpConfig {
            local_aet: String::new(),
            ..ScpConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ScpConfig {
            local_aet: "THIS_TITLE_IS_FAR_TOO_LONG".into(),
            ..ScpConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ScpConfig {
            max_pdu: 1024,
            ..ScpConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn scu_config_forms_peer_address() {
        let config = ScuConfig::new("STORCMTSCP", "pacs.example.org", 11113);
        config.validate().unwrap();
        assert_eq!(config.peer_address(), "STORCMTSCP@pacs.example.org:11113");
    }

    #[test]
    fn scu_parses_from_toml_with_defaults() {
        let config: ScuConfig = toml::from_str(
            r#"
            peer_aet = "COMMITSCP"
            peer_host = "127.0.0.1"
            "#,
        )
        .unwrap();
        assert_eq!(config.calling_aet, "STORCMTSCU");
        assert_eq!(config.peer_port, 104);
        config.validate().unwrap();
    }
}
