//! Presentation context profiles.
//!
//! A profile names the abstract syntaxes an application is prepared to
//! negotiate and, per abstract syntax, the transfer syntaxes it will
//! accept or propose, in preference order. Profiles can be declared in
//! TOML so that a deployment can widen or narrow the negotiated set
//! without code changes.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DimseError, Result};
use crate::types::{
    EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
    MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS, STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS,
    VERIFICATION_SOP_CLASS,
};

/// One proposable/acceptable presentation context: an abstract syntax
/// plus the transfer syntaxes allowed for it, in preference order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDef {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

impl ContextDef {
    pub fn new(abstract_syntax: impl Into<String>, transfer_syntaxes: &[&str]) -> Self {
        Self {
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A named set of context definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextProfile {
    #[serde(default)]
    pub contexts: Vec<ContextDef>,
}

impl ContextProfile {
    /// Looks up the context definition for an abstract syntax, if the
    /// profile allows it. The first matching definition wins.
    pub fn allowed_for(&self, abstract_syntax: &str) -> Option<&ContextDef> {
        self.contexts
            .iter()
            .find(|c| c.abstract_syntax == abstract_syntax)
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: HashMap<String, ContextProfile>,
}

/// Registry of named context profiles.
///
/// Always contains the built-in `DEFAULT` profile; profiles loaded from
/// configuration are merged on top and may shadow it.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, ContextProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileRegistry {
    /// The built-in registry: a `DEFAULT` profile covering Verification,
    /// Modality Performed Procedure Step and Storage Commitment Push
    /// Model, preferring Explicit VR Little Endian.
    pub fn builtin() -> Self {
        let default_ts = &[EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN];
        let profile = ContextProfile {
            contexts: vec![
                ContextDef::new(VERIFICATION_SOP_CLASS, default_ts),
                ContextDef::new(MODALITY_PERFORMED_PROCEDURE_STEP_SOP_CLASS, default_ts),
                ContextDef::new(STORAGE_COMMITMENT_PUSH_MODEL_SOP_CLASS, default_ts),
            ],
        };
        let mut profiles = HashMap::new();
        profiles.insert("DEFAULT".to_string(), profile);
        Self { profiles }
    }

    /// Parses profiles from a TOML document and merges them over the
    /// built-in set.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ProfileFile = toml::from_str(text)
            .map_err(|e| DimseError::config(format!("invalid profile document: {e}")))?;
        let mut registry = Self::builtin();
        for (name, profile) in file.profiles {
            registry.insert(&name, profile)?;
        }
        Ok(registry)
    }

    /// Loads profiles from a TOML file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DimseError::config(format!(
                "cannot read profile file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn insert(&mut self, name: &str, profile: ContextProfile) -> Result<()> {
        let name = normalize_name(name);
        if name.is_empty() {
            return Err(DimseError::config("profile name must not be empty"));
        }
        for ctx in &profile.contexts {
            if ctx.abstract_syntax.is_empty() {
                return Err(DimseError::config(format!(
                    "profile {name}: empty abstract syntax"
                )));
            }
            if ctx.transfer_syntaxes.is_empty() {
                return Err(DimseError::config(format!(
                    "profile {name}: no transfer syntaxes for {}",
                    ctx.abstract_syntax
                )));
            }
        }
        self.profiles.insert(name, profile);
        Ok(())
    }

    /// Resolves a profile by name. Names are case-insensitive and
    /// ignore whitespace.
    pub fn get(&self, name: &str) -> Option<&ContextProfile> {
        self.profiles.get(&normalize_name(name))
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<String>()
        .to_ascii_uppercase()
}

/// A broad transfer syntax preference for proposing contexts when the
/// caller has no stronger opinion.
pub const PROPOSED_TRANSFER_SYNTAXES: &[&str] = &[
    EXPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
    IMPLICIT_VR_LITTLE_ENDIAN,
];
