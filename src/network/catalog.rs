//! Message-name/schema binding.
//!
//! A [`MessageCatalog`] is loaded once at startup from a directory holding
//! one schema file per message name (`<dir>/<MessageName>.xsd`). After the
//! load it is read-only and shared between link tasks by `Arc`; it is the
//! only resource touched from more than one task.
//!
//! The schema-validation engine itself is an external collaborator; the
//! kernel only asks "is this name known, and is the frame a well-formed
//! envelope for it". The server protocol role consults the validator before
//! acting on inbound frames; the client role never does.

use crate::error::{MasterError, MasterResult};
use crate::network::protocol::Envelope;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Validation seam used by the protocol link.
pub trait MessageValidator: Send + Sync {
    /// Whether `frame` is acceptable as a message named `name`.
    fn validate(&self, name: &str, frame: &str) -> bool;
}

/// Pass-through validator for roles and deployments without schemas.
pub struct NoValidation;

impl MessageValidator for NoValidation {
    fn validate(&self, _name: &str, _frame: &str) -> bool {
        true
    }
}

/// Per-message schema registry, keyed by message name.
pub struct MessageCatalog {
    schemas: HashMap<String, PathBuf>,
}

impl MessageCatalog {
    /// Load every `*.xsd` file in `dir`; the file stem is the message name.
    pub fn load(dir: &Path) -> MasterResult<Self> {
        let mut schemas = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("xsd") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            schemas.insert(stem.to_string(), path.clone());
        }
        if schemas.is_empty() {
            return Err(MasterError::Configuration(format!(
                "no message schemas found in {}",
                dir.display()
            )));
        }
        debug!(count = schemas.len(), dir = %dir.display(), "message catalog loaded");
        Ok(Self { schemas })
    }

    /// Whether a schema is registered for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Number of registered message names.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl MessageValidator for MessageCatalog {
    fn validate(&self, name: &str, frame: &str) -> bool {
        if !self.schemas.contains_key(name) {
            warn!(name, "no schema registered for inbound message");
            return false;
        }
        match Envelope::from_xml(frame) {
            Ok(envelope) => envelope.name == name,
            Err(e) => {
                warn!(name, error = %e, "inbound frame failed validation");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Ref;

    fn catalog_with(names: &[&str]) -> (tempfile::TempDir, MessageCatalog) {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(
                dir.path().join(format!("{name}.xsd")),
                "<xs:schema xmlns:xs=\"http://www.w3.org/2001/XMLSchema\"/>",
            )
            .unwrap();
        }
        let catalog = MessageCatalog::load(dir.path()).unwrap();
        (dir, catalog)
    }

    #[test]
    fn loads_one_schema_per_message_name() {
        let (_dir, catalog) = catalog_with(&["CmdStartStaining", "HeartBeatServer"]);
        assert_eq!(catalog.len(), 2);
        assert!(catalog.contains("CmdStartStaining"));
        assert!(!catalog.contains("CmdDrainWater"));
    }

    #[test]
    fn empty_schema_dir_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MessageCatalog::load(dir.path()).is_err());
    }

    #[test]
    fn validates_known_well_formed_frames() {
        let (_dir, catalog) = catalog_with(&["CmdStartStaining"]);
        let frame = Envelope::new("CmdStartStaining", Ref::new(1))
            .to_xml()
            .unwrap();
        assert!(catalog.validate("CmdStartStaining", &frame));
    }

    #[test]
    fn rejects_unknown_names_and_mismatched_frames() {
        let (_dir, catalog) = catalog_with(&["CmdStartStaining"]);
        let frame = Envelope::new("CmdStartStaining", Ref::new(1))
            .to_xml()
            .unwrap();
        assert!(!catalog.validate("CmdDrainWater", &frame));
        assert!(!catalog.validate("CmdStartStaining", "<message>"));

        let other = Envelope::new("CmdDrainWater", Ref::new(2)).to_xml().unwrap();
        // Frame is well-formed but is not the message it claims to be.
        assert!(!catalog.validate("CmdStartStaining", &other));
    }
}
