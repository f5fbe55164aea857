//! matacc - Financial statement hierarchies from XBRL structural metadata
//!
//! Builds navigable trees from presentation/calculation linkbases (or
//! pre-extracted hierarchy records), assigns every node a position
//! identifier such as `BS-002-001-c4`, and reconciles duplicate facts.
//!
//! Licensed under AGPL-3.0

pub mod builder;
pub mod duplicates;
pub mod facts;
pub mod hierarchy;
pub mod linkbase;
pub mod mapped_builder;
pub mod merge;
pub mod model;
pub mod position;
pub mod xbrl_builder;

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use builder::HierarchyBuilder;
pub use duplicates::{DuplicateCause, DuplicateHandler, DuplicateInfo, DuplicateType, ReconcilerConfig, Strategy};
pub use facts::FactIndex;
pub use hierarchy::{Hierarchy, NodeId, TypingRules};
pub use linkbase::{Arc, LabelSet, LinkbaseFiles, LinkbaseParser, Locator, StatementRole};
pub use mapped_builder::MappedHierarchyBuilder;
pub use merge::{attach_facts, MergeReport};
pub use model::{FactInstance, Node, NodeMetadata, NodeType, PeriodKind, Position, StatementKind};
pub use position::{ParsedPositionId, SharedRegistry, StatementTypeRegistry};
pub use xbrl_builder::XbrlHierarchyBuilder;

/// Default indentation for the text projection.
pub const DEFAULT_INDENT_SIZE: usize = 2;

/// Run-level settings shared by the builders, the text output and the
/// duplicate reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub typing: TypingRules,
    pub reconcile: ReconcilerConfig,
    pub indent_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            typing: TypingRules::default(),
            reconcile: ReconcilerConfig::default(),
            indent_size: DEFAULT_INDENT_SIZE,
        }
    }
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    fn check(&self) -> Result<()> {
        if self.typing.abstract_suffix.is_empty() {
            return Err(Error::Config("abstract_suffix must not be empty".to_string()));
        }
        self.reconcile.check()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Cycle rejected: {child} is already an ancestor of {parent}")]
    Cycle { parent: String, child: String },

    #[error("Cannot attach {0} as its own child")]
    SelfAttachment(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config = Config::from_json_str(r#"{"indent_size": 4}"#).unwrap();
        assert_eq!(config.indent_size, 4);
        assert_eq!(config.typing.abstract_suffix, "Abstract");
        assert_eq!(config.reconcile.strategy, Strategy::Both);
    }

    #[test]
    fn test_config_rejects_empty_suffix() {
        let err = Config::from_json_str(r#"{"typing": {"abstract_suffix": ""}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_rejects_unknown_strategy() {
        assert!(Config::from_json_str(r#"{"reconcile": {"strategy": "fuzzy"}}"#).is_err());
    }
}
