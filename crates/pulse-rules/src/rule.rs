//! The rule document model.
//!
//! Wire shape:
//!
//! ```json
//! {
//!   "version": 1,
//!   "rules": [
//!     {
//!       "condition": { "type": "group", "definition": { "logic": "and", "conditions": [ ... ] } },
//!       "consequences": [
//!         { "id": "c1", "type": "add", "detail": { "eventdata": { ... } } }
//!       ]
//!     }
//!   ]
//! }
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::condition::Condition;
use crate::error::RulesError;

/// A parsed rule document.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDocument {
    /// Document format version.
    #[serde(default)]
    pub version: u32,
    /// The rules, in evaluation order.
    pub rules: Vec<Rule>,
}

impl RuleDocument {
    /// Parses a JSON rule document. A malformed document is rejected as a
    /// whole.
    ///
    /// # Errors
    ///
    /// Returns `RulesError::Parse` on any JSON or shape error.
    pub fn parse(bytes: &[u8]) -> Result<Self, RulesError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One rule: a condition tree plus its ordered consequences.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    /// The condition evaluated against each event.
    pub condition: Condition,
    /// Applied in order when the condition holds.
    pub consequences: Vec<Consequence>,
}

/// One consequence spec.
///
/// `add` and `mod` rewrite the triggering event's data; any other type
/// synthesizes a consequence event.
#[derive(Debug, Clone, Deserialize)]
pub struct Consequence {
    /// Unique id within the document.
    pub id: String,
    /// The consequence type string (`add`, `mod`, `pb`, ...).
    #[serde(rename = "type")]
    pub consequence_type: String,
    /// Type-specific payload; `add`/`mod` carry `eventdata`.
    #[serde(default)]
    pub detail: Value,
}
