//! The rules engine: declarative rule evaluation over the event stream.
//!
//! Rule documents pair a condition tree with an ordered list of
//! consequences. The engine registers as a hub pre-processor, so every
//! event is evaluated before listeners see it: `add` and `mod` consequences
//! rewrite the event's data in flight, anything else emits a consequence
//! event back through the hub.
//!
//! Conditions reference the event and the shared-state universe through
//! token paths (`~type`, `~state.com.pulse.lifecycle/...`, plain dotted
//! data paths); the same paths drive `{% ... %}` template substitution in
//! consequence details.
//!
//! Until the first rule set loads, events are buffered in a waiting list
//! and evaluated once against that first set, so nothing dispatched during
//! startup is lost to the remote-rules download race.

mod condition;
mod download;
mod engine;
mod error;
mod rule;
mod template;
mod token;

pub use condition::{Condition, GroupDefinition, Logic, MatcherDefinition};
pub use download::{ArchiveExtractor, PassthroughExtractor, RulesDownloader, CACHE_COLLECTION};
pub use engine::RulesEngine;
pub use error::RulesError;
pub use rule::{Consequence, Rule, RuleDocument};
pub use token::TokenFinder;
