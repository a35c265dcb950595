//! The rules engine proper.

use std::sync::{Mutex, RwLock};

use serde_json::json;

use pulse_hub::{EventPreprocessor, HubHandle};
use pulse_types::{data, Event, EventSource, EventType};

use crate::error::RulesError;
use crate::rule::{Consequence, Rule, RuleDocument};
use crate::template;
use crate::token::TokenFinder;

/// Name given to synthesized consequence events.
const CONSEQUENCE_EVENT_NAME: &str = "Rules Consequence Event";

/// Evaluates the active rule set against every event before delivery.
///
/// Register the engine with the hub as a pre-processor:
///
/// ```rust,ignore
/// let engine = Arc::new(RulesEngine::new("rulesengine", hub.handle()));
/// hub.register_preprocessor(engine.clone());
/// ```
///
/// The engine starts with an empty rule set and an active waiting buffer:
/// every event seen before the first [`replace_rules`](Self::replace_rules)
/// is buffered and evaluated exactly once against the first loaded set, in
/// original dispatch order.
pub struct RulesEngine {
    name: String,
    hub: HubHandle,
    // The write lock makes rule swaps and evaluation mutually exclusive.
    rules: RwLock<Vec<Rule>>,
    waiting: Mutex<Option<Vec<Event>>>,
}

impl RulesEngine {
    /// Creates an engine addressed by `name` (the reset event's name must
    /// match it, so two engines on one hub stay independent).
    pub fn new(name: impl Into<String>, hub: HubHandle) -> Self {
        Self {
            name: name.into(),
            hub,
            rules: RwLock::new(Vec::new()),
            waiting: Mutex::new(Some(Vec::new())),
        }
    }

    /// Atomically swaps the active rule set and dispatches the
    /// self-addressed reset event that drains the waiting buffer.
    pub fn replace_rules(&self, rules: Vec<Rule>) {
        let count = rules.len();
        *self.rules.write().expect("rules lock poisoned") = rules;
        tracing::info!(rules = count, engine = %self.name, "replaced rule set");

        let reset = Event::new(
            self.name.clone(),
            EventType::RulesEngine,
            EventSource::RequestReset,
        );
        if let Err(e) = self.hub.dispatch(reset) {
            tracing::error!(error = %e, "failed to dispatch rules reset event");
        }
    }

    /// Parses `bytes` as a rule document and installs its rules.
    ///
    /// # Errors
    ///
    /// Returns `RulesError::Parse` without touching the active set.
    pub fn load_rules(&self, bytes: &[u8]) -> Result<(), RulesError> {
        let document = RuleDocument::parse(bytes)?;
        self.replace_rules(document.rules);
        Ok(())
    }

    /// Downloads (with conditional-GET caching) and installs rules.
    ///
    /// # Errors
    ///
    /// `Unavailable` when neither network nor cache can produce a document,
    /// `Parse` when the downloaded document is malformed.
    pub async fn load_remote_rules(
        &self,
        downloader: &crate::download::RulesDownloader,
        url: &str,
    ) -> Result<(), RulesError> {
        let bytes = downloader
            .load_from_url(url)
            .await
            .ok_or_else(|| RulesError::Unavailable(url.to_string()))?;
        self.load_rules(&bytes)
    }

    /// Installs rules from the download cache only.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the cache has no entry for `url`.
    pub fn load_cached_rules(
        &self,
        downloader: &crate::download::RulesDownloader,
        url: &str,
    ) -> Result<(), RulesError> {
        let bytes = downloader
            .load_cached(url)
            .ok_or_else(|| RulesError::Unavailable(url.to_string()))?;
        self.load_rules(&bytes)
    }

    /// Whether this event is our own reset instruction.
    fn is_reset_event(&self, event: &Event) -> bool {
        *event.event_type() == EventType::RulesEngine
            && *event.source() == EventSource::RequestReset
            && event.name() == self.name
    }

    /// Evaluates all rules against `event`, applying consequences in order.
    fn evaluate(&self, event: &mut Event) {
        let rules = self.rules.read().expect("rules lock poisoned");
        for rule in rules.iter() {
            let matched = {
                let finder = TokenFinder::new(event, &self.hub);
                rule.condition.evaluate(&finder)
            };
            if !matched {
                continue;
            }

            for consequence in &rule.consequences {
                self.apply_consequence(event, consequence);
            }
        }
    }

    /// Applies one consequence: `add`/`mod` rewrite the event's data, any
    /// other type dispatches a consequence event chained to the trigger.
    fn apply_consequence(&self, event: &mut Event, consequence: &Consequence) {
        let detail = {
            let finder = TokenFinder::new(event, &self.hub);
            template::render_value(&consequence.detail, &finder)
        };

        match consequence.consequence_type.as_str() {
            "add" | "mod" => {
                let Some(event_data) = detail.get("eventdata") else {
                    tracing::warn!(
                        consequence = %consequence.id,
                        "attach/modify consequence without eventdata"
                    );
                    return;
                };
                let overwrite = consequence.consequence_type == "mod";
                let mut merged = event.data().clone();
                data::merge(&mut merged, event_data, overwrite);
                event.replace_data(merged);
            }
            other => {
                let payload = json!({
                    "triggeredconsequence": {
                        "id": consequence.id,
                        "type": other,
                        "detail": detail,
                    }
                });
                let consequence_event = Event::new(
                    CONSEQUENCE_EVENT_NAME,
                    EventType::RulesEngine,
                    EventSource::ResponseContent,
                )
                .with_data(payload)
                .chained_to(event);

                if let Err(e) = self.hub.dispatch(consequence_event) {
                    tracing::error!(error = %e, consequence = %consequence.id, "failed to dispatch consequence");
                }
            }
        }
    }
}

impl EventPreprocessor for RulesEngine {
    fn process(&self, mut event: Event) -> Event {
        if self.is_reset_event(&event) {
            let drained = self
                .waiting
                .lock()
                .expect("waiting lock poisoned")
                .take();
            if let Some(events) = drained {
                tracing::debug!(count = events.len(), "draining waiting events through rules");
                for mut waiting_event in events {
                    self.evaluate(&mut waiting_event);
                }
            }
            return event;
        }

        // Until the first rule set arrives, events are buffered and
        // evaluated exactly once at the drain. Evaluating here too would
        // double-fire consequences for events in flight when the swap and
        // its reset race past each other.
        {
            let mut waiting = self.waiting.lock().expect("waiting lock poisoned");
            if let Some(waiting) = waiting.as_mut() {
                waiting.push(event.clone());
                return event;
            }
        }

        self.evaluate(&mut event);
        event
    }
}
