use rules_engine::Rule;
use serde::{Deserialize, Serialize};
use warden_core::Event;

/// One rule match, as streamed to subscribers.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchMessage {
    pub rule_id: String,
    pub rule_definition: String,
    pub event: Event,
}

impl MatchMessage {
    pub fn new(rule: &Rule, event: &Event) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_definition: rule.definition(),
            event: event.clone(),
        }
    }
}

/// Delivery counters of one rule.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub sent: u64,
    pub dropped: u64,
}
