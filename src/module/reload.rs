use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use engine_api::server::EventServer;
use rules_engine::{PolicyLoader, Rule, RuleSet, RuleSetListener, RuleSetOpts};
use warden_core::{Event, EventType};

use super::{ModuleError, rate_limiter::RateLimiter};
use crate::probe::{Probe, Report};

/// The rule set in force, swapped as a whole on reload.
#[derive(Debug, Default)]
pub(crate) struct ActiveRuleSet(RwLock<Option<Arc<RuleSet>>>);

impl ActiveRuleSet {
    pub(crate) fn get(&self) -> Option<Arc<RuleSet>> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace(&self, rule_set: Arc<RuleSet>) -> Option<Arc<RuleSet>> {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(rule_set)
    }
}

/// Builds rule sets from policy and installs them.
pub(crate) struct ReloadController {
    probe: Arc<dyn Probe>,
    loader: Arc<dyn PolicyLoader>,
    rate_limiter: Arc<RateLimiter>,
    event_server: EventServer,
    dispatcher: Arc<MatchDispatcher>,
    /// Serializes concurrent reloads.
    reload_lock: Mutex<()>,
}

impl ReloadController {
    pub(crate) fn new(
        probe: Arc<dyn Probe>,
        loader: Arc<dyn PolicyLoader>,
        rate_limiter: Arc<RateLimiter>,
        event_server: EventServer,
    ) -> Self {
        let dispatcher = Arc::new(MatchDispatcher {
            rate_limiter: rate_limiter.clone(),
            event_server: event_server.clone(),
            probe: Arc::downgrade(&probe),
        });

        Self {
            probe,
            loader,
            rate_limiter,
            event_server,
            dispatcher,
            reload_lock: Mutex::new(()),
        }
    }

    /// Build a rule set from the current policy and make it the active one.
    ///
    /// On error the active rule set is left untouched.
    pub(crate) fn reload(&self, active: &ActiveRuleSet) -> Result<Report, ModuleError> {
        let _guard = self
            .reload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut rule_set = RuleSet::new(RuleSetOpts::new(self.probe.supported_discarders()));
        self.loader.load_policies(&mut rule_set)?;
        rule_set.add_listener(self.dispatcher.clone());
        let rule_set = Arc::new(rule_set);

        let report = self
            .probe
            .apply_rule_set(&rule_set)
            .map_err(ModuleError::Probe)?;

        // Downstream components must know every rule before a match on it
        // can be dispatched.
        let rule_ids = rule_set.list_rule_ids();
        self.rate_limiter.apply(&rule_ids);
        self.event_server.apply(&rule_ids);

        let previous = active.replace(rule_set);

        log::info!(
            "rule set loaded: {} rules (previous: {})",
            report.rules,
            previous.map_or(0, |rs| rs.len())
        );
        match serde_json::to_string_pretty(&report) {
            Ok(json) => log::debug!("policy report: {json}"),
            Err(err) => log::debug!("cannot serialize policy report: {err}"),
        }

        Ok(report)
    }
}

/// Listener of every rule set: forwards matches and discarders.
struct MatchDispatcher {
    rate_limiter: Arc<RateLimiter>,
    event_server: EventServer,
    probe: Weak<dyn Probe>,
}

impl RuleSetListener for MatchDispatcher {
    fn rule_match(&self, rule: &Rule, event: &Event) {
        if !self.rate_limiter.allow(&rule.id) {
            log::trace!("match of rule {} dropped by rate limiter", rule.id);
            return;
        }

        if let Err(err) = self.event_server.send_event(rule, event) {
            log::debug!("cannot forward match of rule {}: {err}", rule.id);
        }
    }

    fn event_discarder_found(
        &self,
        rule_set: &RuleSet,
        event: &Event,
        field: &str,
        event_type: EventType,
    ) {
        let Some(probe) = self.probe.upgrade() else {
            return;
        };

        if let Err(err) = probe.on_new_discarder(rule_set, event, field, event_type) {
            log::trace!("cannot install discarder {event_type}/{field}: {err}");
        }
    }
}
