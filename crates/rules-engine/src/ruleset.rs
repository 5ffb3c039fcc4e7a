use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use warden_core::{Event, EventType, event};

use crate::rule::{self, CompileError, Compiled, EvalError, Rule};

/// Receiver of rule set evaluation outcomes.
pub trait RuleSetListener: Send + Sync {
    /// Called for every rule satisfied by `event`.
    fn rule_match(&self, rule: &Rule, event: &Event);

    /// Called when `field` of `event` has a value no rule of `event_type`
    /// can ever match.
    fn event_discarder_found(
        &self,
        rule_set: &RuleSet,
        event: &Event,
        field: &str,
        event_type: EventType,
    );
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule '{id}' is defined more than once")]
    Duplicate { id: String },
    #[error("compiling rule '{id}'")]
    Compile {
        id: String,
        #[source]
        error: CompileError,
    },
}

/// Construction options of a [`RuleSet`].
#[derive(Debug, Clone)]
pub struct RuleSetOpts {
    /// Named integers usable in expressions.
    pub constants: HashMap<String, i64>,
    /// Field paths the probe is able to filter on.
    pub supported_discarders: BTreeSet<String>,
}

impl RuleSetOpts {
    pub fn new(supported_discarders: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            constants: event::constants(),
            supported_discarders: supported_discarders.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for RuleSetOpts {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

struct CompiledRule {
    rule: Rule,
    condition: Compiled,
}

/// Compiled collection of rules, grouped by event type.
///
/// A rule set is filled once, then shared read-only behind an `Arc`.
pub struct RuleSet {
    generation: u64,
    opts: RuleSetOpts,
    ids: Vec<String>,
    rules: BTreeMap<EventType, Vec<CompiledRule>>,
    listeners: Vec<Arc<dyn RuleSetListener>>,
}

impl RuleSet {
    pub fn new(opts: RuleSetOpts) -> Self {
        static GENERATION: AtomicU64 = AtomicU64::new(0);

        Self {
            generation: GENERATION.fetch_add(1, Ordering::Relaxed),
            opts,
            ids: Vec::new(),
            rules: BTreeMap::new(),
            listeners: Vec::new(),
        }
    }

    /// Process wide unique identifier of this rule set.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Compile `rule` and add it to the set.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), RuleError> {
        if self.ids.contains(&rule.id) {
            return Err(RuleError::Duplicate { id: rule.id });
        }

        let condition = rule::compile(rule.event_type, &rule.expression, &self.opts.constants)
            .map_err(|error| RuleError::Compile {
                id: rule.id.clone(),
                error,
            })?;

        log::trace!("compiled rule {}: {condition:?}", rule.id);

        self.ids.push(rule.id.clone());
        self.rules
            .entry(rule.event_type)
            .or_default()
            .push(CompiledRule { rule, condition });
        Ok(())
    }

    pub fn add_listener(&mut self, listener: Arc<dyn RuleSetListener>) {
        self.listeners.push(listener);
    }

    /// Identifiers of all rules, in insertion order.
    pub fn list_rule_ids(&self) -> Vec<String> {
        self.ids.clone()
    }

    pub fn get_rule(&self, id: &str) -> Option<&Rule> {
        self.rules
            .values()
            .flatten()
            .map(|compiled| &compiled.rule)
            .find(|rule| rule.id == id)
    }

    /// All rules, grouped by event type.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values().flatten().map(|compiled| &compiled.rule)
    }

    /// Event types with at least one rule.
    pub fn event_types(&self) -> impl Iterator<Item = EventType> + '_ {
        self.rules.keys().copied()
    }

    /// Number of rules defined for `event_type`.
    pub fn rule_count(&self, event_type: EventType) -> usize {
        self.rules.get(&event_type).map_or(0, Vec::len)
    }

    pub fn supported_discarders(&self) -> &BTreeSet<String> {
        &self.opts.supported_discarders
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Evaluate every rule of the event type against `event`.
    ///
    /// Listeners are notified of each match. When nothing matched, the
    /// supported discarder fields are checked and reported. An error on one
    /// rule doesn't prevent the others from running: the first error is
    /// returned once all of them were evaluated.
    pub fn evaluate(&self, event: &Event) -> Result<bool, EvalError> {
        let event_type = event.event_type();
        let Some(rules) = self.rules.get(&event_type) else {
            return Ok(false);
        };

        let mut matched = false;
        let mut first_error = None;

        for compiled in rules {
            match compiled.condition.eval(event) {
                Ok(true) => {
                    matched = true;
                    for listener in &self.listeners {
                        listener.rule_match(&compiled.rule, event);
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        if !matched {
            self.notify_discarders(event, event_type, rules);
        }

        Ok(matched)
    }

    fn notify_discarders(&self, event: &Event, event_type: EventType, rules: &[CompiledRule]) {
        for field in &self.opts.supported_discarders {
            if !event_type.has_field(field) {
                continue;
            }
            let Some(value) = event.field(field) else {
                continue;
            };

            let discardable = rules.iter().all(|compiled| {
                compiled
                    .condition
                    .conjuncts()
                    .iter()
                    .any(|term| term.rejects(field, &value))
            });

            if discardable {
                for listener in &self.listeners {
                    listener.event_discarder_found(self, event, field, event_type);
                }
            }
        }
    }
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("generation", &self.generation)
            .field("rules", &self.ids)
            .field("supported_discarders", &self.opts.supported_discarders)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex,
        time::UNIX_EPOCH,
    };

    use warden_core::{Header, Payload};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        matches: Mutex<Vec<String>>,
        discarders: Mutex<Vec<(String, EventType)>>,
    }

    impl RuleSetListener for Recorder {
        fn rule_match(&self, rule: &Rule, _event: &Event) {
            self.matches.lock().unwrap().push(rule.id.clone());
        }

        fn event_discarder_found(
            &self,
            _rule_set: &RuleSet,
            _event: &Event,
            field: &str,
            event_type: EventType,
        ) {
            self.discarders
                .lock()
                .unwrap()
                .push((field.to_string(), event_type));
        }
    }

    fn exec(filename: &str) -> Event {
        Event::new(
            Header {
                pid: 4242,
                ppid: 1,
                image: filename.to_string(),
                timestamp: UNIX_EPOCH,
            },
            Payload::Exec {
                filename: filename.to_string(),
                argv: vec![filename.to_string()],
            },
        )
    }

    fn rule_set(rules: &[(&str, EventType, &str)]) -> (RuleSet, Arc<Recorder>) {
        let mut rule_set = RuleSet::new(RuleSetOpts::new(["payload.filename", "header.image"]));
        for (id, event_type, expression) in rules {
            rule_set
                .add_rule(Rule::new(*id, *event_type, *expression))
                .unwrap();
        }
        let recorder = Arc::new(Recorder::default());
        rule_set.add_listener(recorder.clone());
        (rule_set, recorder)
    }

    #[test]
    fn matching_rules_notify_listeners() {
        let (rule_set, recorder) = rule_set(&[
            ("exec_from_tmp", EventType::Exec, r#"payload.filename STARTS_WITH "/tmp""#),
            ("exec_sh", EventType::Exec, r#"payload.filename ENDS_WITH "sh""#),
            ("open_tmp", EventType::FileOpened, r#"payload.filename STARTS_WITH "/tmp""#),
        ]);

        assert!(rule_set.evaluate(&exec("/tmp/x.sh")).unwrap());
        assert_eq!(
            *recorder.matches.lock().unwrap(),
            vec!["exec_from_tmp", "exec_sh"]
        );
        assert!(recorder.discarders.lock().unwrap().is_empty());
    }

    #[test]
    fn ids_and_lookup() {
        let (rule_set, _) = rule_set(&[
            ("b", EventType::FileOpened, "payload.flags == O_CREAT"),
            ("a", EventType::Exec, "header.pid == 1"),
        ]);
        assert_eq!(rule_set.list_rule_ids(), vec!["b", "a"]);
        assert_eq!(rule_set.len(), 2);
        assert_eq!(rule_set.get_rule("a").unwrap().event_type, EventType::Exec);
        assert!(rule_set.get_rule("c").is_none());
        assert_eq!(
            rule_set.event_types().collect::<Vec<_>>(),
            vec![EventType::Exec, EventType::FileOpened]
        );
        assert_eq!(rule_set.rule_count(EventType::Exec), 1);
        assert_eq!(rule_set.rule_count(EventType::Exit), 0);
    }

    #[test]
    fn generations_are_unique() {
        let a = RuleSet::new(RuleSetOpts::default());
        let b = RuleSet::new(RuleSetOpts::default());
        assert_ne!(a.generation(), b.generation());
    }

    #[test]
    fn duplicate_and_invalid_rules() {
        let (mut rule_set, _) = rule_set(&[("a", EventType::Exec, "header.pid == 1")]);
        assert_eq!(
            rule_set.add_rule(Rule::new("a", EventType::Exec, "header.pid == 2")),
            Err(RuleError::Duplicate { id: "a".to_string() })
        );
        assert!(matches!(
            rule_set.add_rule(Rule::new("b", EventType::Exec, "payload.port == 2")),
            Err(RuleError::Compile { id, .. }) if id == "b"
        ));
        assert_eq!(rule_set.list_rule_ids(), vec!["a"]);
    }

    #[test]
    fn discarder_when_every_rule_rejects_field() {
        let (rule_set, recorder) = rule_set(&[
            ("tmp", EventType::Exec, r#"payload.filename STARTS_WITH "/tmp" AND header.pid > 1"#),
            ("shm", EventType::Exec, r#"payload.filename STARTS_WITH "/dev/shm""#),
        ]);

        assert!(!rule_set.evaluate(&exec("/usr/bin/ls")).unwrap());
        assert_eq!(
            *recorder.discarders.lock().unwrap(),
            vec![("payload.filename".to_string(), EventType::Exec)]
        );
    }

    #[test]
    fn no_discarder_when_a_rule_does_not_constrain_field() {
        let (rule_set, recorder) = rule_set(&[
            ("tmp", EventType::Exec, r#"payload.filename STARTS_WITH "/tmp""#),
            ("init", EventType::Exec, "header.ppid == 0"),
        ]);

        assert!(!rule_set.evaluate(&exec("/usr/bin/ls")).unwrap());
        assert!(recorder.discarders.lock().unwrap().is_empty());
    }

    #[test]
    fn no_discarder_through_or() {
        let (rule_set, recorder) = rule_set(&[(
            "tmp",
            EventType::Exec,
            r#"payload.filename STARTS_WITH "/tmp" OR header.pid == 1"#,
        )]);

        assert!(!rule_set.evaluate(&exec("/usr/bin/ls")).unwrap());
        assert!(recorder.discarders.lock().unwrap().is_empty());
    }

    #[test]
    fn event_type_without_rules() {
        let (rule_set, recorder) = rule_set(&[(
            "open",
            EventType::FileOpened,
            r#"payload.filename == "/etc/shadow""#,
        )]);

        assert!(!rule_set.evaluate(&exec("/tmp/x")).unwrap());
        assert!(recorder.matches.lock().unwrap().is_empty());
        assert!(recorder.discarders.lock().unwrap().is_empty());
    }
}
