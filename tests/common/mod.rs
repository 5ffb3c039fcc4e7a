#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    env,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

use rules_engine::{PolicyError, PolicyLoader, Rule, RuleSet};
use warden::{
    module::{
        Config,
        rate_limiter::{LimitPolicy, RateLimit},
    },
    probe::{EventHandler, Probe, ProbeError, Report},
};
use warden_core::{Event, EventType, Header, Payload, StatsError, StatsSink};

/// Probe driven by the test: events are injected with [`FakeProbe::emit`].
#[derive(Default)]
pub struct FakeProbe {
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    pub fail_init: AtomicBool,
    pub closed: AtomicBool,
    pub discarders: AtomicUsize,
    pub applied: AtomicUsize,
}

impl FakeProbe {
    /// Deliver `event` to the handler, returns false if there is none.
    pub fn emit(&self, event: &Event) -> bool {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => {
                handler.handle_event(event);
                true
            }
            None => false,
        }
    }
}

impl Probe for FakeProbe {
    fn init(&self) -> Result<(), ProbeError> {
        if self.fail_init.load(Ordering::SeqCst) {
            Err(ProbeError::NotInitialized)
        } else {
            Ok(())
        }
    }

    fn start(&self) -> Result<(), ProbeError> {
        Ok(())
    }

    fn snapshot(&self) -> Result<(), ProbeError> {
        Ok(())
    }

    fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn supported_discarders(&self) -> Vec<String> {
        vec!["payload.filename".to_string()]
    }

    fn apply_rule_set(&self, rule_set: &RuleSet) -> Result<Report, ProbeError> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(Report {
            rules: rule_set.len(),
            ..Default::default()
        })
    }

    fn on_new_discarder(
        &self,
        _rule_set: &RuleSet,
        _event: &Event,
        _field: &str,
        _event_type: EventType,
    ) -> Result<(), ProbeError> {
        self.discarders.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_stats(&self, sink: &dyn StatsSink) -> Result<(), StatsError> {
        sink.gauge(
            "probe.discarders",
            self.discarders.load(Ordering::SeqCst) as f64,
            &[],
        )
    }

    fn get_stats(&self) -> Result<BTreeMap<String, u64>, ProbeError> {
        Ok(BTreeMap::from([(
            "discarders".to_string(),
            self.discarders.load(Ordering::SeqCst) as u64,
        )]))
    }

    fn close(&self) -> Result<(), ProbeError> {
        self.closed.store(true, Ordering::SeqCst);
        *self.handler.lock().unwrap() = None;
        Ok(())
    }
}

/// Policy whose rules can be swapped or broken between reloads.
#[derive(Default)]
pub struct TestLoader {
    rules: Mutex<Vec<Rule>>,
    pub fail: AtomicBool,
    /// Pause before adding each rule.
    pub delay: Mutex<Duration>,
}

impl TestLoader {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: Mutex::new(rules),
            ..Default::default()
        }
    }

    pub fn set_rules(&self, rules: Vec<Rule>) {
        *self.rules.lock().unwrap() = rules;
    }
}

impl PolicyLoader for TestLoader {
    fn load_policies(&self, rule_set: &mut RuleSet) -> Result<(), PolicyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PolicyError::MissingDirectory(PathBuf::from(
                "/nonexistent/policies",
            )));
        }

        let delay = *self.delay.lock().unwrap();
        let rules = self.rules.lock().unwrap().clone();
        for rule in rules {
            thread::sleep(delay);
            rule_set
                .add_rule(rule)
                .map_err(|error| PolicyError::Rule {
                    filename: "test.yaml".to_string(),
                    error,
                })?;
        }
        Ok(())
    }
}

pub fn exec_from_tmp() -> Rule {
    Rule::new(
        "exec_from_tmp",
        EventType::Exec,
        r#"payload.filename STARTS_WITH "/tmp""#,
    )
}

pub fn exec_ls() -> Rule {
    Rule::new(
        "exec_ls",
        EventType::Exec,
        r#"payload.filename == "/usr/bin/ls""#,
    )
}

pub fn exec(filename: &str) -> Event {
    Event::new(
        Header {
            pid: 4242,
            ppid: 1,
            image: filename.to_string(),
            timestamp: SystemTime::now(),
        },
        Payload::Exec {
            filename: filename.to_string(),
            argv: vec![filename.to_string()],
        },
    )
}

pub fn socket_path() -> PathBuf {
    env::temp_dir().join(format!("warden-{}.sock", uuid::Uuid::new_v4()))
}

/// Configuration with a private socket and a limiter that never runs dry.
pub fn config() -> Config {
    Config {
        socket_path: socket_path(),
        rate_limit: RateLimit {
            policy: LimitPolicy::FixedWindow,
            burst: 1_000_000,
            period: Duration::from_secs(3600),
        },
        subscriber_queue_size: 100_000,
        ..Default::default()
    }
}
