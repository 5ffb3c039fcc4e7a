//! Userspace probe polling procfs for new processes.
//!
//! Every `poll_interval` the probe lists the numeric entries of `proc_path`
//! and reports an [`Payload::Exec`] event for each process it has not seen
//! before.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, SystemTime},
};

use glob::glob;
use nix::unistd::Pid;
use rules_engine::RuleSet;
use strum::IntoEnumIterator;
use warden_core::{
    ConfigError, Event, EventType, Header, ModuleConfig, Payload, StatsError, StatsSink,
};

use super::{EventHandler, EventTypePolicy, PolicyMode, Probe, ProbeError, Report};

const SUPPORTED_DISCARDERS: &[&str] = &["header.image", "payload.filename"];

/// Discarders kept per rule set. Further ones are counted and ignored.
pub const MAX_DISCARDERS: usize = 4096;

#[derive(Debug, Clone)]
pub struct ProcfsConfig {
    pub proc_path: PathBuf,
    pub poll_interval: Duration,
}

impl Default for ProcfsConfig {
    fn default() -> Self {
        Self {
            proc_path: PathBuf::from("/proc"),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl TryFrom<&ModuleConfig> for ProcfsConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let default = Self::default();
        Ok(Self {
            proc_path: config.with_default("proc_path", default.proc_path)?,
            poll_interval: config.millis_with_default("poll_interval", default.poll_interval)?,
        })
    }
}

pub struct ProcfsProbe {
    config: ProcfsConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    stop: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    initialized: AtomicBool,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    known: Mutex<HashSet<Pid>>,
    filters: RwLock<Filters>,
    events_sent: AtomicU64,
    events_discarded: AtomicU64,
    events_filtered: AtomicU64,
    discarders_overflow: AtomicU64,
}

#[derive(Default)]
struct Filters {
    /// Generation of the last applied rule set.
    generation: Option<u64>,
    accepted: HashSet<EventType>,
    discarders: HashSet<Discarder>,
}

#[derive(Debug, Hash, PartialEq, Eq)]
struct Discarder {
    event_type: EventType,
    field: String,
    value: String,
}

impl Filters {
    fn is_discarded(&self, event: &Event) -> bool {
        if self.discarders.is_empty() {
            return false;
        }

        let event_type = event.event_type();
        SUPPORTED_DISCARDERS.iter().any(|field| {
            event.field(field).is_some_and(|value| {
                self.discarders.contains(&Discarder {
                    event_type,
                    field: field.to_string(),
                    value: value.to_string(),
                })
            })
        })
    }
}

impl ProcfsProbe {
    pub fn new(config: ProcfsConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
        }
    }

    fn ensure_initialized(&self) -> Result<(), ProbeError> {
        if self.shared.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ProbeError::NotInitialized)
        }
    }

    /// Look for new processes once.
    pub fn scan(&self) -> Result<(), ProbeError> {
        self.ensure_initialized()?;
        self.shared.scan(&self.config.proc_path)
    }

    fn stats(&self) -> BTreeMap<String, u64> {
        let discarders = self
            .shared
            .filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .discarders
            .len();
        let processes = self
            .shared
            .known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();

        BTreeMap::from([
            (
                "events_sent".to_string(),
                self.shared.events_sent.load(Ordering::Relaxed),
            ),
            (
                "events_discarded".to_string(),
                self.shared.events_discarded.load(Ordering::Relaxed),
            ),
            (
                "events_filtered".to_string(),
                self.shared.events_filtered.load(Ordering::Relaxed),
            ),
            ("discarders".to_string(), discarders as u64),
            (
                "discarders_overflow".to_string(),
                self.shared.discarders_overflow.load(Ordering::Relaxed),
            ),
            ("processes".to_string(), processes as u64),
        ])
    }
}

impl Shared {
    fn scan(&self, proc_path: &Path) -> Result<(), ProbeError> {
        let running = running_processes(proc_path)?;

        let new_processes: Vec<Pid> = {
            let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
            let new_processes = running
                .iter()
                .filter(|pid| !known.contains(pid))
                .copied()
                .collect();
            *known = running.into_iter().collect();
            new_processes
        };

        for pid in new_processes {
            match exec_event(proc_path, pid) {
                Some(event) => self.deliver(&event),
                None => log::trace!("process {pid} vanished before it could be read"),
            }
        }

        Ok(())
    }

    fn deliver(&self, event: &Event) {
        let Some(handler) = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };

        {
            let filters = self.filters.read().unwrap_or_else(PoisonError::into_inner);
            if !filters.accepted.contains(&event.event_type()) {
                self.events_filtered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if filters.is_discarded(event) {
                self.events_discarded.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        handler.handle_event(event);
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }
}

impl Probe for ProcfsProbe {
    fn init(&self) -> Result<(), ProbeError> {
        let proc_path = &self.config.proc_path;
        let metadata = fs::metadata(proc_path).map_err(|source| ProbeError::Io {
            path: proc_path.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(ProbeError::Io {
                path: proc_path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            });
        }

        self.shared.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn start(&self) -> Result<(), ProbeError> {
        self.ensure_initialized()?;

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Err(ProbeError::AlreadyStarted);
        }

        let (stop, rx_stop) = mpsc::channel();
        let shared = self.shared.clone();
        let proc_path = self.config.proc_path.clone();
        let poll_interval = self.config.poll_interval;

        let handle = thread::Builder::new()
            .name("warden-procfs".to_string())
            .spawn(move || {
                // Either a stop request or a dropped probe ends the loop.
                while let Err(mpsc::RecvTimeoutError::Timeout) = rx_stop.recv_timeout(poll_interval)
                {
                    if let Err(err) = shared.scan(&proc_path) {
                        log::warn!("procfs scan failed: {err}");
                    }
                }
                log::debug!("procfs probe stopped");
            })
            .map_err(ProbeError::Spawn)?;

        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    fn snapshot(&self) -> Result<(), ProbeError> {
        self.ensure_initialized()?;

        let running = running_processes(&self.config.proc_path)?;
        log::debug!("snapshot: {} running processes", running.len());

        *self
            .shared
            .known
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = running.into_iter().collect();
        Ok(())
    }

    fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn supported_discarders(&self) -> Vec<String> {
        SUPPORTED_DISCARDERS.iter().map(|f| f.to_string()).collect()
    }

    fn apply_rule_set(&self, rule_set: &RuleSet) -> Result<Report, ProbeError> {
        let accepted: HashSet<EventType> = rule_set.event_types().collect();

        let policies = EventType::iter()
            .map(|event_type| {
                let mode = if accepted.contains(&event_type) {
                    PolicyMode::Accept
                } else {
                    PolicyMode::Drop
                };
                (
                    event_type.to_string(),
                    EventTypePolicy {
                        mode,
                        rules: rule_set.rule_count(event_type),
                    },
                )
            })
            .collect();

        let mut filters = self
            .shared
            .filters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        filters.generation = Some(rule_set.generation());
        filters.accepted = accepted;
        filters.discarders.clear();

        Ok(Report {
            rules: rule_set.len(),
            policies,
            supported_discarders: self.supported_discarders(),
        })
    }

    fn on_new_discarder(
        &self,
        rule_set: &RuleSet,
        event: &Event,
        field: &str,
        event_type: EventType,
    ) -> Result<(), ProbeError> {
        if !SUPPORTED_DISCARDERS.contains(&field) {
            return Err(ProbeError::UnsupportedDiscarder {
                field: field.to_string(),
            });
        }

        let value = event
            .field(field)
            .ok_or_else(|| ProbeError::MissingField {
                field: field.to_string(),
                event_type,
            })?
            .to_string();

        let mut filters = self
            .shared
            .filters
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        // The rule set may have been replaced since the event was evaluated.
        if filters.generation != Some(rule_set.generation()) {
            log::trace!("ignoring discarder {field}={value} of a previous rule set");
            return Ok(());
        }

        let discarder = Discarder {
            event_type,
            field: field.to_string(),
            value,
        };
        if filters.discarders.len() >= MAX_DISCARDERS && !filters.discarders.contains(&discarder) {
            self.shared
                .discarders_overflow
                .fetch_add(1, Ordering::Relaxed);
            log::trace!("discarder table full, ignoring {discarder:?}");
            return Ok(());
        }
        log::trace!("new discarder {discarder:?}");
        filters.discarders.insert(discarder);

        Ok(())
    }

    fn send_stats(&self, sink: &dyn StatsSink) -> Result<(), StatsError> {
        for (name, value) in self.stats() {
            sink.gauge(&format!("probe.{name}"), value as f64, &[])?;
        }
        Ok(())
    }

    fn get_stats(&self) -> Result<BTreeMap<String, u64>, ProbeError> {
        Ok(self.stats())
    }

    fn close(&self) -> Result<(), ProbeError> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Worker { stop, handle }) = worker {
            let _ = stop.send(());
            if handle.join().is_err() {
                log::error!("procfs probe thread panicked");
            }
        }

        *self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        Ok(())
    }
}

/// Returns the pids listed in `proc_path`.
fn running_processes(proc_path: &Path) -> Result<Vec<Pid>, ProbeError> {
    let pattern = format!("{}/[0-9]*", proc_path.display());
    let entries = glob(&pattern).map_err(|err| ProbeError::Io {
        path: proc_path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, err),
    })?;

    Ok(entries
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse().ok())
                .map(Pid::from_raw)
        })
        .collect())
}

fn exec_event(proc_path: &Path, pid: Pid) -> Option<Event> {
    let dir = proc_path.join(pid.to_string());

    let argv = command_line(&dir).unwrap_or_default();
    let image = match fs::read_link(dir.join("exe")) {
        Ok(path) => path.display().to_string(),
        // Kernel threads have neither an executable nor a command line.
        Err(_) => argv.first()?.clone(),
    };
    let ppid = parent_pid(&dir).unwrap_or_default();

    Some(Event::new(
        Header {
            pid: pid.as_raw(),
            ppid,
            image: image.clone(),
            timestamp: SystemTime::now(),
        },
        Payload::Exec {
            filename: image,
            argv,
        },
    ))
}

/// Returns the command line of the process at `dir`.
fn command_line(dir: &Path) -> Result<Vec<String>, ProbeError> {
    let path = dir.join("cmdline");
    let data = fs::read(&path).map_err(|source| ProbeError::Io { path, source })?;

    Ok(data
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect())
}

/// Returns the parent pid of the process at `dir`.
fn parent_pid(dir: &Path) -> Option<i32> {
    let status = fs::read_to_string(dir.join("status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use std::{env, os::unix::fs::symlink};

    use rules_engine::{Rule, RuleSetOpts};

    use super::*;

    #[derive(Default)]
    struct Collector {
        events: Mutex<Vec<Event>>,
    }

    impl EventHandler for Collector {
        fn handle_event(&self, event: &Event) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl Collector {
        fn filenames(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|event| match event.payload() {
                    Payload::Exec { filename, .. } => filename.clone(),
                    other => panic!("unexpected payload {other:?}"),
                })
                .collect()
        }
    }

    struct FakeProc {
        root: PathBuf,
    }

    impl FakeProc {
        fn new() -> Self {
            let root = env::temp_dir().join(format!("warden-proc-{}", uuid::Uuid::new_v4()));
            fs::create_dir_all(&root).unwrap();
            Self { root }
        }

        fn spawn(&self, pid: i32, exe: &str, args: &[&str]) {
            let dir = self.root.join(pid.to_string());
            fs::create_dir_all(&dir).unwrap();
            symlink(exe, dir.join("exe")).unwrap();
            let mut cmdline = args.join("\0");
            cmdline.push('\0');
            fs::write(dir.join("cmdline"), cmdline).unwrap();
            fs::write(dir.join("status"), "Name:\tproc\nState:\tS\nPPid:\t1\n").unwrap();
        }

        fn exit(&self, pid: i32) {
            fs::remove_dir_all(self.root.join(pid.to_string())).unwrap();
        }

        fn probe(&self, poll_interval: Duration) -> ProcfsProbe {
            ProcfsProbe::new(ProcfsConfig {
                proc_path: self.root.clone(),
                poll_interval,
            })
        }
    }

    impl Drop for FakeProc {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    fn rule_set(probe: &ProcfsProbe, rules: &[(&str, EventType, &str)]) -> RuleSet {
        let mut rule_set = RuleSet::new(RuleSetOpts::new(probe.supported_discarders()));
        for (id, event_type, expression) in rules {
            rule_set
                .add_rule(Rule::new(*id, *event_type, *expression))
                .unwrap();
        }
        rule_set
    }

    fn exec_from_tmp(probe: &ProcfsProbe) -> RuleSet {
        rule_set(
            probe,
            &[(
                "exec_from_tmp",
                EventType::Exec,
                r#"payload.filename STARTS_WITH "/tmp""#,
            )],
        )
    }

    #[test]
    fn config_from_section() {
        let config = ProcfsConfig::try_from(&ModuleConfig::default()).unwrap();
        assert_eq!(config.proc_path, PathBuf::from("/proc"));
        assert_eq!(config.poll_interval, Duration::from_millis(250));

        let section: ModuleConfig = [("proc_path", "/host/proc"), ("poll_interval", "50")]
            .into_iter()
            .collect();
        let config = ProcfsConfig::try_from(&section).unwrap();
        assert_eq!(config.proc_path, PathBuf::from("/host/proc"));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn lifecycle_errors() {
        let probe = ProcfsProbe::new(ProcfsConfig {
            proc_path: PathBuf::from("/nonexistent/proc"),
            poll_interval: Duration::from_millis(10),
        });
        assert!(matches!(probe.start(), Err(ProbeError::NotInitialized)));
        assert!(matches!(probe.snapshot(), Err(ProbeError::NotInitialized)));
        assert!(matches!(probe.init(), Err(ProbeError::Io { .. })));
    }

    #[test]
    fn reports_processes_started_after_snapshot() {
        let proc = FakeProc::new();
        proc.spawn(1, "/usr/lib/systemd/systemd", &["/sbin/init"]);

        let probe = proc.probe(Duration::from_secs(60));
        probe.init().unwrap();
        probe.snapshot().unwrap();
        probe.apply_rule_set(&exec_from_tmp(&probe)).unwrap();

        let collector = Arc::new(Collector::default());
        probe.set_event_handler(collector.clone());

        proc.spawn(200, "/tmp/payload", &["/tmp/payload", "--fork"]);
        probe.scan().unwrap();
        probe.scan().unwrap();

        assert_eq!(collector.filenames(), vec!["/tmp/payload"]);
        let events = collector.events.lock().unwrap();
        assert_eq!(events[0].header().pid, 200);
        assert_eq!(events[0].header().ppid, 1);

        assert_eq!(probe.get_stats().unwrap()["events_sent"], 1);
        assert_eq!(probe.get_stats().unwrap()["processes"], 2);
    }

    #[test]
    fn pid_reuse_is_reported_again() {
        let proc = FakeProc::new();
        let probe = proc.probe(Duration::from_secs(60));
        probe.init().unwrap();
        probe.snapshot().unwrap();
        probe.apply_rule_set(&exec_from_tmp(&probe)).unwrap();
        let collector = Arc::new(Collector::default());
        probe.set_event_handler(collector.clone());

        proc.spawn(300, "/tmp/a", &["/tmp/a"]);
        probe.scan().unwrap();
        proc.exit(300);
        probe.scan().unwrap();
        proc.spawn(300, "/tmp/b", &["/tmp/b"]);
        probe.scan().unwrap();

        assert_eq!(collector.filenames(), vec!["/tmp/a", "/tmp/b"]);
    }

    #[test]
    fn types_without_rules_are_filtered() {
        let proc = FakeProc::new();
        let probe = proc.probe(Duration::from_secs(60));
        probe.init().unwrap();
        probe.snapshot().unwrap();

        let rule_set = rule_set(
            &probe,
            &[("open", EventType::FileOpened, r#"payload.filename == "/etc/shadow""#)],
        );
        let report = probe.apply_rule_set(&rule_set).unwrap();
        assert_eq!(report.rules, 1);
        assert_eq!(report.policies["FileOpened"].mode, PolicyMode::Accept);
        assert_eq!(report.policies["Exec"].mode, PolicyMode::Drop);
        assert_eq!(report.policies["Exec"].rules, 0);

        let collector = Arc::new(Collector::default());
        probe.set_event_handler(collector.clone());
        proc.spawn(10, "/tmp/x", &["/tmp/x"]);
        probe.scan().unwrap();

        assert!(collector.filenames().is_empty());
        assert_eq!(probe.get_stats().unwrap()["events_filtered"], 1);
    }

    #[test]
    fn discarders_drop_matching_events_until_next_rule_set() {
        let proc = FakeProc::new();
        let probe = proc.probe(Duration::from_secs(60));
        probe.init().unwrap();
        probe.snapshot().unwrap();
        let rule_set = exec_from_tmp(&probe);
        probe.apply_rule_set(&rule_set).unwrap();
        let collector = Arc::new(Collector::default());
        probe.set_event_handler(collector.clone());

        proc.spawn(20, "/usr/bin/ls", &["ls"]);
        probe.scan().unwrap();
        let first = collector.events.lock().unwrap()[0].clone();

        probe
            .on_new_discarder(&rule_set, &first, "payload.filename", EventType::Exec)
            .unwrap();
        assert_eq!(probe.get_stats().unwrap()["discarders"], 1);

        proc.spawn(21, "/usr/bin/ls", &["ls", "-l"]);
        probe.scan().unwrap();
        assert_eq!(collector.filenames().len(), 1);
        assert_eq!(probe.get_stats().unwrap()["events_discarded"], 1);

        // A new rule set clears discarders and ignores late ones from the old set.
        let next = exec_from_tmp(&probe);
        probe.apply_rule_set(&next).unwrap();
        probe
            .on_new_discarder(&rule_set, &first, "payload.filename", EventType::Exec)
            .unwrap();
        assert_eq!(probe.get_stats().unwrap()["discarders"], 0);

        proc.spawn(22, "/usr/bin/ls", &["ls", "-a"]);
        probe.scan().unwrap();
        assert_eq!(collector.filenames().len(), 2);
    }

    #[test]
    fn discarder_table_is_bounded() {
        let proc = FakeProc::new();
        let probe = proc.probe(Duration::from_secs(60));
        let rule_set = exec_from_tmp(&probe);
        probe.apply_rule_set(&rule_set).unwrap();

        let exec = |filename: String| {
            Event::new(
                Header {
                    pid: 1,
                    ppid: 0,
                    image: "/sbin/init".to_string(),
                    timestamp: SystemTime::now(),
                },
                Payload::Exec {
                    filename,
                    argv: vec![],
                },
            )
        };

        for i in 0..MAX_DISCARDERS + 10 {
            probe
                .on_new_discarder(
                    &rule_set,
                    &exec(format!("/usr/bin/tool-{i}")),
                    "payload.filename",
                    EventType::Exec,
                )
                .unwrap();
        }

        let stats = probe.get_stats().unwrap();
        assert_eq!(stats["discarders"], MAX_DISCARDERS as u64);
        assert_eq!(stats["discarders_overflow"], 10);

        let filters = probe.shared.filters.read().unwrap();
        assert!(filters.is_discarded(&exec("/usr/bin/tool-0".to_string())));
        assert!(!filters.is_discarded(&exec(format!("/usr/bin/tool-{MAX_DISCARDERS}"))));
    }

    #[test]
    fn unsupported_discarder() {
        let proc = FakeProc::new();
        let probe = proc.probe(Duration::from_secs(60));
        let rule_set = exec_from_tmp(&probe);
        let event = Event::new(
            Header {
                pid: 1,
                ppid: 0,
                image: "/sbin/init".to_string(),
                timestamp: SystemTime::now(),
            },
            Payload::Exec {
                filename: "/sbin/init".to_string(),
                argv: vec![],
            },
        );
        assert!(matches!(
            probe.on_new_discarder(&rule_set, &event, "header.pid", EventType::Exec),
            Err(ProbeError::UnsupportedDiscarder { .. })
        ));
    }

    #[test]
    fn polling_thread() {
        let proc = FakeProc::new();
        let probe = proc.probe(Duration::from_millis(10));
        probe.init().unwrap();
        probe.snapshot().unwrap();
        probe.apply_rule_set(&exec_from_tmp(&probe)).unwrap();
        let collector = Arc::new(Collector::default());
        probe.set_event_handler(collector.clone());
        probe.start().unwrap();
        assert!(matches!(probe.start(), Err(ProbeError::AlreadyStarted)));

        proc.spawn(42, "/tmp/dropper", &["/tmp/dropper"]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while collector.filenames().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(collector.filenames(), vec!["/tmp/dropper"]);

        probe.close().unwrap();
        probe.close().unwrap();
    }
}
