//! The detection pipeline.
//!
//! [`Module`] owns the probe, the active rule set, the [`RateLimiter`] and
//! the [`EventServer`]. Probe events are evaluated against the active rule
//! set; matches go through the rate limiter before being queued to the
//! subscribers of the match stream.
//!
//! ```text
//!  probe --event--> Module::handle_event --> RuleSet::evaluate
//!                                                 |
//!                                     rule_match  |  event_discarder_found
//!                                                 v
//!                         RateLimiter::allow --> EventServer::send_event
//! ```

use std::{
    collections::BTreeMap,
    fs::{self, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use engine_api::server::{DEFAULT_QUEUE_SIZE, EventServer, EventServerStats, ServerHandle};
use rules_engine::{PolicyError, PolicyLoader, RuleSet};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    net::UnixListener,
    signal::unix::{Signal, SignalKind, signal},
    sync::mpsc,
    task::{JoinError, JoinHandle},
};
use warden_core::{
    ConfigError, Event, ModuleConfig, ShutdownSender, ShutdownSignal, StatsSink, StatsdClient,
};

use crate::probe::{EventHandler, Probe, ProbeError, Report};

pub mod rate_limiter;
mod reload;
mod stats_monitor;

use rate_limiter::{LimitPolicy, LimiterStats, RateLimit, RateLimiter};
use reload::{ActiveRuleSet, ReloadController};
use stats_monitor::StatsPublisher;

#[derive(Debug, Clone)]
pub struct Config {
    pub enabled: bool,
    pub socket_path: PathBuf,
    pub policies_dir: PathBuf,
    pub statsd_addr: Option<String>,
    pub stats_interval: Duration,
    pub rate_limit: RateLimit,
    pub subscriber_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: PathBuf::from(engine_api::DEFAULT_UDS),
            policies_dir: PathBuf::from("/etc/warden/policies"),
            statsd_addr: None,
            stats_interval: Duration::from_secs(20),
            rate_limit: RateLimit::default(),
            subscriber_queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let default = Self::default();

        let stats_interval = match config.optional::<u64>("stats_interval")? {
            None => default.stats_interval,
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    field: "stats_interval".to_string(),
                    value: "0".to_string(),
                    err: "must be greater than zero".to_string(),
                });
            }
            Some(seconds) => Duration::from_secs(seconds),
        };

        Ok(Self {
            enabled: config.with_default("enabled", default.enabled)?,
            socket_path: config.with_default("socket_path", default.socket_path)?,
            policies_dir: config.with_default("policies_dir", default.policies_dir)?,
            statsd_addr: config.optional("statsd_addr")?,
            stats_interval,
            rate_limit: RateLimit {
                policy: config.with_default("rate_limit_policy", LimitPolicy::default())?,
                burst: config.with_default("rate_limit_burst", default.rate_limit.burst)?,
                period: config
                    .millis_with_default("rate_limit_period", default.rate_limit.period)?,
            },
            subscriber_queue_size: config
                .with_default("subscriber_queue_size", default.subscriber_queue_size)?,
        })
    }
}

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("cannot bind {path}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("probe initialization failed")]
    ProbeInit(#[source] ProbeError),
    #[error("probe start failed")]
    ProbeStart(#[source] ProbeError),
    #[error("system snapshot failed")]
    Snapshot(#[source] ProbeError),
    #[error("loading policies")]
    Policy(#[from] PolicyError),
    #[error("probe error")]
    Probe(#[source] ProbeError),
    #[error("background task failed")]
    Join(#[from] JoinError),
    #[error("module already started")]
    AlreadyStarted,
    #[error("module not running")]
    NotRunning,
}

/// Snapshot of the counters of every component.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStats {
    pub probe: Option<BTreeMap<String, u64>>,
    pub rate_limiter: BTreeMap<String, LimiterStats>,
    pub event_server: EventServerStats,
}

pub struct Module {
    config: Config,
    probe: Arc<dyn Probe>,
    rate_limiter: Arc<RateLimiter>,
    event_server: EventServer,
    stats_sink: Option<Arc<dyn StatsSink>>,
    controller: ReloadController,
    active: ActiveRuleSet,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
}

/// Resources acquired by [`Module::start`], released by [`Module::close`].
struct Runtime {
    tx_shutdown: ShutdownSender,
    tx_reload: Option<mpsc::Sender<()>>,
    server: Option<ServerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Module {
    /// Create the module, publishing stats to the statsd server in the
    /// configuration if any.
    pub fn new(
        config: Config,
        probe: Arc<dyn Probe>,
        loader: Arc<dyn PolicyLoader>,
    ) -> Arc<Self> {
        let stats_sink: Option<Arc<dyn StatsSink>> = match &config.statsd_addr {
            None => {
                log::warn!("statsd_addr not configured, stats disabled");
                None
            }
            Some(addr) => match StatsdClient::new(addr) {
                Ok(client) => Some(Arc::new(client)),
                Err(err) => {
                    log::warn!("stats disabled: {err}");
                    None
                }
            },
        };

        Self::with_stats_sink(config, probe, loader, stats_sink)
    }

    pub fn with_stats_sink(
        config: Config,
        probe: Arc<dyn Probe>,
        loader: Arc<dyn PolicyLoader>,
        stats_sink: Option<Arc<dyn StatsSink>>,
    ) -> Arc<Self> {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let event_server = EventServer::new(config.subscriber_queue_size);
        let controller = ReloadController::new(
            probe.clone(),
            loader,
            rate_limiter.clone(),
            event_server.clone(),
        );

        Arc::new(Self {
            config,
            probe,
            rate_limiter,
            event_server,
            stats_sink,
            controller,
            active: ActiveRuleSet::default(),
            runtime: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bring the module to steady state: match stream served, probe running,
    /// first rule set active.
    ///
    /// On error the module is left partially started; call [`Module::close`]
    /// to release what was acquired.
    pub async fn start(self: &Arc<Self>) -> Result<(), ModuleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ModuleError::NotRunning);
        }

        let socket_path = &self.config.socket_path;
        let bind_error = |source| ModuleError::Bind {
            path: socket_path.clone(),
            source,
        };

        let (tx_shutdown, shutdown) = ShutdownSignal::new();
        {
            let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
            if runtime.is_some() {
                return Err(ModuleError::AlreadyStarted);
            }

            match fs::remove_file(socket_path) {
                Ok(()) => log::debug!("removed stale socket {}", socket_path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(bind_error(err)),
            }
            let listener = UnixListener::bind(socket_path).map_err(bind_error)?;

            // From here on the socket file is ours to remove.
            let runtime = runtime.insert(Runtime {
                tx_shutdown,
                tx_reload: None,
                server: None,
                tasks: Vec::new(),
            });

            fs::set_permissions(socket_path, Permissions::from_mode(0o700)).map_err(bind_error)?;

            runtime.server = Some(self.event_server.serve(listener));
            log::info!("match stream listening on {}", socket_path.display());

            if let Some(sink) = &self.stats_sink {
                let publisher = StatsPublisher {
                    probe: self.probe.clone(),
                    rate_limiter: self.rate_limiter.clone(),
                    event_server: self.event_server.clone(),
                    sink: sink.clone(),
                };
                runtime
                    .tasks
                    .push(publisher.spawn(self.config.stats_interval, shutdown.clone()));
            }
        }

        self.probe.init().map_err(ModuleError::ProbeInit)?;
        self.probe.start().map_err(ModuleError::ProbeStart)?;
        self.probe.snapshot().map_err(ModuleError::Snapshot)?;

        let module = self.clone();
        tokio::task::spawn_blocking(move || module.reload()).await??;

        self.probe.set_event_handler(self.clone());

        // Registered before returning, so SIGHUP never falls back to the
        // default action once the module runs.
        let hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => Some(hangup),
            Err(err) => {
                log::warn!("cannot listen for SIGHUP: {err}");
                None
            }
        };
        let (tx_reload, rx_reload) = mpsc::channel(1);
        let reload_task = tokio::spawn(reload_on_request(
            Arc::downgrade(self),
            hangup,
            rx_reload,
            shutdown,
        ));
        if let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            runtime.tx_reload = Some(tx_reload);
            runtime.tasks.push(reload_task);
        }

        Ok(())
    }

    /// Build a rule set from the current policy and make it active.
    ///
    /// Blocks on policy I/O. On error the previous rule set stays active.
    pub fn reload(&self) -> Result<Report, ModuleError> {
        self.controller.reload(&self.active)
    }

    /// Ask the reload task for a reload, as SIGHUP does.
    ///
    /// Requests made while another one is pending are merged.
    pub fn request_reload(&self) -> Result<(), ModuleError> {
        let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let tx_reload = runtime
            .as_ref()
            .and_then(|runtime| runtime.tx_reload.as_ref())
            .ok_or(ModuleError::NotRunning)?;

        match tx_reload.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(ModuleError::NotRunning),
        }
    }

    pub fn get_rule_set(&self) -> Option<Arc<RuleSet>> {
        self.active.get()
    }

    pub fn get_probe(&self) -> Arc<dyn Probe> {
        self.probe.clone()
    }

    pub fn event_server(&self) -> &EventServer {
        &self.event_server
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn get_stats(&self) -> ModuleStats {
        let probe = match self.probe.get_stats() {
            Ok(stats) => Some(stats),
            Err(err) => {
                log::debug!("probe stats unavailable: {err}");
                None
            }
        };

        ModuleStats {
            probe,
            rate_limiter: self.rate_limiter.stats(),
            event_server: self.event_server.stats(),
        }
    }

    /// Stop serving, remove the socket and stop the probe.
    ///
    /// Only the first call has an effect. Safe after a failed
    /// [`Module::start`].
    pub async fn close(&self) -> Result<(), ModuleError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(runtime) = runtime {
            if let Some(server) = runtime.server {
                server.stop().await;
            }
            self.event_server.clear_subscribers();

            runtime.tx_shutdown.send_signal();
            drop(runtime.tx_reload);
            for task in runtime.tasks {
                if let Err(err) = task.await {
                    log::warn!("background task failed: {err}");
                }
            }

            let socket_path = &self.config.socket_path;
            match fs::remove_file(socket_path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("cannot remove {}: {err}", socket_path.display()),
            }
        }

        self.probe.close().map_err(ModuleError::Probe)
    }
}

impl EventHandler for Module {
    fn handle_event(&self, event: &Event) {
        let Some(rule_set) = self.active.get() else {
            return;
        };

        if let Err(err) = rule_set.evaluate(event) {
            log::debug!("evaluation of {} event failed: {err}", event.event_type());
        }
    }
}

/// Reload on SIGHUP or on [`Module::request_reload`] until shutdown.
async fn reload_on_request(
    module: Weak<Module>,
    mut hangup: Option<Signal>,
    mut rx_reload: mpsc::Receiver<()>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let sighup = async {
            match hangup.as_mut() {
                Some(hangup) => hangup.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = sighup => log::info!("SIGHUP received, reloading policies"),
            request = rx_reload.recv() => {
                if request.is_none() {
                    break;
                }
                log::info!("reloading policies");
            }
        }

        let Some(module) = module.upgrade() else {
            break;
        };
        match tokio::task::spawn_blocking(move || module.reload()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => log::error!(
                "{:?}",
                anyhow::Error::new(err).context("reload failed, previous rule set kept")
            ),
            Err(err) => log::error!("reload task failed: {err}"),
        }
    }

    log::debug!("reload task stopped");
}
