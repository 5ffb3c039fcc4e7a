use std::sync::Arc;

use anyhow::{Context, Result};
use nix::unistd::geteuid;
use rules_engine::DirectoryPolicyLoader;
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    cli::wardend::WardenDaemonOpts,
    module::{Config, Module},
    probe::{ProcfsConfig, ProcfsProbe},
};

mod config;

pub use config::WardenConfig;

/// Section of the daemon and detection pipeline settings.
const WARDEN_CONFIG: &str = "warden";
/// Section of the procfs probe settings.
const PROCFS_CONFIG: &str = "procfs";

pub async fn warden_daemon_run(options: &WardenDaemonOpts) -> Result<()> {
    log::trace!("Warden Daemon Options: {:?}", options);

    if !geteuid().is_root() {
        log::warn!("not running as root: some processes won't be visible");
    }

    let config = if let Some(custom_file) = &options.config_file {
        WardenConfig::with_custom_file(custom_file)?
    } else {
        WardenConfig::new()?
    };

    let module_config = Config::try_from(&config.get_module_config(WARDEN_CONFIG))
        .context("invalid [warden] configuration")?;
    if !module_config.enabled {
        log::info!("warden disabled by configuration");
        return Ok(());
    }
    let procfs_config = ProcfsConfig::try_from(&config.get_module_config(PROCFS_CONFIG))
        .context("invalid [procfs] configuration")?;

    let loader = Arc::new(DirectoryPolicyLoader::new(&module_config.policies_dir));
    let probe = Arc::new(ProcfsProbe::new(procfs_config));
    let module = Module::new(module_config, probe, loader);

    if let Err(err) = module.start().await {
        if let Err(close_err) = module.close().await {
            log::warn!("cleanup after failed start: {close_err}");
        }
        return Err(err).context("starting warden");
    }
    log::info!("warden started");

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
    }

    log::info!("Terminating warden...");
    module.close().await.context("closing warden")?;

    Ok(())
}
