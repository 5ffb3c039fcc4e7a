//! Warden is a host runtime security monitor.
//!
//! It observes system activity through a [probe](crate::probe::Probe),
//! evaluates every event against a hot reloadable set of detection rules and
//! streams the matches to subscribers on a local Unix socket. Two binaries
//! are provided:
//!
//! - `wardend`: the daemon, running the detection [module](crate::module::Module)
//! - `warden`: the command line utility, to follow the match stream and
//!   validate policies offline
//!
//! ```sh
//! # Execute the daemon, SIGHUP reloads the policies
//! wardend --config-file /etc/warden/warden.ini
//!
//! # Follow the matches
//! warden monitor
//! ```
//!
//! ## Policies
//!
//! Rules are YAML files found under the `policies_dir` directory, each one a
//! list of rules with an `id`, the event `type` it applies to and an
//! `expression` over the fields of the event:
//!
//! ```yaml
//! - id: exec_from_tmp
//!   type: Exec
//!   expression: payload.filename STARTS_WITH "/tmp"
//! ```

pub mod cli;
pub mod module;
pub mod probe;
pub mod utils;
pub mod warden;
pub mod wardend;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger at `override_log_level`, info when `None`.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
