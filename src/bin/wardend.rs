use anyhow::Result;
use clap::Parser;
use warden::cli::{Verbosity, wardend::WardenDaemonOpts};

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    warden::init_logger(Some(opts.verbosity.log_level_filter()));

    match warden::wardend::warden_daemon_run(&opts.daemon_opts).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            warden::utils::report_error(&e);
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(about = "Warden runtime security agent")]
#[clap(version = warden::metadata::VERSION)]
#[clap(disable_help_subcommand = true)]
struct Opts {
    #[command(flatten)]
    pub daemon_opts: WardenDaemonOpts,

    #[command(flatten)]
    pub verbosity: Verbosity,
}
