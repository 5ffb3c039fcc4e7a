use anyhow::Result;
use clap::Parser;
use warden::cli::{Verbosity, warden::WardenCliOpts};

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    warden::init_logger(Some(opts.verbosity.log_level_filter()));

    match warden::warden::warden_cli_run(&opts.cli_opts).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            warden::utils::report_error(&e);
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(about = "Warden command line utility")]
#[clap(version = warden::metadata::VERSION)]
#[clap(disable_help_subcommand = true)]
struct Opts {
    #[command(flatten)]
    cli_opts: WardenCliOpts,

    #[command(flatten)]
    pub verbosity: Verbosity,
}
