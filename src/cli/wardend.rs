use clap::Parser;

pub const NAME: &str = "wardend";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(about = "Warden daemon")]
pub struct WardenDaemonOpts {
    /// INI configuration file, `/etc/warden/warden.ini` when omitted.
    #[clap(long)]
    pub config_file: Option<String>,
}
