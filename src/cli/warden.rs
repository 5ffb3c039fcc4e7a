use clap::{Parser, Subcommand};

pub const NAME: &str = "warden";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(about = "Warden cli")]
pub struct WardenCliOpts {
    /// Specify custom api server
    #[clap(long)]
    pub api_server: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Print the live feed of rule matches
    Monitor(Monitor),

    /// Load and compile policies without a running daemon
    CheckPolicies(CheckPolicies),
}

#[derive(Parser, Debug, Clone)]
pub struct Monitor {
    /// Only show matches of this rule
    #[clap(long)]
    pub rule: Option<String>,

    /// Print matches as JSON lines
    #[clap(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct CheckPolicies {
    /// Directory scanned recursively for `*.yaml` policies
    #[clap(long, default_value = "/etc/warden/policies")]
    pub policies_dir: String,
}
