use clap::{ArgAction, Args};

pub mod warden;
pub mod wardend;

#[derive(Args, Debug, Clone, Default)]
pub struct Verbosity {
    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,
}

impl Verbosity {
    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            2..=u8::MAX => log::LevelFilter::Trace,
        }
    }
}
