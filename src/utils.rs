use std::env;

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    matches!(env::var("RUST_BACKTRACE").as_deref(), Ok("1" | "full"))
}

/// Log `e` with its causes, and its backtrace when verbose.
pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
