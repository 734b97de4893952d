use env_logger::{Builder, Env};
use log::error;

fn init_logger() {
    // Уровень из RUST_LOG, иначе info.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = propstore::cli::run() {
        error!("{:?}", e);
        std::process::exit(1);
    }
}
