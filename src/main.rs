use std::time::Duration;

use clap::Parser;
use termux_agent::cli::Cli;

/// Single-threaded by design: handler code, the autopoll tick, and resize
/// propagation all run on one execution context.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // --log-level, when given, wins over RUST_LOG; otherwise RUST_LOG wins
    // over the "info" default.
    let mut builder = match &cli.log_level {
        Some(level) => {
            let mut b = env_logger::Builder::new();
            b.parse_filters(level);
            b
        }
        None => env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")),
    };
    builder.target(env_logger::Target::Stderr).init();

    let autopoll_interval = Duration::from_millis(cli.autopoll_interval_ms);
    let status = termux_agent::run(autopoll_interval).await;
    std::process::exit(status);
}
