//! Ambient CLI surface. The control protocol itself takes no arguments —
//! there is no further CLI surface beyond the binary's own name — so these
//! flags only configure local logging and autopoll cadence for debugging.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "termux-agent", about = "PTY-backed terminal multiplexer agent")]
pub struct Cli {
    /// Overrides RUST_LOG if set; falls back to RUST_LOG, then "info".
    #[arg(long)]
    pub log_level: Option<String>,

    /// Autopoll tick interval, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub autopoll_interval_ms: u64,
}
