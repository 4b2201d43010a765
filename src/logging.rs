// Log setup for the `rig` binary
//
// Library code only emits `tracing` events; installing a subscriber is left to
// the binary (or to a test that wants to see them).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default directive when RUST_LOG is unset
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "stackrig=warn",
        1 => "stackrig=info",
        2 => "stackrig=debug",
        _ => "stackrig=trace",
    }
}

/// Install a stderr fmt subscriber filtered by RUST_LOG or the verbosity level
///
/// Returns false when a global subscriber was already installed.
pub fn init(verbose: u8) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry().with(fmt_layer).try_init().is_ok()
}
