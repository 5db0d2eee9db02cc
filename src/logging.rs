// Tracing bootstrap for binaries and tests embedding the gateway

use tracing_subscriber::EnvFilter;

// RUST_LOG wins when set; otherwise the debug flag picks the crate's verbosity.
// Returns false when a global subscriber was already installed.
pub fn init(debug: bool) -> bool {
    let default_level = if debug {
        "boardgame_gateway=debug"
    } else {
        "boardgame_gateway=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
