use tracing_subscriber::EnvFilter;

pub const DEFAULT_DIRECTIVE: &str = "edumeet=info";

/// Installs the fmt subscriber. `RUST_LOG` wins over `default_directive`.
/// Returns false when a subscriber was already set.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
