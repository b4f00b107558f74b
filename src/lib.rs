pub mod billing;
pub mod clock;
pub mod commands;
pub mod config;
pub mod error;

#[cfg(test)]
mod testing;

pub use billing::BillingState;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::BillingConfig;
pub use error::{BillingError, BillingResult, ErrorResponse};

use tracing_subscriber::EnvFilter;

/// Initialize tracing with the RUST_LOG env filter
///
/// Default: warn for most crates, info for billing (state transitions visible).
/// Use RUST_LOG=debug for per-operation logs. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,interview_billing=info")),
        )
        .try_init();
}

/// Load configuration, set up logging and open the billing store
pub fn bootstrap() -> BillingResult<BillingState> {
    let config = BillingConfig::from_env()?;
    init_tracing();
    BillingState::new(&config)
}
