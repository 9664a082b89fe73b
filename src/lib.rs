pub mod agent;
pub mod clock;
pub mod collector;
pub mod config;
pub mod db;
pub mod dwell;
pub mod error;
pub mod geo;
pub mod identity;
pub mod payload;
pub mod transport;
mod utils;

pub use agent::{AgentCapabilities, FlushHandle, PageAgent};
pub use config::{AgentConfig, CollectorConfig};
pub use dwell::{PagePhase, Visibility};
pub use error::AgentError;
pub use payload::{PageContext, Payload};

/// Collector entry point: logging, configuration from the environment, then
/// serve until shutdown.
pub fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("pagepulse collector starting up...");

    let config = CollectorConfig::from_env()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(collector::start_server(config))
}
