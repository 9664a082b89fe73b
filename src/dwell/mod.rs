pub mod sampler;
pub mod state;

pub use sampler::Sampler;
pub use state::{round_to_seconds, DwellState, PagePhase, Visibility};
