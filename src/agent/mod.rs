pub mod controller;

pub use controller::{AgentCapabilities, DwellSnapshot, FlushHandle, PageAgent};
