use thiserror::Error;

use crate::{dwell::PagePhase, identity::StorageScope};

/// Failures the host embedding a `PageAgent` may want to tell apart.
/// Everything on the delivery path is absorbed and logged instead.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{scope} storage unavailable: {source}")]
    StorageUnavailable {
        scope: StorageScope,
        #[source]
        source: anyhow::Error,
    },

    #[error("tick interval must be greater than zero")]
    InvalidTickInterval,

    #[error("agent already started (phase {0})")]
    AlreadyStarted(PagePhase),

    #[error("page-hide not accepted in phase {0}")]
    FlushRejected(PagePhase),
}
