//! Fire-and-forget delivery of the exit payload.

use log::{info, warn};
use reqwest::header::CONTENT_TYPE;
use tokio::runtime::Handle;

/// Hands a body to the network and returns at once. Delivery outcome is
/// never reported back to the caller.
pub trait Transport: Send + Sync {
    fn send_beacon(&self, endpoint: &str, body: Vec<u8>);
}

/// Posts the body on a detached task so the request keeps going after the
/// agent that queued it is gone.
#[derive(Clone)]
pub struct BeaconTransport {
    client: reqwest::Client,
    runtime: Handle,
}

impl BeaconTransport {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::with_runtime(Handle::current())
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            client: reqwest::Client::new(),
            runtime,
        }
    }
}

impl Transport for BeaconTransport {
    fn send_beacon(&self, endpoint: &str, body: Vec<u8>) {
        let request = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let endpoint = endpoint.to_string();

        self.runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!("beacon delivered to {endpoint} ({})", response.status());
                }
                Ok(response) => {
                    warn!("collector {endpoint} rejected beacon: {}", response.status());
                }
                Err(err) => {
                    warn!("beacon to {endpoint} failed: {err}");
                }
            }
        });
    }
}
