use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

use super::state::{DwellState, PagePhase};

// Set to true to enable sampler logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub async fn sampling_loop(
    session_id: String,
    state: Arc<Mutex<DwellState>>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    verbose: bool,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut guard = state.lock().await;
                if guard.phase != PagePhase::Sampling {
                    log_warn!(
                        "sampler for session {} found phase {}, exiting",
                        session_id,
                        guard.phase
                    );
                    break;
                }
                let added = guard.sample(clock.now());
                if verbose {
                    log_debug!(
                        "session {}: +{}ms visible, {}ms total",
                        session_id,
                        added,
                        guard.dwell_ms
                    );
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("sampler for session {} shutting down", session_id);
                break;
            }
        }
    }
}

/// Owns the running sampler task.
pub struct Sampler {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(
        &mut self,
        session_id: String,
        state: Arc<Mutex<DwellState>>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
        verbose: bool,
    ) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sampling_loop(
            session_id,
            state,
            clock,
            tick_interval,
            verbose,
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
    }

    /// Cancels the task and waits for it to leave the loop.
    pub async fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    log_error!("sampler task failed to join: {err}");
                }
            }
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::SystemClock, dwell::Visibility};
    use chrono::Utc;

    #[tokio::test]
    async fn sampler_accumulates_while_visible_and_stops_on_cancel() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = Arc::new(Mutex::new(DwellState::new()));
        state
            .lock()
            .await
            .begin(Visibility::Visible, Utc::now(), clock.now());

        let mut sampler = Sampler::new();
        sampler.start(
            "s-1".into(),
            state.clone(),
            clock.clone(),
            Duration::from_millis(10),
            true,
        );
        assert!(sampler.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        sampler.stop().await;
        assert!(!sampler.is_running());

        let dwell_after_stop = state.lock().await.dwell_ms;
        assert!(dwell_after_stop > 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(state.lock().await.dwell_ms, dwell_after_stop);
    }

    #[tokio::test]
    async fn sampler_leaves_accumulator_flat_while_hidden() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = Arc::new(Mutex::new(DwellState::new()));
        state
            .lock()
            .await
            .begin(Visibility::Hidden, Utc::now(), clock.now());

        let mut sampler = Sampler::new();
        sampler.start(
            "s-hidden".into(),
            state.clone(),
            clock.clone(),
            Duration::from_millis(10),
            false,
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(state.lock().await.dwell_ms, 0);

        state
            .lock()
            .await
            .set_visibility(Visibility::Visible, clock.now());
        tokio::time::sleep(Duration::from_millis(40)).await;
        sampler.stop().await;

        let guard = state.lock().await;
        assert!(guard.dwell_ms > 0);
        assert!(guard.dwell_ms < 1000);
    }
}
