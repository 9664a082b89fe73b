use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    clock::Clock,
    config::AgentConfig,
    dwell::{round_to_seconds, DwellState, PagePhase, Sampler, Visibility},
    error::AgentError,
    geo::GeoLookup,
    identity::{Identities, IdentityStores},
    payload::{PageContext, Payload},
    transport::Transport,
};

/// Environment-provided services the agent runs on.
#[derive(Clone)]
pub struct AgentCapabilities {
    pub clock: Arc<dyn Clock>,
    pub stores: IdentityStores,
    /// `None` skips geolocation entirely.
    pub geo: Option<Arc<dyn GeoLookup>>,
    pub transport: Arc<dyn Transport>,
}

#[derive(Debug, Serialize, Clone)]
pub struct DwellSnapshot {
    pub state: DwellState,
    pub current_dwell_ms: u64,
}

/// Returned by `on_page_hide` once the dwell total is frozen. Awaiting it
/// is optional; delivery proceeds either way.
pub struct FlushHandle {
    pub time_spent_seconds: u64,
    task: JoinHandle<()>,
}

impl FlushHandle {
    /// Resolves after the payload has been handed to the transport.
    pub async fn wait(self) {
        if let Err(err) = self.task.await {
            error!("flush task failed to join: {err}");
        }
    }
}

/// One per page load.
#[derive(Clone)]
pub struct PageAgent {
    state: Arc<Mutex<DwellState>>,
    sampler: Arc<Mutex<Sampler>>,
    identities: Identities,
    page: PageContext,
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    geo: Option<Arc<dyn GeoLookup>>,
    transport: Arc<dyn Transport>,
}

impl PageAgent {
    /// Provisions both identifiers. Fails without a fallback when either
    /// storage scope is unusable.
    pub fn init(
        config: AgentConfig,
        page: PageContext,
        capabilities: AgentCapabilities,
    ) -> Result<Self, AgentError> {
        if config.tick_interval.is_zero() {
            return Err(AgentError::InvalidTickInterval);
        }
        let identities =
            Identities::provision(&capabilities.stores, &config.visitor_key, &config.session_key)?;
        info!(
            "page agent ready: user {} session {} on {}",
            identities.user_id, identities.session_id, page.url
        );

        Ok(Self {
            state: Arc::new(Mutex::new(DwellState::new())),
            sampler: Arc::new(Mutex::new(Sampler::new())),
            identities,
            page,
            config,
            clock: capabilities.clock,
            geo: capabilities.geo,
            transport: capabilities.transport,
        })
    }

    pub fn identities(&self) -> &Identities {
        &self.identities
    }

    pub fn page(&self) -> &PageContext {
        &self.page
    }

    pub async fn phase(&self) -> PagePhase {
        self.state.lock().await.phase
    }

    pub async fn snapshot(&self) -> DwellSnapshot {
        let guard = self.state.lock().await;
        DwellSnapshot {
            current_dwell_ms: guard.current_dwell_ms(self.clock.now()),
            state: guard.clone(),
        }
    }

    /// `Init → Sampling`, and spawn the periodic sampler.
    pub async fn start(&self, visibility: Visibility) -> Result<(), AgentError> {
        {
            let mut state = self.state.lock().await;
            if state.phase != PagePhase::Init {
                return Err(AgentError::AlreadyStarted(state.phase));
            }
            state.begin(visibility, self.clock.wall_now(), self.clock.now());
        }

        self.sampler.lock().await.start(
            self.identities.session_id.clone(),
            self.state.clone(),
            self.clock.clone(),
            self.config.tick_interval,
            self.config.debug,
        );

        info!(
            "sampling started for session {} ({:?})",
            self.identities.session_id, visibility
        );
        Ok(())
    }

    /// One sampler step outside the periodic task. Returns the milliseconds
    /// added.
    pub async fn tick(&self) -> u64 {
        self.state.lock().await.sample(self.clock.now())
    }

    pub async fn on_visibility_change(&self, visibility: Visibility) -> bool {
        let mut state = self.state.lock().await;
        let changed = state.set_visibility(visibility, self.clock.now());
        if changed && self.config.debug {
            info!(
                "session {} now {:?} with {}ms visible",
                self.identities.session_id, visibility, state.dwell_ms
            );
        }
        changed
    }

    /// `Sampling → Flushing → Terminal`. Stops the sampler, freezes the
    /// dwell total and dispatches the payload from a detached task. Any
    /// phase other than `Sampling` is refused and nothing is sent.
    pub async fn on_page_hide(&self) -> Result<FlushHandle, AgentError> {
        self.sampler.lock().await.stop().await;

        let (time_spent_seconds, started_at) = {
            let mut state = self.state.lock().await;
            let dwell_ms = state
                .begin_flush(self.clock.now())
                .map_err(AgentError::FlushRejected)?;
            (round_to_seconds(dwell_ms), state.started_at)
        };

        let payload = Payload::assemble(
            &self.identities,
            &self.page,
            time_spent_seconds,
            started_at.unwrap_or_else(|| self.clock.wall_now()),
        );

        let geo = self.geo.clone();
        let geo_timeout = self.config.geo_timeout;
        let transport = self.transport.clone();
        let endpoint = self.config.collector_endpoint.clone();
        let state = self.state.clone();

        let task = tokio::spawn(async move {
            let payload = match geo {
                Some(geo) => match tokio::time::timeout(geo_timeout, geo.lookup()).await {
                    Ok(Ok(fragment)) => payload.with_geo(fragment),
                    Ok(Err(err)) => {
                        warn!("geolocation unavailable, sending without it: {err:#}");
                        payload
                    }
                    Err(_) => {
                        warn!(
                            "geolocation still pending after {:?}, sending without it",
                            geo_timeout
                        );
                        payload
                    }
                },
                None => payload,
            };

            match payload.to_json_bytes() {
                Ok(body) => transport.send_beacon(&endpoint, body),
                Err(err) => error!(
                    "failed to encode payload for session {}: {err}",
                    payload.session_id
                ),
            }

            state.lock().await.finish();
        });

        info!(
            "flushing session {} with {}s visible",
            self.identities.session_id, time_spent_seconds
        );

        Ok(FlushHandle {
            time_spent_seconds,
            task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        geo::GeoFragment,
        identity::MemoryStorage,
    };
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::{sync::Mutex as StdMutex, time::Duration};

    #[derive(Default)]
    struct RecordingTransport {
        sent: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn bodies(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, body)| serde_json::from_slice(body).unwrap())
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn send_beacon(&self, endpoint: &str, body: Vec<u8>) {
            self.sent.lock().unwrap().push((endpoint.to_string(), body));
        }
    }

    struct StaticGeo;

    #[async_trait]
    impl GeoLookup for StaticGeo {
        async fn lookup(&self) -> Result<GeoFragment> {
            Ok(GeoFragment {
                ip: Some("203.0.113.7".into()),
                country: Some("Japan".into()),
                city: Some("Osaka".into()),
                country_code: Some("JP".into()),
            })
        }
    }

    struct FailingGeo;

    #[async_trait]
    impl GeoLookup for FailingGeo {
        async fn lookup(&self) -> Result<GeoFragment> {
            Err(anyhow!("connection reset"))
        }
    }

    struct StalledGeo;

    #[async_trait]
    impl GeoLookup for StalledGeo {
        async fn lookup(&self) -> Result<GeoFragment> {
            std::future::pending().await
        }
    }

    struct Harness {
        agent: PageAgent,
        clock: Arc<ManualClock>,
        transport: Arc<RecordingTransport>,
    }

    fn test_config() -> AgentConfig {
        AgentConfig::default()
            .with_collector_endpoint("http://collector.test/track")
            .with_tick_interval(Duration::from_secs(3600))
    }

    fn harness(geo: Option<Arc<dyn GeoLookup>>) -> Harness {
        harness_with(test_config(), geo)
    }

    fn harness_with(config: AgentConfig, geo: Option<Arc<dyn GeoLookup>>) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let transport = Arc::new(RecordingTransport::default());
        let page = PageContext::new("https://shop.test/cart", "Mozilla/5.0 (X11; Linux x86_64)")
            .with_referrer("https://shop.test/");
        let capabilities = AgentCapabilities {
            clock: clock.clone(),
            stores: IdentityStores::new(
                Arc::new(MemoryStorage::new()),
                Arc::new(MemoryStorage::new()),
            ),
            geo,
            transport: transport.clone(),
        };

        Harness {
            agent: PageAgent::init(config, page, capabilities).unwrap(),
            clock,
            transport,
        }
    }

    #[tokio::test]
    async fn five_visible_ticks_then_three_hidden_reports_five_seconds() {
        let h = harness(Some(Arc::new(StaticGeo)));
        h.agent.start(Visibility::Visible).await.unwrap();

        for _ in 0..5 {
            h.clock.advance(Duration::from_secs(1));
            h.agent.tick().await;
        }
        assert!(h.agent.on_visibility_change(Visibility::Hidden).await);
        for _ in 0..3 {
            h.clock.advance(Duration::from_secs(1));
            assert_eq!(h.agent.tick().await, 0);
        }

        let flush = h.agent.on_page_hide().await.unwrap();
        assert_eq!(flush.time_spent_seconds, 5);
        flush.wait().await;

        let sent = h.transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "http://collector.test/track");

        let body: Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(body["time_spent_seconds"], 5);
        assert_eq!(body["user_id"], h.agent.identities().user_id.as_str());
        assert_eq!(body["session_id"], h.agent.identities().session_id.as_str());
        assert_eq!(body["page_visited"], "https://shop.test/cart");
        assert_eq!(body["previous_page"], "https://shop.test/");
        assert_eq!(body["country"], "Japan");
        assert_eq!(body["city"], "Osaka");
        assert_eq!(h.agent.phase().await, PagePhase::Terminal);
    }

    #[tokio::test]
    async fn page_hide_counts_pending_visible_interval() {
        let h = harness(None);
        h.agent.start(Visibility::Visible).await.unwrap();

        h.clock.advance(Duration::from_millis(2600));
        let flush = h.agent.on_page_hide().await.unwrap();
        assert_eq!(flush.time_spent_seconds, 3);
        flush.wait().await;
    }

    #[tokio::test]
    async fn geolocation_failure_still_delivers_once() {
        let h = harness(Some(Arc::new(FailingGeo)));
        h.agent.start(Visibility::Visible).await.unwrap();
        h.clock.advance(Duration::from_secs(2));

        h.agent.on_page_hide().await.unwrap().wait().await;

        let bodies = h.transport.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["time_spent_seconds"], 2);
        assert!(bodies[0].get("country").is_none());
        assert!(bodies[0].get("city").is_none());
    }

    #[tokio::test]
    async fn stalled_geolocation_still_delivers_once_and_terminates() {
        let config = test_config().with_geo_timeout(Duration::from_millis(50));
        let h = harness_with(config, Some(Arc::new(StalledGeo)));
        h.agent.start(Visibility::Visible).await.unwrap();
        h.clock.advance(Duration::from_secs(5));

        let flush = h.agent.on_page_hide().await.unwrap();
        assert_eq!(flush.time_spent_seconds, 5);
        tokio::time::timeout(Duration::from_secs(3), flush.wait())
            .await
            .expect("flush finished despite stalled geolocation");

        let bodies = h.transport.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["time_spent_seconds"], 5);
        assert!(bodies[0].get("country").is_none());
        assert_eq!(h.agent.phase().await, PagePhase::Terminal);
    }

    #[test]
    fn zero_tick_interval_is_rejected_at_init() {
        let config = test_config().with_tick_interval(Duration::ZERO);
        let capabilities = AgentCapabilities {
            clock: Arc::new(ManualClock::new()),
            stores: IdentityStores::new(
                Arc::new(MemoryStorage::new()),
                Arc::new(MemoryStorage::new()),
            ),
            geo: None,
            transport: Arc::new(RecordingTransport::default()),
        };
        let err = PageAgent::init(config, PageContext::new("https://a.test/", "ua"), capabilities)
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::InvalidTickInterval));
    }

    #[tokio::test]
    async fn second_page_hide_is_rejected_without_delivery() {
        let h = harness(None);
        h.agent.start(Visibility::Visible).await.unwrap();
        h.agent.on_page_hide().await.unwrap().wait().await;

        let err = h.agent.on_page_hide().await.err().unwrap();
        assert!(matches!(err, AgentError::FlushRejected(PagePhase::Terminal)));
        assert_eq!(h.transport.bodies().len(), 1);
    }

    #[tokio::test]
    async fn page_hide_before_start_sends_nothing() {
        let h = harness(None);
        let err = h.agent.on_page_hide().await.err().unwrap();
        assert!(matches!(err, AgentError::FlushRejected(PagePhase::Init)));
        assert!(h.transport.bodies().is_empty());
    }

    #[tokio::test]
    async fn start_is_accepted_once() {
        let h = harness(None);
        h.agent.start(Visibility::Hidden).await.unwrap();
        let err = h.agent.start(Visibility::Visible).await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyStarted(PagePhase::Sampling)));
    }

    #[tokio::test]
    async fn snapshot_reports_pending_time_without_committing_it() {
        let h = harness(None);
        h.agent.start(Visibility::Visible).await.unwrap();
        h.clock.advance(Duration::from_millis(1200));

        let snapshot = h.agent.snapshot().await;
        assert_eq!(snapshot.current_dwell_ms, 1200);
        assert_eq!(snapshot.state.dwell_ms, 0);
        assert_eq!(snapshot.state.phase, PagePhase::Sampling);
    }

    #[tokio::test]
    async fn agents_sharing_durable_storage_share_visitor_id() {
        let durable: Arc<dyn crate::identity::Storage> = Arc::new(MemoryStorage::new());
        let make = |session: Arc<dyn crate::identity::Storage>| {
            let capabilities = AgentCapabilities {
                clock: Arc::new(ManualClock::new()),
                stores: IdentityStores::new(durable.clone(), session),
                geo: None,
                transport: Arc::new(RecordingTransport::default()),
            };
            PageAgent::init(
                AgentConfig::default(),
                PageContext::new("https://a.test/", "ua"),
                capabilities,
            )
            .unwrap()
        };

        let first_session: Arc<dyn crate::identity::Storage> = Arc::new(MemoryStorage::new());
        let second_session: Arc<dyn crate::identity::Storage> = Arc::new(MemoryStorage::new());
        let first_tab = make(first_session);
        let second_tab = make(second_session);
        assert_eq!(first_tab.identities().user_id, second_tab.identities().user_id);
        assert_ne!(first_tab.identities().session_id, second_tab.identities().session_id);
    }
}
