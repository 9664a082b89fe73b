use std::{sync::Arc, time::Duration};

use axum::{routing::get, Json, Router};
use pagepulse::{
    clock::ManualClock,
    collector::{serve, CollectorState},
    db::Database,
    geo::IpApiLookup,
    identity::{FileStorage, IdentityStores, MemoryStorage},
    transport::BeaconTransport,
    AgentCapabilities, AgentConfig, PageAgent, PageContext, Visibility,
};
use serde_json::json;
use tokio::net::TcpListener;

async fn spawn_fake_geo() -> String {
    let app = Router::new().route(
        "/json",
        get(|| async {
            Json(json!({
                "status": "success",
                "query": "192.0.2.44",
                "country": "Portugal",
                "countryCode": "PT",
                "city": "Porto"
            }))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/json")
}

#[tokio::test]
async fn page_hide_beacon_reaches_collector() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(dir.path().join("collector.sqlite3")).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let collector_addr = listener.local_addr().unwrap();
    let state = CollectorState { db: db.clone() };
    tokio::spawn(async move {
        let _ = serve(listener, state).await;
    });
    let geo_endpoint = spawn_fake_geo().await;

    let clock = Arc::new(ManualClock::new());
    let durable = Arc::new(FileStorage::open(dir.path().join("durable.json")).unwrap());
    let mut config = AgentConfig::default()
        .with_collector_endpoint(format!("http://{collector_addr}/track"))
        .with_tick_interval(Duration::from_secs(3600));
    config.geo_endpoint = geo_endpoint;
    let capabilities = AgentCapabilities {
        clock: clock.clone(),
        stores: IdentityStores::new(durable, Arc::new(MemoryStorage::new())),
        geo: Some(Arc::new(IpApiLookup::from_config(&config))),
        transport: Arc::new(BeaconTransport::new()),
    };
    let page = PageContext::new(
        "https://news.test/article/42",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    )
    .with_referrer("https://news.test/");

    let agent = PageAgent::init(config, page, capabilities).unwrap();
    let session_id = agent.identities().session_id.clone();
    let user_id = agent.identities().user_id.clone();

    agent.start(Visibility::Visible).await.unwrap();
    clock.advance(Duration::from_secs(4));
    agent.tick().await;
    agent.on_visibility_change(Visibility::Hidden).await;
    clock.advance(Duration::from_secs(30));
    agent.on_visibility_change(Visibility::Visible).await;
    clock.advance(Duration::from_secs(3));

    let flush = agent.on_page_hide().await.unwrap();
    assert_eq!(flush.time_spent_seconds, 7);
    flush.wait().await;
    drop(agent);

    let mut stored = None;
    for _ in 0..100 {
        if let Some(record) = db.get_visitor(&session_id).await.unwrap() {
            stored = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stored = stored.expect("beacon never reached the collector");

    assert_eq!(stored.user_id.as_deref(), Some(user_id.as_str()));
    assert_eq!(stored.time_spent_seconds, Some(7));
    assert_eq!(stored.page_visited.as_deref(), Some("https://news.test/article/42"));
    assert_eq!(stored.previous_page.as_deref(), Some("https://news.test/"));
    assert_eq!(stored.country.as_deref(), Some("Portugal"));
    assert_eq!(stored.country_code.as_deref(), Some("PT"));
    assert_eq!(stored.city.as_deref(), Some("Porto"));
    assert_eq!(stored.public_ip.as_deref(), Some("192.0.2.44"));
    assert_eq!(stored.browser.as_deref(), Some("Safari"));
    assert_eq!(stored.operating_system.as_deref(), Some("MacOS"));
    assert_eq!(stored.os_version.as_deref(), Some("10.15.7"));
}

#[tokio::test]
async fn unreachable_collector_is_silent() {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig::default()
        .with_collector_endpoint("http://127.0.0.1:9/track")
        .with_tick_interval(Duration::from_secs(3600));
    let capabilities = AgentCapabilities {
        clock: Arc::new(ManualClock::new()),
        stores: IdentityStores::new(
            Arc::new(FileStorage::open(dir.path().join("durable.json")).unwrap()),
            Arc::new(MemoryStorage::new()),
        ),
        geo: Some(Arc::new(IpApiLookup::new(
            "http://127.0.0.1:9/json",
            Some(Duration::from_millis(200)),
        ))),
        transport: Arc::new(BeaconTransport::new()),
    };

    let agent = PageAgent::init(
        config,
        PageContext::new("https://offline.test/", "curl/8.0"),
        capabilities,
    )
    .unwrap();
    agent.start(Visibility::Visible).await.unwrap();
    agent.on_page_hide().await.unwrap().wait().await;

    assert_eq!(agent.phase().await, pagepulse::PagePhase::Terminal);
}

#[tokio::test]
async fn visitor_id_persists_across_page_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("durable.json");

    let load = |session: Arc<MemoryStorage>| {
        let capabilities = AgentCapabilities {
            clock: Arc::new(ManualClock::new()),
            stores: IdentityStores::new(
                Arc::new(FileStorage::open(path.clone()).unwrap()),
                session,
            ),
            geo: None,
            transport: Arc::new(BeaconTransport::new()),
        };
        PageAgent::init(
            AgentConfig::default(),
            PageContext::new("https://a.test/", "ua"),
            capabilities,
        )
        .unwrap()
    };

    let tab = Arc::new(MemoryStorage::new());
    let first = load(tab.clone());
    let same_tab = load(tab);
    let new_browser_session = load(Arc::new(MemoryStorage::new()));

    assert_eq!(first.identities(), same_tab.identities());
    assert_eq!(first.identities().user_id, new_browser_session.identities().user_id);
    assert_ne!(first.identities().session_id, new_browser_session.identities().session_id);
}
