//! Integration tests for shroud
//!
//! Drives the full cross-context chain in process: a bridge pair, the
//! injection coordinator on the isolated side, and a main world that
//! boots the engine from the wrapped script, hardens a page surface
//! table and confirms readiness over the bridge.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use shroud::bridge::DETECTION_EVENT;
use shroud::domains::origin_of;
use shroud::mitigate::{
    audio::{CaptureAnalyser, PcmAudio},
    battery::HostBattery,
    canvas::{CanvasState, RasterCanvas},
    fonts::InstalledFonts,
    geometry::StaticLayout,
    media::HostMedia,
    timing::MonotonicClock,
    webgl::{DeviceGraphics, GlContextKind, GlQuery, GlValue},
    webrtc::HostRtc,
};
use shroud::persona::{fallback_persona, Catalog, MemoryStore, PersonaStore};
use shroud::{
    Bootstrap, Bridge, DetectionReporter, Engine, EngineSource, InjectRequest, InjectState,
    InjectionCoordinator, MainWorld, PageContext, PageSurfaces, Persona, PrivilegedHost, Result,
    SessionToken, ShroudConfig,
};

fn native_page() -> PageSurfaces {
    PageSurfaces {
        canvas: Box::new(RasterCanvas::new()),
        graphics: Box::new(DeviceGraphics::new(
            "NVIDIA Corporation",
            "NVIDIA GeForce RTX 3080/PCIe/SSE2",
        )),
        audio: Box::new(PcmAudio::new()),
        analyser: Box::new(CaptureAnalyser::new(vec![-60.0; 256], vec![0.0; 256])),
        time: Box::new(MonotonicClock::new()),
        layout: Box::new(StaticLayout::new()),
        media: Box::new(HostMedia::new(true, true, 1.25)),
        fonts: Box::new(InstalledFonts::new(["helvetica neue"])),
        battery: Some(Box::new(HostBattery::new(0.42, true))),
        rtc: Box::new(HostRtc::new("v=0")),
    }
}

fn catalog_json() -> &'static str {
    r#"[
        {
            "id": "macbook-m2",
            "name": "MacBook Air M2",
            "os": "macos",
            "browser": "chrome",
            "deviceType": "laptop",
            "userAgent": "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            "screen": {"width": 2560, "height": 1664, "availWidth": 2560, "availHeight": 1626, "colorDepth": 30, "pixelDepth": 30},
            "devicePixelRatio": 2.0,
            "timezone": "America/Los_Angeles",
            "language": "en-US",
            "languages": ["en-US", "en"],
            "webgl": {"vendor": "Google Inc. (Apple)", "renderer": "ANGLE (Apple, Apple M2, OpenGL 4.1)"},
            "hardwareConcurrency": 8,
            "platform": "MacIntel"
        }
    ]"#
}

/// Privileged side backed by a real persona store; direct main-world
/// injection is unavailable so the chain must fall through to the
/// script strategies
struct StoreHost {
    personas: PersonaStore,
    settings: ShroudConfig,
}

impl StoreHost {
    fn new(settings: ShroudConfig) -> Self {
        Self {
            personas: PersonaStore::new(
                Catalog::from_json(catalog_json()),
                Arc::new(MemoryStore::new()),
            ),
            settings,
        }
    }
}

impl PrivilegedHost for StoreHost {
    fn settings(&self) -> Result<ShroudConfig> {
        Ok(self.settings.clone())
    }

    fn persona_for_domain(&self, domain: &str, os_preference: Option<&str>) -> Result<Persona> {
        Ok(self.personas.get_or_create_for_domain(domain, os_preference))
    }

    fn inject_main_world(&self, _request: InjectRequest) -> Result<()> {
        Err(shroud::Error::storage("direct injection unavailable"))
    }
}

/// Main world that boots the engine from a wrapped script
struct EngineWorld {
    url: String,
    bridge: Arc<Bridge>,
    hardened: Mutex<Option<PageSurfaces>>,
}

impl EngineWorld {
    fn new(url: &str, bridge: Arc<Bridge>) -> Self {
        Self {
            url: url.to_string(),
            bridge,
            hardened: Mutex::new(None),
        }
    }

    fn boot(&self, script: &str) -> Result<()> {
        let bootstrap = Bootstrap::extract(script)
            .ok_or_else(|| shroud::Error::storage("no bootstrap payload"))?;
        let correlation_id = bootstrap.correlation_id.clone();

        let reporter = Arc::new(DetectionReporter::new(&self.url));
        let mut engine =
            Engine::from_bootstrap(&origin_of(&self.url), bootstrap, Arc::clone(&reporter));
        engine.relay_detections(Arc::clone(&self.bridge));

        let page = engine.harden(native_page());
        *self.hardened.lock().unwrap() = Some(page);

        let bridge = Arc::clone(&self.bridge);
        tokio::spawn(async move {
            let _ = engine.confirm_ready(&bridge, &correlation_id).await;
        });
        Ok(())
    }

    fn take_page(&self) -> PageSurfaces {
        self.hardened
            .lock()
            .unwrap()
            .take()
            .expect("engine never booted")
    }
}

impl MainWorld for EngineWorld {
    fn load_script_resource(&self, script: &str) -> Result<()> {
        self.boot(script)
    }

    fn eval_inline(&self, script: &str) -> Result<()> {
        self.boot(script)
    }
}

struct StaticSource;
impl EngineSource for StaticSource {
    fn fetch(&self) -> Result<String> {
        Ok("/* engine program */".to_string())
    }
}

struct Harness {
    coordinator: InjectionCoordinator,
    world: Arc<EngineWorld>,
    isolated: Arc<Bridge>,
    main: Arc<Bridge>,
    host: Arc<StoreHost>,
}

fn harness(url: &str, settings: ShroudConfig) -> Harness {
    let token = SessionToken::mint();
    let (isolated, main) = Bridge::pair(&token);
    let world = Arc::new(EngineWorld::new(url, Arc::clone(&main)));
    let host = Arc::new(StoreHost::new(settings));
    let coordinator = InjectionCoordinator::new(
        Arc::clone(&isolated),
        Arc::clone(&host) as Arc<dyn PrivilegedHost>,
        Arc::clone(&world) as Arc<dyn MainWorld>,
        Arc::new(StaticSource),
    );
    Harness {
        coordinator,
        world,
        isolated,
        main,
        host,
    }
}

#[tokio::test]
async fn test_injection_falls_through_to_script_strategy() {
    let h = harness("https://shop.example.com/cart", ShroudConfig::default());

    let state = h
        .coordinator
        .run(&PageContext::top("https://shop.example.com/cart"))
        .await;

    assert_eq!(state, InjectState::Injected);
    assert_eq!(h.coordinator.state(), InjectState::Injected);
}

#[tokio::test]
async fn test_hardened_page_spoofs_with_bound_persona() {
    let h = harness("https://shop.example.com/cart", ShroudConfig::default());
    let page_ctx = PageContext::top("https://shop.example.com/cart");

    let state = h.coordinator.run(&page_ctx).await;
    assert_eq!(state, InjectState::Injected);

    let page = h.world.take_page();

    // WebGL reports the persona's pair, not the device's
    let expected = h
        .host
        .personas
        .get_or_create_for_domain("shop.example.com", None);
    assert_eq!(expected.id, "macbook-m2");
    let ctx = page.graphics.create_context(GlContextKind::Webgl);
    assert_eq!(
        ctx.get_parameter(GlQuery::UnmaskedVendor),
        GlValue::Str(expected.webgl.vendor.clone())
    );
    assert!(ctx.get_extension("WEBGL_debug_renderer_info").is_none());

    // Canvas reads are deterministic within the page load and within
    // the documented noise bounds
    let canvas = CanvasState::filled(10, 10, [255, 255, 255, 255]);
    let first = page.canvas.read_pixels(&canvas);
    let second = page.canvas.read_pixels(&canvas);
    assert_eq!(first, second);
    let changed = first
        .iter()
        .zip(canvas.data.iter())
        .filter(|(a, b)| a != b)
        .count();
    assert!(changed <= 200);

    // Battery gone, preference queries flattened, fonts generic-only
    assert!(page.battery.is_none());
    assert!(!page.media.matches("(prefers-color-scheme: dark)"));
    assert_eq!(page.media.device_pixel_ratio(), 1.5);
    assert!(page.fonts.check("12px monospace"));
    assert!(!page.fonts.check("12px \"Helvetica Neue\""));

    // WebRTC in block mode
    assert!(page.rtc.create_peer_connection().is_err());
}

#[tokio::test]
async fn test_distinct_origins_produce_independent_noise() {
    let canvas = CanvasState::filled(64, 64, [128, 128, 128, 255]);
    let mut reads = Vec::new();

    for url in ["https://example.com/", "https://example.org/"] {
        let h = harness(url, ShroudConfig::default());
        let state = h.coordinator.run(&PageContext::top(url)).await;
        assert_eq!(state, InjectState::Injected);
        reads.push(h.world.take_page().canvas.read_pixels(&canvas));
    }

    assert_ne!(reads[0], reads[1]);
}

#[tokio::test]
async fn test_detections_relayed_across_contexts() {
    let h = harness("https://shop.example.com/", ShroudConfig::default());

    let (seen_tx, mut seen_rx) = mpsc::channel(16);
    h.isolated.set_detection_relay(move |data| {
        let _ = seen_tx.try_send(data);
    });

    let state = h
        .coordinator
        .run(&PageContext::top("https://shop.example.com/"))
        .await;
    assert_eq!(state, InjectState::Injected);

    // A canvas probe in the main world must surface on the isolated side
    let page = h.world.take_page();
    let canvas = CanvasState::filled(10, 10, [0, 0, 0, 255]);
    let _ = page.canvas.read_pixels(&canvas);

    let record = timeout(Duration::from_millis(500), seen_rx.recv())
        .await
        .expect("no detection relayed")
        .unwrap();
    assert_eq!(record["category"], "canvas");
    assert_eq!(record["method"], "getImageData");
    assert_eq!(record["url"], "https://shop.example.com/");
    assert_eq!(record["detectionCount"], 1);
}

#[tokio::test]
async fn test_persona_lookup_served_over_bridge() {
    let h = harness("https://shop.example.com/", ShroudConfig::default());

    let host = Arc::clone(&h.host);
    h.isolated.on_request("GET_PERSONA", move |data| {
        let domain = data["domain"].as_str().unwrap_or_default().to_string();
        let os = data["osPreference"].as_str().map(str::to_string);
        let persona = host.persona_for_domain(&domain, os.as_deref())?;
        Ok(serde_json::to_value(persona)?)
    });

    let first = h
        .main
        .request("GET_PERSONA", json!({ "domain": "shop.example.com" }), 1000)
        .await
        .unwrap();
    let second = h
        .main
        .request("GET_PERSONA", json!({ "domain": "shop.example.com" }), 1000)
        .await
        .unwrap();

    // Same domain, same session: identical persona both times
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["userAgent"], second["userAgent"]);
}

#[tokio::test]
async fn test_exhausted_chain_fails_open() {
    /// A world whose script loading never takes effect
    struct InertWorld;
    impl MainWorld for InertWorld {
        fn load_script_resource(&self, _script: &str) -> Result<()> {
            Ok(())
        }
        fn eval_inline(&self, _script: &str) -> Result<()> {
            Ok(())
        }
    }

    let token = SessionToken::mint();
    let (isolated, _main) = Bridge::pair(&token);
    let coordinator = InjectionCoordinator::new(
        isolated,
        Arc::new(StoreHost::new(ShroudConfig::default())),
        Arc::new(InertWorld),
        Arc::new(StaticSource),
    );

    let state = coordinator
        .run(&PageContext::top("https://example.com/"))
        .await;

    // No ACK from any strategy: Failed, nothing thrown, page untouched
    assert_eq!(state, InjectState::Failed);
}

#[tokio::test]
async fn test_fallback_persona_when_catalog_broken() {
    struct BrokenCatalogHost {
        personas: PersonaStore,
    }
    impl PrivilegedHost for BrokenCatalogHost {
        fn settings(&self) -> Result<ShroudConfig> {
            Ok(ShroudConfig::default())
        }
        fn persona_for_domain(&self, domain: &str, os: Option<&str>) -> Result<Persona> {
            Ok(self.personas.get_or_create_for_domain(domain, os))
        }
        fn inject_main_world(&self, _request: InjectRequest) -> Result<()> {
            Err(shroud::Error::storage("unavailable"))
        }
    }

    let token = SessionToken::mint();
    let (isolated, main) = Bridge::pair(&token);
    let world = Arc::new(EngineWorld::new("https://example.com/", main));
    let coordinator = InjectionCoordinator::new(
        isolated,
        Arc::new(BrokenCatalogHost {
            personas: PersonaStore::new(
                Catalog::from_json("not json at all"),
                Arc::new(MemoryStore::new()),
            ),
        }),
        Arc::clone(&world) as Arc<dyn MainWorld>,
        Arc::new(StaticSource),
    );

    let state = coordinator
        .run(&PageContext::top("https://example.com/"))
        .await;
    assert_eq!(state, InjectState::Injected);

    // Engine runs with the single hard-coded fallback persona
    let page = world.take_page();
    let ctx = page.graphics.create_context(GlContextKind::Webgl);
    assert_eq!(
        ctx.get_parameter(GlQuery::Vendor),
        GlValue::Str(fallback_persona().webgl.vendor)
    );
}

#[tokio::test]
async fn test_event_emission_shape() {
    let token = SessionToken::mint();
    let (isolated, main) = Bridge::pair(&token);

    let (seen_tx, mut seen_rx) = mpsc::channel(4);
    isolated.on(DETECTION_EVENT, move |data| {
        let _ = seen_tx.try_send(data);
    });

    main.emit(
        DETECTION_EVENT,
        json!({ "category": "webgl", "severity": "high" }),
    )
    .await
    .unwrap();

    let data = timeout(Duration::from_millis(500), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data["category"], "webgl");
}
