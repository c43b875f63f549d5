use std::sync::Arc;

use glam::Vec3;
use model_viewer::asset::primitive::fire_extinguisher;
use model_viewer::asset::{AssetData, MaterialData, MeshData};
use model_viewer::engine::ResourceKind;
use model_viewer::headless::{
    EngineProbe, HeadlessContainer, HeadlessEngine, ManualLoader, ManualScheduler,
};
use model_viewer::interaction::{PointerButton, MAX_DISTANCE};
use model_viewer::{
    AssetSource, Collaborators, InteractionMode, LoadEvent, ModelViewerSession, PointerInput,
    SessionState, SignalLog, ViewerConfig, ViewerError, ViewerSignal,
};

struct Harness {
    session: ModelViewerSession,
    engine: EngineProbe,
    container: HeadlessContainer,
    scheduler: ManualScheduler,
    loader: ManualLoader,
    signals: SignalLog,
    now: f64,
}

fn harness(config: ViewerConfig) -> Harness {
    harness_with(true, config, "models/a.obj")
}

fn harness_with(supported: bool, config: ViewerConfig, source: &str) -> Harness {
    let engine = HeadlessEngine::new(supported);
    let probe = engine.probe();
    let container = HeadlessContainer::new(640, 480);
    let scheduler = ManualScheduler::new();
    let loader = ManualLoader::new();
    let signals = SignalLog::new();
    let session = ModelViewerSession::new(
        AssetSource::new(source),
        config,
        Collaborators {
            engine: Box::new(engine),
            container: Box::new(container.clone()),
            scheduler: Box::new(scheduler.clone()),
            loader: Box::new(loader.clone()),
            signals: Box::new(signals.clone()),
        },
    )
    .expect("valid config");
    Harness {
        session,
        engine: probe,
        container,
        scheduler,
        loader,
        signals,
        now: 0.0,
    }
}

impl Harness {
    fn complete(&mut self, asset: AssetData) {
        let request = self.loader.last_request().expect("a load was requested");
        self.session.handle_load_event(LoadEvent::Completed {
            id: request.id,
            asset: Arc::new(asset),
        });
    }

    fn fail(&mut self, message: &str) {
        let request = self.loader.last_request().expect("a load was requested");
        self.session.handle_load_event(LoadEvent::Failed {
            id: request.id,
            error: ViewerError::AssetLoad {
                locator: request.source.to_string(),
                message: message.to_string(),
            },
        });
    }

    /// Fires the pending frame callback at `now`. Returns whether it rendered.
    fn frame_at(&mut self, now: f64) -> bool {
        self.now = now;
        let Some(handle) = self.scheduler.take_next() else {
            return false;
        };
        let before = self.engine.renders();
        self.session.on_frame(handle, now);
        self.engine.renders() > before
    }

    fn advance(&mut self, ms: f64) -> bool {
        self.frame_at(self.now + ms)
    }

    /// Ticks every `step` ms for `duration` ms and returns the render times.
    fn run_for(&mut self, duration: f64, step: f64) -> Vec<f64> {
        let end = self.now + duration;
        let mut rendered = Vec::new();
        while self.now + step <= end + 1e-9 {
            if self.advance(step) {
                rendered.push(self.now);
            }
        }
        rendered
    }

    fn yaw(&self) -> f32 {
        self.session.asset().expect("model loaded").transform().yaw
    }

    fn loaded_count(&self) -> usize {
        self.signals
            .count(|s| matches!(s, ViewerSignal::Loaded(_)))
    }
}

fn box_asset(min: Vec3, max: Vec3) -> AssetData {
    let corners = [
        min,
        Vec3::new(max.x, min.y, min.z),
        Vec3::new(max.x, max.y, min.z),
        Vec3::new(min.x, max.y, max.z),
        max,
    ];
    let mut vertices = Vec::new();
    for corner in corners {
        vertices.extend_from_slice(&[corner.x, corner.y, corner.z, 0.0, 0.0, 1.0]);
    }
    AssetData {
        meshes: vec![MeshData {
            name: "box".into(),
            vertices,
            indices: vec![0, 1, 2, 2, 3, 4],
            material: Some(0),
        }],
        materials: vec![MaterialData::default()],
        animations: Vec::new(),
    }
}

fn unit_box() -> AssetData {
    box_asset(Vec3::splat(-1.0), Vec3::splat(1.0))
}

fn still() -> ViewerConfig {
    ViewerConfig {
        auto_rotate: false,
        ..ViewerConfig::default()
    }
}

#[test]
fn unsupported_environment_allocates_nothing() {
    let mut h = harness_with(false, ViewerConfig::default(), "models/a.obj");

    assert_eq!(h.session.state(), SessionState::Unsupported);
    assert_eq!(h.signals.snapshot(), vec![ViewerSignal::Unsupported]);
    assert_eq!(h.engine.surfaces_created(), 0);
    assert_eq!(h.engine.live_resources(), 0);
    assert_eq!(h.container.children(), 0);
    assert_eq!(h.container.listener_count(), 0);
    assert!(h.loader.requests().is_empty());
    assert_eq!(h.scheduler.requested(), 0);

    h.session.dispose();
    assert_eq!(h.session.state(), SessionState::Disposed);
}

#[test]
fn initialization_attaches_surface_and_listeners() {
    let h = harness(ViewerConfig::default());

    assert_eq!(h.session.state(), SessionState::Loading);
    assert_eq!(h.engine.live_surfaces(), 1);
    assert_eq!(h.container.children(), 1);
    assert_eq!(h.engine.live_of_kind(ResourceKind::Light), 3);
    assert!(h.container.has_listener(model_viewer::ListenerKind::Resize));
    assert!(h.container.has_listener(model_viewer::ListenerKind::PointerDown));
    assert_eq!(h.loader.requests().len(), 1);
    assert!(h.session.is_frame_scheduled());
    assert_eq!(
        h.session.status_text().as_deref(),
        Some("Loading 3D model...")
    );
}

#[test]
fn superseded_load_never_reaches_the_scene() {
    let mut h = harness(still());
    let first = h.loader.last_request().unwrap();

    h.session.load(AssetSource::new("models/b.obj"));
    let second = h.loader.last_request().unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(h.loader.cancelled(), vec![first.id]);

    h.session.handle_load_event(LoadEvent::Completed {
        id: second.id,
        asset: Arc::new(unit_box()),
    });
    h.session.handle_load_event(LoadEvent::Completed {
        id: first.id,
        asset: Arc::new(box_asset(Vec3::ZERO, Vec3::splat(8.0))),
    });

    assert_eq!(h.loaded_count(), 1);
    match h.signals.last() {
        Some(ViewerSignal::Loaded(summary)) => {
            assert_eq!(summary.source.as_str(), "models/b.obj")
        }
        other => panic!("unexpected last signal {other:?}"),
    }
    assert_eq!(
        h.session.asset().unwrap().source().as_str(),
        "models/b.obj"
    );
}

#[test]
fn loaded_model_is_centered_and_scaled_to_target_size() {
    let mut h = harness(still());
    h.complete(box_asset(
        Vec3::new(10.0, -4.0, 2.0),
        Vec3::new(30.0, 6.0, 7.0),
    ));

    assert_eq!(h.session.state(), SessionState::Ready);
    let bounds = h.session.asset().unwrap().normalized_bounds();
    assert!(bounds.center().length() < 1e-4);
    assert!((bounds.max_dimension() - 2.0).abs() < 1e-4);
    assert_eq!(h.session.status_text(), None);
}

#[test]
fn target_size_follows_config() {
    let mut h = harness(ViewerConfig {
        target_size: 3.0,
        ..still()
    });
    h.complete(unit_box());
    let bounds = h.session.asset().unwrap().normalized_bounds();
    assert!((bounds.max_dimension() - 3.0).abs() < 1e-4);
}

#[test]
fn dispose_is_idempotent_and_releases_everything() {
    let mut h = harness(ViewerConfig::default());
    h.complete(unit_box());
    h.advance(16.0);
    let stale = h.scheduler.pending()[0];
    assert!(h.engine.live_resources() > 0);

    h.session.dispose();
    h.session.dispose();
    h.session.dispose();

    assert_eq!(
        h.signals.count(|s| matches!(s, ViewerSignal::Disposed)),
        1
    );
    assert!(h.scheduler.pending().is_empty());
    assert!(h.scheduler.cancelled().contains(&stale));
    assert_eq!(h.engine.live_resources(), 0);
    assert_eq!(h.engine.live_surfaces(), 0);
    assert_eq!(h.container.children(), 0);
    assert_eq!(h.container.listener_count(), 0);

    let renders = h.engine.renders();
    h.session.on_frame(stale, 1000.0);
    h.session.handle_load_event(LoadEvent::Completed {
        id: model_viewer::LoadId(99),
        asset: Arc::new(unit_box()),
    });
    assert_eq!(h.engine.renders(), renders);
    assert_eq!(h.loaded_count(), 1);
}

#[test]
fn dropping_a_session_disposes_it() {
    let h = harness(ViewerConfig::default());
    let engine = h.engine.clone();
    let container = h.container.clone();
    let signals = h.signals.clone();
    drop(h);

    assert_eq!(engine.live_surfaces(), 0);
    assert_eq!(container.children(), 0);
    assert_eq!(signals.last(), Some(ViewerSignal::Disposed));
}

#[test]
fn thirty_fps_target_over_five_ms_ticks_does_not_drift() {
    let mut h = harness(ViewerConfig {
        target_frame_rate: 30,
        ..still()
    });
    h.complete(unit_box());

    let rendered = h.run_for(2000.0, 5.0);
    let interval = 1000.0 / 30.0;
    assert!((59..=61).contains(&rendered.len()), "{} frames", rendered.len());
    let origin = rendered[0];
    for (k, at) in rendered.iter().enumerate() {
        let ideal = origin + k as f64 * interval;
        assert!(*at - ideal < 5.0 + 1e-6, "frame {k} at {at} drifted from {ideal}");
        assert!(*at >= ideal - 1e-6);
    }
}

#[test]
fn auto_rotation_starts_only_once_a_model_exists() {
    let mut h = harness(ViewerConfig::default());
    h.run_for(200.0, 16.0);
    assert!(h.engine.renders() > 0);
    assert!(h.engine.last_frame().unwrap().model.is_none());

    h.complete(unit_box());
    assert_eq!(h.yaw(), 0.0);
    h.run_for(1000.0, 16.0);

    let rate = h.session.config().auto_rotate_rate();
    let yaw = h.yaw();
    assert!(yaw > 0.0);
    assert!(yaw <= rate * 1.1 + 1e-4, "yaw {yaw} exceeds one second of spin");
    assert!(h.engine.last_frame().unwrap().model.is_some());
}

#[test]
fn auto_rotation_can_be_turned_off() {
    let mut h = harness(still());
    h.complete(unit_box());
    h.run_for(500.0, 16.0);
    assert_eq!(h.yaw(), 0.0);
}

#[test]
fn drag_rotates_by_sensitivity_per_pixel() {
    let mut h = harness(still());
    h.complete(unit_box());
    let sensitivity = h.session.config().drag_sensitivity;

    h.session.drag_start(100.0, 100.0);
    h.session.drag_move(110.0, 100.0);
    assert!((h.yaw() - 10.0 * sensitivity).abs() < 1e-6);

    h.session.drag_move(110.0, 100.0);
    assert!((h.yaw() - 10.0 * sensitivity).abs() < 1e-6);

    h.session.drag_end();
    h.session.drag_move(300.0, 100.0);
    assert!((h.yaw() - 10.0 * sensitivity).abs() < 1e-6);
    assert!(!h.session.is_dragging());
}

#[test]
fn dragging_pauses_auto_rotation() {
    let mut h = harness(ViewerConfig::default());
    h.complete(unit_box());
    h.advance(16.0);
    h.session.drag_start(0.0, 0.0);
    let yaw = h.yaw();
    h.run_for(300.0, 16.0);
    assert_eq!(h.yaw(), yaw);

    h.session.drag_end();
    h.run_for(300.0, 16.0);
    assert!(h.yaw() > yaw);
}

#[test]
fn hidden_page_renders_at_fifteen_fps_and_resumes_immediately() {
    let mut h = harness(still());
    h.complete(unit_box());
    h.advance(16.0);

    h.session.set_visibility(false);
    let hidden = h.run_for(5000.0, 16.0);
    assert!(
        (70..=80).contains(&hidden.len()),
        "{} frames while hidden",
        hidden.len()
    );

    h.session.set_visibility(true);
    assert!(h.advance(1.0), "first callback after becoming visible renders");
}

#[test]
fn progress_is_reported_once_per_frame() {
    let mut h = harness(still());
    let id = h.loader.last_request().unwrap().id;
    for loaded in [10, 30, 50] {
        h.session.handle_load_event(LoadEvent::Progress {
            id,
            loaded,
            total: Some(100),
        });
    }
    assert_eq!(
        h.signals.count(|s| matches!(s, ViewerSignal::Progress { .. })),
        0
    );

    h.advance(16.0);
    let progress: Vec<_> = h
        .signals
        .snapshot()
        .into_iter()
        .filter(|s| matches!(s, ViewerSignal::Progress { .. }))
        .collect();
    assert_eq!(
        progress,
        vec![ViewerSignal::Progress {
            loaded: 50,
            total: Some(100)
        }]
    );
    assert_eq!(
        h.session.status_text().as_deref(),
        Some("Loading 3D model... 50%")
    );

    h.advance(16.0);
    assert_eq!(
        h.signals.count(|s| matches!(s, ViewerSignal::Progress { .. })),
        1
    );
}

#[test]
fn failed_load_can_be_retried_until_the_budget_runs_out() {
    let mut h = harness(ViewerConfig {
        max_retries: 1,
        ..still()
    });
    h.fail("connection reset");

    assert_eq!(h.session.state(), SessionState::Error);
    assert!(matches!(
        h.signals.last(),
        Some(ViewerSignal::Error { retryable: true, .. })
    ));
    let status = h.session.status_text().unwrap();
    assert!(status.starts_with("Unable to load the 3D model."));
    assert!(status.contains("connection reset"));

    assert!(h.session.retry());
    assert_eq!(h.session.state(), SessionState::Loading);
    assert_eq!(h.loader.requests().len(), 2);
    assert_eq!(h.session.retries_remaining(), 0);

    h.fail("connection reset");
    assert!(matches!(
        h.signals.last(),
        Some(ViewerSignal::Error { retryable: false, .. })
    ));
    assert!(!h.session.retry());
    assert_eq!(h.loader.requests().len(), 2);
}

#[test]
fn retry_after_error_recovers() {
    let mut h = harness(still());
    h.fail("timeout");

    assert!(h.session.retry());
    h.complete(unit_box());
    assert_eq!(h.session.state(), SessionState::Ready);
    assert!(h.session.is_frame_scheduled());
    assert_eq!(h.session.last_error(), None);
}

#[test]
fn empty_source_fails_without_requesting_anything() {
    let h = harness_with(true, ViewerConfig::default(), "   ");
    assert_eq!(h.session.state(), SessionState::Error);
    assert!(h.loader.requests().is_empty());
    assert!(matches!(
        h.signals.last(),
        Some(ViewerSignal::Error { retryable: false, .. })
    ));
}

#[test]
fn invalid_config_is_rejected_before_anything_is_created() {
    let engine = HeadlessEngine::new(true);
    let probe = engine.probe();
    let result = ModelViewerSession::new(
        AssetSource::new("a.obj"),
        ViewerConfig {
            target_frame_rate: 0,
            ..ViewerConfig::default()
        },
        Collaborators {
            engine: Box::new(engine),
            container: Box::new(HeadlessContainer::new(10, 10)),
            scheduler: Box::new(ManualScheduler::new()),
            loader: Box::new(ManualLoader::new()),
            signals: Box::new(SignalLog::new()),
        },
    );
    assert!(matches!(result, Err(ViewerError::InvalidConfig(_))));
    assert_eq!(probe.surfaces_created(), 0);
}

#[test]
fn replacing_the_model_releases_the_previous_one() {
    let mut h = harness(still());
    h.complete(fire_extinguisher(0xff0000));
    let first_geometry = h.engine.live_of_kind(ResourceKind::Geometry);
    assert!(first_geometry > 1);

    h.session.load(AssetSource::new("models/b.obj"));
    h.complete(unit_box());

    assert_eq!(h.engine.live_of_kind(ResourceKind::Geometry), 1);
    assert_eq!(h.engine.live_of_kind(ResourceKind::Mixer), 0);
    assert_eq!(h.engine.live_of_kind(ResourceKind::Light), 3);
    assert_eq!(h.loaded_count(), 2);
}

#[test]
fn embedded_animations_advance_with_clamped_deltas() {
    let mut h = harness(still());
    h.complete(fire_extinguisher(0x00aa00));
    assert!(h.engine.live_of_kind(ResourceKind::Mixer) > 0);

    h.advance(16.0);
    h.advance(5000.0);
    for time in h.engine.mixer_times() {
        assert!(time > 0.0);
        assert!(time <= 0.1 + 0.016 + 1e-4, "mixer advanced {time}s");
    }
}

#[test]
fn animations_stay_idle_without_autoplay() {
    let mut h = harness(ViewerConfig {
        auto_play_animations: false,
        ..still()
    });
    h.complete(fire_extinguisher(0xff0000));
    assert_eq!(h.engine.live_of_kind(ResourceKind::Mixer), 0);
}

#[test]
fn resize_is_debounced_and_coalesced() {
    let mut h = harness(still());
    h.complete(unit_box());
    h.frame_at(0.0);

    h.session.resize(700, 500);
    h.session.resize(800, 600);
    h.frame_at(16.0);
    h.frame_at(100.0);
    assert_eq!(h.session.surface_size().width, 640);

    h.frame_at(120.0);
    assert_eq!(h.session.surface_size().width, 800);
    assert_eq!(h.engine.surface_sizes()[0].height, 600);
    assert!((h.session.camera().aspect - 800.0 / 600.0).abs() < 1e-6);
}

#[test]
fn resize_without_a_pending_frame_applies_immediately() {
    let mut h = harness(still());
    h.fail("offline");
    h.advance(16.0);
    assert!(!h.session.is_frame_scheduled());

    h.session.resize(320, 200);
    assert_eq!(h.session.surface_size().width, 320);
    assert_eq!(h.engine.surface_sizes()[0].height, 200);
}

#[test]
fn resize_queued_behind_the_last_frame_after_an_error_still_applies() {
    let mut h = harness(still());
    h.fail("offline");
    assert!(h.session.is_frame_scheduled());

    h.session.resize(320, 200);
    assert_ne!(h.session.surface_size().width, 320);
    h.advance(16.0);

    assert!(!h.session.is_frame_scheduled());
    assert_eq!(h.session.surface_size().width, 320);
    assert_eq!(h.session.surface_size().height, 200);
    assert_eq!(h.engine.surface_sizes()[0].width, 320);
}

#[test]
fn models_with_non_finite_coordinates_are_rejected() {
    let mut h = harness(still());
    h.complete(box_asset(Vec3::splat(-1.0), Vec3::new(1.0, f32::INFINITY, 1.0)));

    assert_eq!(h.session.state(), SessionState::Error);
    assert_eq!(h.loaded_count(), 0);
    assert!(h.session.asset().is_none());
}

#[test]
fn slow_frames_degrade_shadows_once_and_never_recover() {
    let mut h = harness(still());
    assert_eq!(h.engine.shadow_settings().map(|s| s.map_size), Some(1024));
    h.complete(unit_box());

    h.run_for(2100.0, 50.0);
    let settings = h.engine.shadow_settings().unwrap();
    assert!(settings.enabled);
    assert_eq!(settings.map_size, 512);

    h.run_for(2000.0, 50.0);
    assert!(!h.engine.shadow_settings().unwrap().enabled);

    h.run_for(3000.0, 1000.0 / 60.0);
    assert!(!h.engine.shadow_settings().unwrap().enabled);
    assert!(!h.session.shadow_settings().enabled);
}

#[test]
fn reset_restores_model_and_camera() {
    let mut h = harness(still());
    h.complete(unit_box());
    let camera = *h.session.camera();

    h.session.drag_start(0.0, 0.0);
    h.session.drag_move(40.0, 25.0);
    h.session.drag_end();
    h.session.zoom(120.0);
    assert_ne!(h.yaw(), 0.0);
    assert_ne!(*h.session.camera(), camera);

    h.session.reset();
    let asset = h.session.asset().unwrap();
    assert_eq!(asset.transform(), asset.initial_transform());
    assert_eq!(*h.session.camera(), camera);
}

#[test]
fn disabled_interaction_ignores_pointer_input() {
    let mut h = harness(ViewerConfig {
        interaction: InteractionMode::Disabled,
        ..still()
    });
    h.complete(unit_box());
    assert_eq!(h.container.listener_count(), 2);

    h.session.handle_pointer(PointerInput::Down {
        x: 0.0,
        y: 0.0,
        button: PointerButton::Primary,
    });
    h.session.handle_pointer(PointerInput::Move { x: 50.0, y: 0.0 });
    assert!(!h.session.is_dragging());
    assert_eq!(h.yaw(), 0.0);
}

#[test]
fn second_touch_ends_the_drag() {
    let mut h = harness(still());
    h.complete(unit_box());

    h.session
        .handle_pointer(PointerInput::TouchStart { x: 0.0, y: 0.0, touches: 1 });
    h.session
        .handle_pointer(PointerInput::TouchMove { x: 5.0, y: 0.0, touches: 1 });
    let yaw = h.yaw();
    assert!(yaw > 0.0);

    h.session
        .handle_pointer(PointerInput::TouchStart { x: 9.0, y: 9.0, touches: 2 });
    h.session
        .handle_pointer(PointerInput::TouchMove { x: 90.0, y: 9.0, touches: 2 });
    assert!(!h.session.is_dragging());
    assert_eq!(h.yaw(), yaw);
}

#[test]
fn orbit_mode_moves_the_camera_not_the_model() {
    let mut h = harness(ViewerConfig {
        interaction: InteractionMode::Orbit,
        ..still()
    });
    h.complete(unit_box());
    let start = h.session.camera().position;

    h.session.drag_start(100.0, 100.0);
    h.session.drag_move(160.0, 100.0);
    h.session.drag_end();
    h.run_for(500.0, 16.0);

    assert_eq!(h.yaw(), 0.0);
    assert!(h.session.camera().position.distance(start) > 1e-3);

    for _ in 0..100 {
        h.session.zoom(100.0);
    }
    h.advance(16.0);
    assert!(h.session.camera().distance() <= MAX_DISTANCE + 1e-3);
}
