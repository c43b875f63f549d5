//! The viewer session: one container, one render surface, one model.

use std::fmt;

use glam::Vec2;
use log::{debug, info, warn};

use crate::asset::{AssetSource, LoadedAsset};
use crate::camera::Camera;
use crate::config::{InteractionMode, ViewerConfig};
use crate::engine::{
    FrameState, GraphicsEngine, LightRig, OwnedResources, ShadowSettings, SurfaceId, SurfaceSize,
};
use crate::error::ViewerError;
use crate::frame::{clamp_delta, FrameGovernor};
use crate::host::{ChildNode, FrameHandle, FrameScheduler, HostContainer, ListenerId, ListenerKind};
use crate::interaction::{
    zoomed_distance, DragController, DragGesture, OrbitController, OrbitGates, PointerInput,
};
use crate::loader::{AssetLoader, LoadEvent, LoadId, LoadRequest};
use crate::performance::{AdaptiveQuality, PerformanceSample};
use crate::signal::{SignalSink, ViewerSignal};

/// Quiet period before a resize reaches the render surface.
pub const RESIZE_DEBOUNCE_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Loading,
    Ready,
    Error,
    Unsupported,
    Disposed,
}

impl SessionState {
    /// States in which the render loop keeps itself scheduled.
    fn runs_loop(self) -> bool {
        matches!(self, SessionState::Loading | SessionState::Ready)
    }

    fn accepts_input(self) -> bool {
        matches!(
            self,
            SessionState::Loading | SessionState::Ready | SessionState::Error
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Error => "error",
            SessionState::Unsupported => "unsupported",
            SessionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Everything a session borrows from its host, handed over at construction
/// and dropped on dispose.
pub struct Collaborators {
    pub engine: Box<dyn GraphicsEngine>,
    pub container: Box<dyn HostContainer>,
    pub scheduler: Box<dyn FrameScheduler>,
    pub loader: Box<dyn AssetLoader>,
    pub signals: Box<dyn SignalSink>,
}

enum Interaction {
    Drag(DragController),
    Orbit(OrbitController),
    Disabled,
}

impl Interaction {
    fn is_dragging(&self) -> bool {
        match self {
            Interaction::Drag(drag) => drag.is_dragging(),
            Interaction::Orbit(orbit) => orbit.is_dragging(),
            Interaction::Disabled => false,
        }
    }
}

struct PendingResize {
    size: SurfaceSize,
    /// Time of the first frame callback after the latest resize request.
    first_seen: Option<f64>,
}

/// Lifecycle owner of one embedded 3D viewer.
///
/// The host drives it from a single thread: it delivers frame callbacks,
/// load events, resizes, visibility changes and pointer input by calling the
/// matching methods, in the order they occur. Failures are reported through
/// [`ViewerSignal`]s; no method panics on a torn-down session.
pub struct ModelViewerSession {
    config: ViewerConfig,
    state: SessionState,
    collaborators: Option<Collaborators>,
    surface: Option<SurfaceId>,
    surface_size: SurfaceSize,
    node: Option<ChildNode>,
    lights: OwnedResources,
    listeners: Vec<(ListenerId, ListenerKind)>,
    source: Option<AssetSource>,
    asset: Option<LoadedAsset>,
    camera: Camera,
    initial_camera: Camera,
    interaction: Interaction,
    governor: FrameGovernor,
    performance: PerformanceSample,
    quality: AdaptiveQuality,
    pending_frame: Option<FrameHandle>,
    pending_resize: Option<PendingResize>,
    next_load: u64,
    current_load: Option<LoadId>,
    pending_progress: Option<(u64, Option<u64>)>,
    progress: Option<(u64, Option<u64>)>,
    last_error: Option<String>,
    retries_used: u32,
    frames_rendered: u64,
}

impl ModelViewerSession {
    /// Creates a session and starts loading `source`.
    ///
    /// Without hardware acceleration the session goes straight to
    /// [`SessionState::Unsupported`] and signals the host without allocating
    /// anything. Only an invalid configuration is returned as an error.
    pub fn new(
        source: AssetSource,
        config: ViewerConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ViewerError> {
        config.validate()?;
        let shadows = ShadowSettings {
            enabled: config.shadows,
            map_size: config.shadow_map_size,
        };
        let size = collaborators.container.client_size();
        let camera = Camera::new(config.field_of_view, size.aspect(), config.camera_distance);
        let mut session = Self {
            state: SessionState::Uninitialized,
            collaborators: Some(collaborators),
            surface: None,
            surface_size: size,
            node: None,
            lights: OwnedResources::new(),
            listeners: Vec::new(),
            source: None,
            asset: None,
            camera,
            initial_camera: camera,
            interaction: Interaction::Disabled,
            governor: FrameGovernor::new(config.target_frame_rate),
            performance: PerformanceSample::new(),
            quality: AdaptiveQuality::new(shadows),
            pending_frame: None,
            pending_resize: None,
            next_load: 0,
            current_load: None,
            pending_progress: None,
            progress: None,
            last_error: None,
            retries_used: 0,
            frames_rendered: 0,
            config,
        };
        session.initialize();
        if session.state == SessionState::Initializing {
            session.load(source);
        }
        Ok(session)
    }

    fn initialize(&mut self) {
        self.state = SessionState::Initializing;
        let Some(c) = self.collaborators.as_mut() else {
            return;
        };
        if !c.engine.supports_hardware_acceleration() {
            info!("hardware-accelerated rendering unavailable");
            self.state = SessionState::Unsupported;
            c.signals.emit(ViewerSignal::Unsupported);
            return;
        }

        let surface = match c.engine.create_surface(self.surface_size) {
            Ok(surface) => surface,
            Err(err) => {
                warn!("failed to create render surface: {err}");
                self.state = SessionState::Error;
                self.retries_used = self.config.max_retries;
                self.last_error = Some(err.to_string());
                c.signals.emit(ViewerSignal::Error {
                    description: err.to_string(),
                    retryable: false,
                });
                return;
            }
        };
        self.surface = Some(surface);
        self.node = Some(c.container.attach_surface(surface));

        match c.engine.install_lights(&LightRig::studio()) {
            Ok(handles) => self.lights.extend(handles),
            Err(err) => warn!("scene will render unlit: {err}"),
        }
        c.engine.apply_shadow_settings(self.quality.settings());

        let mut kinds = vec![ListenerKind::Resize, ListenerKind::VisibilityChange];
        self.interaction = match self.config.interaction {
            InteractionMode::CustomDrag => {
                Interaction::Drag(DragController::new(self.config.drag_sensitivity))
            }
            InteractionMode::Orbit => {
                let gates = OrbitGates {
                    rotate: self.config.enable_rotate,
                    zoom: self.config.enable_zoom,
                    pan: self.config.enable_pan,
                };
                let rate = if self.config.auto_rotate {
                    self.config.auto_rotate_rate()
                } else {
                    0.0
                };
                Interaction::Orbit(OrbitController::new(&self.camera, gates, rate))
            }
            InteractionMode::Disabled => Interaction::Disabled,
        };
        if !matches!(self.interaction, Interaction::Disabled) {
            kinds.extend(ListenerKind::POINTER);
        }
        for kind in kinds {
            let id = c.container.add_listener(kind);
            self.listeners.push((id, kind));
        }
        info!(
            "viewer initialized at {}x{}",
            self.surface_size.width, self.surface_size.height
        );
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn source(&self) -> Option<&AssetSource> {
        self.source.as_ref()
    }

    pub fn asset(&self) -> Option<&LoadedAsset> {
        self.asset.as_ref()
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn shadow_settings(&self) -> ShadowSettings {
        self.quality.settings()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn retries_remaining(&self) -> u32 {
        self.config.max_retries.saturating_sub(self.retries_used)
    }

    pub fn is_frame_scheduled(&self) -> bool {
        self.pending_frame.is_some()
    }

    pub fn is_dragging(&self) -> bool {
        self.interaction.is_dragging()
    }

    pub fn surface_size(&self) -> SurfaceSize {
        self.surface_size
    }

    /// Overlay text the host shows over the canvas, if any.
    pub fn status_text(&self) -> Option<String> {
        match self.state {
            SessionState::Loading => Some(match self.progress {
                Some((loaded, Some(total))) if total > 0 => {
                    let percent = (loaded.min(total) * 100) / total;
                    format!("{} {percent}%", self.config.loading_label)
                }
                _ => self.config.loading_label.clone(),
            }),
            SessionState::Error => Some(match &self.last_error {
                Some(description) => format!("{} {description}", self.config.error_label),
                None => self.config.error_label.clone(),
            }),
            _ => None,
        }
    }

    fn is_active(&self) -> bool {
        !matches!(
            self.state,
            SessionState::Disposed | SessionState::Unsupported
        ) && self.surface.is_some()
    }

    fn emit(&mut self, signal: ViewerSignal) {
        if let Some(c) = self.collaborators.as_mut() {
            c.signals.emit(signal);
        }
    }

    fn ensure_frame_scheduled(&mut self) {
        if self.pending_frame.is_some() || !self.state.runs_loop() {
            return;
        }
        if let Some(c) = self.collaborators.as_mut() {
            self.pending_frame = Some(c.scheduler.request_frame());
        }
    }

    /// Loads a new source, replacing the current model once it arrives.
    /// The retry budget starts over.
    pub fn load(&mut self, source: AssetSource) {
        if !self.is_active() {
            warn!("ignoring load of {source} in {} state", self.state);
            return;
        }
        if source.is_empty() {
            self.cancel_current_load();
            self.source = None;
            self.retries_used = self.config.max_retries;
            self.fail(ViewerError::EmptySource);
            return;
        }
        self.source = Some(source);
        self.retries_used = 0;
        self.start_load();
    }

    /// Loads the current source again.
    pub fn reload(&mut self) {
        match self.source.clone() {
            Some(source) if self.is_active() => self.load(source),
            _ => warn!("nothing to reload in {} state", self.state),
        }
    }

    /// Re-requests the failed source. Only valid in the error state while
    /// the retry budget lasts; returns whether a load was started.
    pub fn retry(&mut self) -> bool {
        if self.state != SessionState::Error || self.source.is_none() {
            warn!("retry is only possible after a failed load");
            return false;
        }
        if self.retries_used >= self.config.max_retries {
            warn!("retry budget of {} exhausted", self.config.max_retries);
            return false;
        }
        self.retries_used += 1;
        info!(
            "retrying load ({} of {})",
            self.retries_used, self.config.max_retries
        );
        self.start_load();
        true
    }

    fn cancel_current_load(&mut self) {
        if let Some(id) = self.current_load.take() {
            if let Some(c) = self.collaborators.as_mut() {
                c.loader.cancel(id);
            }
        }
        self.pending_progress = None;
        self.progress = None;
    }

    fn start_load(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };
        self.cancel_current_load();
        self.next_load += 1;
        let id = LoadId(self.next_load);
        self.current_load = Some(id);
        self.last_error = None;
        self.state = SessionState::Loading;
        info!("{id}: loading {source}");
        if let Some(c) = self.collaborators.as_mut() {
            c.loader.load(LoadRequest { id, source });
        }
        self.ensure_frame_scheduled();
    }

    /// Applies an event reported by the loader. Events from superseded or
    /// cancelled loads are dropped.
    pub fn handle_load_event(&mut self, event: LoadEvent) {
        if self.state == SessionState::Disposed {
            debug!("{} arrived after dispose", event.id());
            return;
        }
        if self.current_load != Some(event.id()) {
            debug!("discarding event of stale {}", event.id());
            return;
        }
        match event {
            LoadEvent::Progress { loaded, total, .. } => {
                self.pending_progress = Some((loaded, total));
                self.progress = Some((loaded, total));
            }
            LoadEvent::Completed { id, asset } => {
                self.current_load = None;
                self.pending_progress = None;
                self.install_asset(id, asset);
            }
            LoadEvent::Failed { id, error } => {
                self.current_load = None;
                self.pending_progress = None;
                warn!("{id} failed: {error}");
                self.fail(error);
            }
        }
    }

    fn install_asset(&mut self, id: LoadId, data: std::sync::Arc<crate::asset::AssetData>) {
        let Some(source) = self.source.clone() else {
            return;
        };
        let Some(c) = self.collaborators.as_mut() else {
            return;
        };
        if let Some(previous) = self.asset.take() {
            debug!("disposing {} before replacing it", previous.source());
            previous.dispose(c.engine.as_mut());
        }
        let built = LoadedAsset::build(
            source,
            data,
            self.config.target_size,
            self.config.auto_play_animations,
            c.engine.as_mut(),
        );
        match built {
            Ok(asset) => {
                let summary = asset.summary();
                info!(
                    "{id}: loaded {} ({} meshes, {} vertices)",
                    summary.source, summary.mesh_count, summary.vertex_count
                );
                self.asset = Some(asset);
                self.state = SessionState::Ready;
                self.progress = None;
                self.performance.discard_window();
                self.governor.force_next();
                c.signals.emit(ViewerSignal::Loaded(summary));
                self.ensure_frame_scheduled();
            }
            Err(err) => self.fail(err),
        }
    }

    fn fail(&mut self, error: ViewerError) {
        let description = error.to_string();
        let retryable = error.is_retryable() && self.retries_used < self.config.max_retries;
        self.state = SessionState::Error;
        self.progress = None;
        self.last_error = Some(description.clone());
        self.emit(ViewerSignal::Error {
            description,
            retryable,
        });
    }

    /// Frame callback for `handle`, fired by the host's scheduler at `now`
    /// milliseconds. Callbacks other than the one currently scheduled are
    /// ignored, which also covers callbacks that fire after dispose.
    pub fn on_frame(&mut self, handle: FrameHandle, now: f64) {
        if self.pending_frame != Some(handle) || self.state == SessionState::Disposed {
            debug!("skipping stale frame callback {}", handle.0);
            return;
        }
        self.pending_frame = None;
        self.ensure_frame_scheduled();

        if let Some((loaded, total)) = self.pending_progress.take() {
            self.emit(ViewerSignal::Progress { loaded, total });
        }
        // Without a loop there is no later frame to flush a debounced resize.
        let immediate = !self.state.runs_loop();
        self.apply_pending_resize(now, immediate);

        let Some(elapsed) = self.governor.tick(now) else {
            return;
        };
        self.render_frame(elapsed, now);
    }

    fn render_frame(&mut self, elapsed_ms: f64, now: f64) {
        let (Some(c), Some(surface)) = (self.collaborators.as_mut(), self.surface) else {
            return;
        };
        let delta = clamp_delta(elapsed_ms);
        let spin = if self.config.auto_rotate && self.asset.is_some() {
            delta
        } else {
            0.0
        };

        match &mut self.interaction {
            Interaction::Orbit(orbit) => orbit.update(spin, &mut self.camera),
            interaction => {
                if let Some(asset) = self.asset.as_mut() {
                    if spin > 0.0 && !interaction.is_dragging() {
                        asset.transform_mut().yaw += self.config.auto_rotate_rate() * spin;
                    }
                }
            }
        }

        if let Some(asset) = &self.asset {
            for mixer in asset.mixers() {
                c.engine.advance_mixer(mixer, delta);
            }
        }

        self.performance.record_frame(elapsed_ms);
        if self.state == SessionState::Ready {
            if let Some(fps) = self.performance.take_window(now) {
                if let Some(settings) = self.quality.evaluate(fps, self.governor.effective_rate()) {
                    c.engine.apply_shadow_settings(settings);
                }
            }
        }

        let frame = FrameState {
            view_proj: self.camera.view_proj(),
            camera_position: self.camera.position,
            model: self.asset.as_ref().map(|a| a.transform().model_matrix()),
            clear_color: self.config.clear_color(),
        };
        match c.engine.render(surface, &frame) {
            Ok(()) => self.frames_rendered += 1,
            Err(err) => warn!("render failed: {err}"),
        }
    }

    /// Records a new container size. Successive calls are coalesced and the
    /// surface is resized once they stop for [`RESIZE_DEBOUNCE_MS`].
    pub fn resize(&mut self, width: u32, height: u32) {
        if !self.is_active() {
            return;
        }
        self.pending_resize = Some(PendingResize {
            size: SurfaceSize::new(width, height),
            first_seen: None,
        });
        if self.pending_frame.is_none() {
            self.apply_pending_resize(0.0, true);
        }
    }

    fn apply_pending_resize(&mut self, now: f64, immediate: bool) {
        let Some(pending) = self.pending_resize.as_mut() else {
            return;
        };
        if !immediate {
            let first_seen = *pending.first_seen.get_or_insert(now);
            if now - first_seen < RESIZE_DEBOUNCE_MS {
                return;
            }
        }
        let size = pending.size;
        self.pending_resize = None;
        if size == self.surface_size {
            return;
        }
        let (Some(c), Some(surface)) = (self.collaborators.as_mut(), self.surface) else {
            return;
        };
        debug!("resizing surface to {}x{}", size.width, size.height);
        c.engine.resize_surface(surface, size);
        self.surface_size = size;
        self.camera.set_aspect(size.aspect());
        self.initial_camera.set_aspect(size.aspect());
        self.governor.force_next();
    }

    /// Throttles the loop while hidden; showing the page again forces one
    /// immediate render at the configured rate.
    pub fn set_visibility(&mut self, visible: bool) {
        if !self.is_active() || self.governor.is_visible() == visible {
            return;
        }
        debug!("page {}", if visible { "visible" } else { "hidden" });
        self.governor.set_visible(visible);
        self.performance.discard_window();
        if visible {
            self.ensure_frame_scheduled();
        }
    }

    /// Begins a rotate drag at container coordinates.
    pub fn drag_start(&mut self, x: f32, y: f32) {
        self.gesture_start(DragGesture::Rotate, x, y);
    }

    pub fn drag_move(&mut self, x: f32, y: f32) {
        if !self.state.accepts_input() {
            return;
        }
        let position = Vec2::new(x, y);
        match &mut self.interaction {
            Interaction::Drag(drag) => match self.asset.as_mut() {
                Some(asset) => {
                    drag.drag_to(position, asset.transform_mut());
                }
                None => drag.track(position),
            },
            Interaction::Orbit(orbit) => {
                orbit.drag_to(position, self.surface_size);
            }
            Interaction::Disabled => {}
        }
    }

    pub fn drag_end(&mut self) {
        match &mut self.interaction {
            Interaction::Drag(drag) => drag.end(),
            Interaction::Orbit(orbit) => orbit.end(),
            Interaction::Disabled => {}
        }
    }

    fn gesture_start(&mut self, gesture: DragGesture, x: f32, y: f32) {
        if !self.state.accepts_input() {
            return;
        }
        let allowed = match gesture {
            DragGesture::Rotate => self.config.enable_rotate,
            DragGesture::Pan => self.config.enable_pan,
        };
        if !allowed {
            return;
        }
        let position = Vec2::new(x, y);
        match &mut self.interaction {
            Interaction::Drag(drag) => drag.start(gesture, position),
            Interaction::Orbit(orbit) => orbit.start(gesture, position),
            Interaction::Disabled => {}
        }
    }

    /// Wheel zoom; positive deltas move the camera away.
    pub fn zoom(&mut self, delta_y: f32) {
        if !self.state.accepts_input() || !self.config.enable_zoom {
            return;
        }
        match &mut self.interaction {
            Interaction::Drag(_) => {
                let distance = zoomed_distance(self.camera.distance(), delta_y);
                self.camera.set_distance(distance);
            }
            Interaction::Orbit(orbit) => {
                orbit.zoom(delta_y);
            }
            Interaction::Disabled => {}
        }
    }

    /// Pans by a pixel delta: the model in drag mode, the orbit target in orbit mode.
    pub fn pan(&mut self, dx: f32, dy: f32) {
        if !self.state.accepts_input() || !self.config.enable_pan {
            return;
        }
        let delta = Vec2::new(dx, dy);
        match &mut self.interaction {
            Interaction::Drag(drag) => {
                if let Some(asset) = self.asset.as_mut() {
                    drag.apply(DragGesture::Pan, delta, asset.transform_mut());
                }
            }
            Interaction::Orbit(orbit) => orbit.apply(DragGesture::Pan, delta, self.surface_size),
            Interaction::Disabled => {}
        }
    }

    /// Routes raw host input. Input from listeners the session did not
    /// register is ignored, as are multi-touch gestures.
    pub fn handle_pointer(&mut self, input: PointerInput) {
        let kind = input.listener_kind();
        if !self.listeners.iter().any(|(_, registered)| *registered == kind) {
            return;
        }
        match input {
            PointerInput::Down { x, y, button } => {
                self.gesture_start(DragGesture::for_button(button), x, y)
            }
            PointerInput::Move { x, y } => self.drag_move(x, y),
            PointerInput::Up => self.drag_end(),
            PointerInput::Wheel { delta_y } => self.zoom(delta_y),
            PointerInput::TouchStart { x, y, touches: 1 } => self.drag_start(x, y),
            PointerInput::TouchStart { .. } => self.drag_end(),
            PointerInput::TouchMove { x, y, touches: 1 } => self.drag_move(x, y),
            PointerInput::TouchMove { .. } => {}
            PointerInput::TouchEnd { .. } => self.drag_end(),
        }
    }

    /// Restores the camera and the model to their post-load placement.
    pub fn reset(&mut self) {
        if !self.is_active() {
            return;
        }
        if let Some(asset) = self.asset.as_mut() {
            asset.reset_transform();
        }
        self.camera = self.initial_camera;
        match &mut self.interaction {
            Interaction::Drag(drag) => drag.end(),
            Interaction::Orbit(orbit) => orbit.reset(&mut self.camera),
            Interaction::Disabled => {}
        }
        self.governor.force_next();
    }

    /// Tears everything down. Safe in any state; later calls do nothing.
    pub fn dispose(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        let Some(mut c) = self.collaborators.take() else {
            self.state = SessionState::Disposed;
            return;
        };
        if let Some(handle) = self.pending_frame.take() {
            c.scheduler.cancel_frame(handle);
        }
        if let Some(id) = self.current_load.take() {
            c.loader.cancel(id);
        }
        for (id, _) in self.listeners.drain(..) {
            c.container.remove_listener(id);
        }
        if let Some(asset) = self.asset.take() {
            asset.dispose(c.engine.as_mut());
        }
        self.lights.release_all(c.engine.as_mut());
        if let Some(node) = self.node.take() {
            c.container.detach(node);
        }
        if let Some(surface) = self.surface.take() {
            c.engine.dispose_surface(surface);
        }
        self.pending_resize = None;
        self.pending_progress = None;
        self.progress = None;
        self.interaction = Interaction::Disabled;
        self.state = SessionState::Disposed;
        info!("viewer disposed");
        c.signals.emit(ViewerSignal::Disposed);
    }
}

impl Drop for ModelViewerSession {
    fn drop(&mut self) {
        if self.state != SessionState::Disposed {
            debug!("session dropped without dispose; disposing now");
            self.dispose();
        }
    }
}
