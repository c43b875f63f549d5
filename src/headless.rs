//! In-memory collaborators for running a session without a window or GPU.
//!
//! Used by the `--summary-only` CLI mode and by tests. Each collaborator
//! hands out a clonable view of its state so callers can inspect what the
//! session did after giving the collaborator away.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::asset::{AnimationClip, AssetData};
use crate::engine::{
    FrameState, GraphicsEngine, LightRig, ResourceHandle, ResourceKind, ShadowSettings,
    SurfaceId, SurfaceSize,
};
use crate::error::ViewerError;
use crate::host::{ChildNode, FrameHandle, FrameScheduler, HostContainer, ListenerId, ListenerKind};
use crate::loader::{AssetLoader, LoadId, LoadRequest};

#[derive(Debug, Default)]
struct EngineState {
    next_id: u64,
    surfaces_created: usize,
    surfaces: HashMap<SurfaceId, SurfaceSize>,
    live: HashSet<ResourceHandle>,
    released: Vec<ResourceHandle>,
    mixer_clock: HashMap<ResourceHandle, f32>,
    fail_next_upload: Option<String>,
    shadow_settings: Option<ShadowSettings>,
    renders: usize,
    last_frame: Option<FrameState>,
}

impl EngineState {
    fn allocate(&mut self, kind: ResourceKind) -> ResourceHandle {
        self.next_id += 1;
        let handle = ResourceHandle::new(kind, self.next_id);
        self.live.insert(handle);
        handle
    }
}

/// Graphics engine that records calls instead of drawing.
#[derive(Debug)]
pub struct HeadlessEngine {
    supported: bool,
    state: Arc<Mutex<EngineState>>,
}

impl HeadlessEngine {
    /// `supported` decides what the hardware probe reports.
    pub fn new(supported: bool) -> Self {
        Self {
            supported,
            state: Arc::default(),
        }
    }

    pub fn probe(&self) -> EngineProbe {
        EngineProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl GraphicsEngine for HeadlessEngine {
    fn supports_hardware_acceleration(&self) -> bool {
        self.supported
    }

    fn create_surface(&mut self, size: SurfaceSize) -> Result<SurfaceId, ViewerError> {
        if !self.supported {
            return Err(ViewerError::EnvironmentUnsupported);
        }
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = SurfaceId(state.next_id);
        state.surfaces_created += 1;
        state.surfaces.insert(id, size);
        Ok(id)
    }

    fn resize_surface(&mut self, surface: SurfaceId, size: SurfaceSize) {
        if let Some(current) = self.state.lock().surfaces.get_mut(&surface) {
            *current = size;
        }
    }

    fn dispose_surface(&mut self, surface: SurfaceId) {
        self.state.lock().surfaces.remove(&surface);
    }

    fn install_lights(&mut self, rig: &LightRig) -> Result<Vec<ResourceHandle>, ViewerError> {
        let mut state = self.state.lock();
        let count = if rig.fill.intensity > 0.0 { 3 } else { 2 };
        Ok((0..count)
            .map(|_| state.allocate(ResourceKind::Light))
            .collect())
    }

    fn upload_asset(&mut self, asset: &AssetData) -> Result<Vec<ResourceHandle>, ViewerError> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next_upload.take() {
            return Err(ViewerError::Engine(message));
        }
        let mut handles = Vec::new();
        for _ in &asset.meshes {
            handles.push(state.allocate(ResourceKind::Geometry));
        }
        for _ in &asset.materials {
            handles.push(state.allocate(ResourceKind::Material));
        }
        Ok(handles)
    }

    fn create_mixer(&mut self, clip: &AnimationClip) -> Result<ResourceHandle, ViewerError> {
        let mut state = self.state.lock();
        let handle = state.allocate(ResourceKind::Mixer);
        state.mixer_clock.insert(handle, 0.0);
        debug!("headless mixer {} for clip `{}`", handle.id, clip.name);
        Ok(handle)
    }

    fn advance_mixer(&mut self, mixer: ResourceHandle, delta_seconds: f32) {
        if let Some(clock) = self.state.lock().mixer_clock.get_mut(&mixer) {
            *clock += delta_seconds;
        }
    }

    fn apply_shadow_settings(&mut self, settings: ShadowSettings) {
        self.state.lock().shadow_settings = Some(settings);
    }

    fn release(&mut self, resource: ResourceHandle) {
        let mut state = self.state.lock();
        state.live.remove(&resource);
        state.mixer_clock.remove(&resource);
        state.released.push(resource);
    }

    fn render(&mut self, surface: SurfaceId, frame: &FrameState) -> Result<(), ViewerError> {
        let mut state = self.state.lock();
        if !state.surfaces.contains_key(&surface) {
            return Err(ViewerError::engine(format!(
                "surface {} does not exist",
                surface.0
            )));
        }
        state.renders += 1;
        state.last_frame = Some(*frame);
        Ok(())
    }
}

/// Read side of a [`HeadlessEngine`].
#[derive(Debug, Clone)]
pub struct EngineProbe {
    state: Arc<Mutex<EngineState>>,
}

impl EngineProbe {
    pub fn surfaces_created(&self) -> usize {
        self.state.lock().surfaces_created
    }

    pub fn live_surfaces(&self) -> usize {
        self.state.lock().surfaces.len()
    }

    pub fn surface_sizes(&self) -> Vec<SurfaceSize> {
        self.state.lock().surfaces.values().copied().collect()
    }

    pub fn live_resources(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_of_kind(&self, kind: ResourceKind) -> usize {
        self.state
            .lock()
            .live
            .iter()
            .filter(|handle| handle.kind == kind)
            .count()
    }

    pub fn released(&self) -> Vec<ResourceHandle> {
        self.state.lock().released.clone()
    }

    /// Seconds each live mixer has been advanced.
    pub fn mixer_times(&self) -> Vec<f32> {
        self.state.lock().mixer_clock.values().copied().collect()
    }

    pub fn fail_next_upload(&self, message: &str) {
        self.state.lock().fail_next_upload = Some(message.to_string());
    }

    pub fn shadow_settings(&self) -> Option<ShadowSettings> {
        self.state.lock().shadow_settings
    }

    pub fn renders(&self) -> usize {
        self.state.lock().renders
    }

    pub fn last_frame(&self) -> Option<FrameState> {
        self.state.lock().last_frame
    }
}

#[derive(Debug)]
struct ContainerState {
    size: SurfaceSize,
    next_id: u64,
    children: Vec<ChildNode>,
    listeners: HashMap<ListenerId, ListenerKind>,
}

/// Host element stand-in with a fixed, settable client size.
#[derive(Debug, Clone)]
pub struct HeadlessContainer {
    state: Arc<Mutex<ContainerState>>,
}

impl HeadlessContainer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(ContainerState {
                size: SurfaceSize::new(width, height),
                next_id: 0,
                children: Vec::new(),
                listeners: HashMap::new(),
            })),
        }
    }

    pub fn set_size(&self, width: u32, height: u32) {
        self.state.lock().size = SurfaceSize::new(width, height);
    }

    pub fn children(&self) -> usize {
        self.state.lock().children.len()
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn has_listener(&self, kind: ListenerKind) -> bool {
        self.state.lock().listeners.values().any(|k| *k == kind)
    }
}

impl HostContainer for HeadlessContainer {
    fn client_size(&self) -> SurfaceSize {
        self.state.lock().size
    }

    fn attach_surface(&mut self, _surface: SurfaceId) -> ChildNode {
        let mut state = self.state.lock();
        state.next_id += 1;
        let node = ChildNode(state.next_id);
        state.children.push(node);
        node
    }

    fn detach(&mut self, node: ChildNode) {
        self.state.lock().children.retain(|child| *child != node);
    }

    fn add_listener(&mut self, kind: ListenerKind) -> ListenerId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = ListenerId(state.next_id);
        state.listeners.insert(id, kind);
        id
    }

    fn remove_listener(&mut self, id: ListenerId) {
        self.state.lock().listeners.remove(&id);
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    next_id: u64,
    pending: Vec<FrameHandle>,
    requested: usize,
    cancelled: Vec<FrameHandle>,
}

/// Frame scheduler whose callbacks are fired by the caller.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callbacks requested and neither fired nor cancelled.
    pub fn pending(&self) -> Vec<FrameHandle> {
        self.state.lock().pending.clone()
    }

    /// Removes the oldest pending callback so the caller can fire it.
    pub fn take_next(&self) -> Option<FrameHandle> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            None
        } else {
            Some(state.pending.remove(0))
        }
    }

    pub fn requested(&self) -> usize {
        self.state.lock().requested
    }

    pub fn cancelled(&self) -> Vec<FrameHandle> {
        self.state.lock().cancelled.clone()
    }
}

impl FrameScheduler for ManualScheduler {
    fn request_frame(&mut self) -> FrameHandle {
        let mut state = self.state.lock();
        state.next_id += 1;
        state.requested += 1;
        let handle = FrameHandle(state.next_id);
        state.pending.push(handle);
        handle
    }

    fn cancel_frame(&mut self, handle: FrameHandle) {
        let mut state = self.state.lock();
        state.pending.retain(|pending| *pending != handle);
        state.cancelled.push(handle);
    }
}

#[derive(Debug, Default)]
struct LoaderState {
    requests: Vec<LoadRequest>,
    cancelled: Vec<LoadId>,
}

/// Loader that only records requests. The caller delivers the
/// [`LoadEvent`](crate::loader::LoadEvent)s.
#[derive(Debug, Clone, Default)]
pub struct ManualLoader {
    state: Arc<Mutex<LoaderState>>,
}

impl ManualLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<LoadRequest> {
        self.state.lock().requests.clone()
    }

    pub fn last_request(&self) -> Option<LoadRequest> {
        self.state.lock().requests.last().cloned()
    }

    pub fn cancelled(&self) -> Vec<LoadId> {
        self.state.lock().cancelled.clone()
    }
}

impl AssetLoader for ManualLoader {
    fn load(&mut self, request: LoadRequest) {
        self.state.lock().requests.push(request);
    }

    fn cancel(&mut self, id: LoadId) {
        self.state.lock().cancelled.push(id);
    }
}
