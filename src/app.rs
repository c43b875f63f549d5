//! Desktop host: one winit window embedding one viewer session.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use glam::Vec2;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use pollster::block_on;
use winit::dpi::LogicalSize;
use winit::event::{
    ElementState, Event, KeyEvent, MouseButton as WinitMouseButton, MouseScrollDelta, Touch,
    TouchPhase, WindowEvent,
};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::Window;

use crate::asset::{AssetCache, AssetSource};
use crate::config::ViewerConfig;
use crate::engine::{SurfaceId, SurfaceSize};
use crate::host::{ChildNode, FrameHandle, FrameScheduler, HostContainer, ListenerId, ListenerKind};
use crate::interaction::{PointerButton, PointerInput};
use crate::loader::{FileLoader, LoadEvent, LoadEventSink};
use crate::render::WgpuEngine;
use crate::session::{Collaborators, ModelViewerSession, SessionState};
use crate::signal::{SignalLog, ViewerSignal};

pub struct AppOptions {
    pub source: AssetSource,
    pub config: ViewerConfig,
    pub title: String,
    pub width: f64,
    pub height: f64,
}

impl AppOptions {
    pub fn new(source: AssetSource, config: ViewerConfig) -> Self {
        Self {
            source,
            config,
            title: "Model Viewer".to_string(),
            width: 1280.0,
            height: 720.0,
        }
    }
}

/// How a windowed run ended.
#[derive(Debug, Clone)]
pub struct AppReport {
    pub state: SessionState,
    pub frames_rendered: u64,
    /// Last load outcome reported to the host.
    pub outcome: Option<ViewerSignal>,
}

/// The platform could not give us a window. Callers fall back to headless mode.
#[derive(Debug)]
pub struct WindowInitError {
    message: String,
}

impl WindowInitError {
    fn from_panic(stage: &str, panic: Box<dyn Any + Send>) -> Self {
        Self {
            message: format!("failed to initialize {stage}: {}", panic_message(panic)),
        }
    }

    fn from_error(stage: &str, err: impl fmt::Display) -> Self {
        Self {
            message: format!("failed to initialize {stage}: {err}"),
        }
    }
}

impl fmt::Display for WindowInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WindowInitError {}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(msg) => *msg,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(msg) => (*msg).to_string(),
            Err(_) => "unknown panic".into(),
        },
    }
}

/// Opens a window, runs the viewer in it until the window is closed and
/// returns how the session ended.
pub fn run_window(options: AppOptions) -> Result<AppReport> {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(|_| {}));
    let event_loop = panic::catch_unwind(AssertUnwindSafe(|| {
        EventLoop::<LoadEvent>::with_user_event().build()
    }));
    panic::set_hook(default_hook);
    let event_loop = event_loop
        .map_err(|panic| WindowInitError::from_panic("event loop", panic))?
        .map_err(|err| WindowInitError::from_error("event loop", err))?;

    #[allow(deprecated)]
    let window = Arc::new(
        event_loop
            .create_window(
                Window::default_attributes()
                    .with_title(options.title.as_str())
                    .with_inner_size(LogicalSize::new(options.width, options.height)),
            )
            .map_err(|err| WindowInitError::from_error("window", err))?,
    );

    let engine = block_on(WgpuEngine::probe(Arc::clone(&window)));
    if let Some(name) = engine.adapter_name() {
        info!("rendering with {name}");
    }

    let proxy = Mutex::new(event_loop.create_proxy());
    let sink: LoadEventSink = Arc::new(move |event: LoadEvent| {
        if proxy.lock().send_event(event).is_err() {
            debug!("event loop closed; dropping load event");
        }
    });
    let scheduler = RedrawScheduler::new(Arc::clone(&window));
    let signals = SignalLog::new();
    let session = ModelViewerSession::new(
        options.source,
        options.config,
        Collaborators {
            engine: Box::new(engine),
            container: Box::new(WindowContainer::new(Arc::clone(&window))),
            scheduler: Box::new(scheduler.clone()),
            loader: Box::new(FileLoader::new(AssetCache::default(), sink)),
            signals: Box::new(signals.clone()),
        },
    )?;

    let mut app = AppState {
        window,
        title: options.title,
        status: None,
        session,
        scheduler,
        signals,
        outcome: None,
        started: Instant::now(),
        cursor: Vec2::ZERO,
        touches: HashSet::new(),
    };
    app.drain_signals();

    #[allow(deprecated)]
    let result = event_loop.run(|event, elwt| {
        elwt.set_control_flow(ControlFlow::Wait);
        app.process_event(event, elwt);
    });
    app.session.dispose();
    app.drain_signals();
    result.map_err(|err| anyhow::anyhow!("event loop failed: {err}"))?;

    Ok(AppReport {
        state: app.session.state(),
        frames_rendered: app.session.frames_rendered(),
        outcome: app.outcome,
    })
}

struct AppState {
    window: Arc<Window>,
    title: String,
    status: Option<String>,
    session: ModelViewerSession,
    scheduler: RedrawScheduler,
    signals: SignalLog,
    outcome: Option<ViewerSignal>,
    started: Instant,
    cursor: Vec2,
    touches: HashSet<u64>,
}

impl AppState {
    fn process_event(&mut self, event: Event<LoadEvent>, elwt: &ActiveEventLoop) {
        match event {
            Event::WindowEvent { event, window_id } if window_id == self.window.id() => {
                self.handle_window_event(event, elwt);
            }
            Event::UserEvent(load) => self.session.handle_load_event(load),
            Event::LoopExiting => self.session.dispose(),
            _ => {}
        }
        self.drain_signals();
        if self.session.state() == SessionState::Unsupported {
            error!("this device cannot render the model");
            elwt.exit();
        }
        self.refresh_title();
    }

    fn handle_window_event(&mut self, event: WindowEvent, elwt: &ActiveEventLoop) {
        match event {
            WindowEvent::CloseRequested => {
                self.session.dispose();
                elwt.exit();
            }
            WindowEvent::Resized(size) => self.session.resize(size.width, size.height),
            WindowEvent::ScaleFactorChanged { .. } => {
                let size = self.window.inner_size();
                self.session.resize(size.width, size.height);
            }
            WindowEvent::Occluded(occluded) => self.session.set_visibility(!occluded),
            WindowEvent::RedrawRequested => {
                if let Some(handle) = self.scheduler.take_pending() {
                    let now = self.started.elapsed().as_secs_f64() * 1000.0;
                    self.session.on_frame(handle, now);
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.cursor = Vec2::new(position.x as f32, position.y as f32);
                self.session.handle_pointer(PointerInput::Move {
                    x: self.cursor.x,
                    y: self.cursor.y,
                });
            }
            WindowEvent::MouseInput { state, button, .. } => {
                let input = match state {
                    ElementState::Pressed => match map_mouse_button(button) {
                        Some(button) => PointerInput::Down {
                            x: self.cursor.x,
                            y: self.cursor.y,
                            button,
                        },
                        None => return,
                    },
                    ElementState::Released => PointerInput::Up,
                };
                self.session.handle_pointer(input);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let delta_y = match delta {
                    MouseScrollDelta::LineDelta(_, lines) => -lines,
                    MouseScrollDelta::PixelDelta(pixels) => -(pixels.y as f32),
                };
                if delta_y != 0.0 {
                    self.session.handle_pointer(PointerInput::Wheel { delta_y });
                }
            }
            WindowEvent::Touch(touch) => self.handle_touch(touch),
            WindowEvent::KeyboardInput { event, .. } => self.handle_keyboard(&event, elwt),
            _ => {}
        }
    }

    fn handle_touch(&mut self, touch: Touch) {
        let (x, y) = (touch.location.x as f32, touch.location.y as f32);
        let input = match touch.phase {
            TouchPhase::Started => {
                self.touches.insert(touch.id);
                PointerInput::TouchStart {
                    x,
                    y,
                    touches: self.touches.len() as u32,
                }
            }
            TouchPhase::Moved => PointerInput::TouchMove {
                x,
                y,
                touches: self.touches.len() as u32,
            },
            TouchPhase::Ended | TouchPhase::Cancelled => {
                self.touches.remove(&touch.id);
                PointerInput::TouchEnd {
                    touches: self.touches.len() as u32,
                }
            }
        };
        self.session.handle_pointer(input);
    }

    fn handle_keyboard(&mut self, event: &KeyEvent, elwt: &ActiveEventLoop) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        match &event.logical_key {
            Key::Named(NamedKey::Escape) => {
                self.session.dispose();
                elwt.exit();
            }
            Key::Named(NamedKey::Enter) => {
                if !self.session.retry() {
                    info!("{} retries left", self.session.retries_remaining());
                }
            }
            Key::Named(NamedKey::F5) => self.session.reload(),
            Key::Character(text) if text.as_str().eq_ignore_ascii_case("r") => {
                self.session.reset()
            }
            _ => {}
        }
    }

    fn drain_signals(&mut self) {
        for signal in self.signals.drain() {
            match &signal {
                ViewerSignal::Loaded(summary) => info!(
                    "model ready: {} meshes, {} vertices",
                    summary.mesh_count, summary.vertex_count
                ),
                ViewerSignal::Error {
                    description,
                    retryable,
                } => {
                    if *retryable {
                        warn!("{description} (press Enter to retry)");
                    } else {
                        warn!("{description}");
                    }
                }
                ViewerSignal::Progress { loaded, total } => {
                    debug!("loaded {loaded} of {total:?} bytes")
                }
                ViewerSignal::Unsupported | ViewerSignal::Disposed => {}
            }
            if matches!(
                signal,
                ViewerSignal::Loaded(_) | ViewerSignal::Error { .. } | ViewerSignal::Unsupported
            ) {
                self.outcome = Some(signal);
            }
        }
    }

    fn refresh_title(&mut self) {
        let status = self.session.status_text();
        if status == self.status {
            return;
        }
        match &status {
            Some(text) => self.window.set_title(&format!("{} - {text}", self.title)),
            None => self.window.set_title(&self.title),
        }
        self.status = status;
    }
}

fn map_mouse_button(button: WinitMouseButton) -> Option<PointerButton> {
    match button {
        WinitMouseButton::Left => Some(PointerButton::Primary),
        WinitMouseButton::Right => Some(PointerButton::Secondary),
        WinitMouseButton::Middle => Some(PointerButton::Middle),
        _ => None,
    }
}

/// The window's client area stands in for the embedding element.
struct WindowContainer {
    window: Arc<Window>,
    next_id: u64,
    listeners: HashMap<ListenerId, ListenerKind>,
}

impl WindowContainer {
    fn new(window: Arc<Window>) -> Self {
        Self {
            window,
            next_id: 0,
            listeners: HashMap::new(),
        }
    }
}

impl HostContainer for WindowContainer {
    fn client_size(&self) -> SurfaceSize {
        let size = self.window.inner_size();
        SurfaceSize::new(size.width, size.height)
    }

    fn attach_surface(&mut self, surface: SurfaceId) -> ChildNode {
        self.window.set_visible(true);
        ChildNode(surface.0)
    }

    fn detach(&mut self, node: ChildNode) {
        debug!("surface node {} detached", node.0);
    }

    fn add_listener(&mut self, kind: ListenerKind) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.insert(id, kind);
        id
    }

    fn remove_listener(&mut self, id: ListenerId) {
        self.listeners.remove(&id);
    }
}

#[derive(Debug, Default)]
struct RedrawState {
    next_id: u64,
    pending: Option<FrameHandle>,
}

/// Maps frame requests onto window redraws. At most one is outstanding.
#[derive(Clone)]
struct RedrawScheduler {
    window: Arc<Window>,
    state: Arc<Mutex<RedrawState>>,
}

impl RedrawScheduler {
    fn new(window: Arc<Window>) -> Self {
        Self {
            window,
            state: Arc::default(),
        }
    }

    fn take_pending(&self) -> Option<FrameHandle> {
        self.state.lock().pending.take()
    }
}

impl FrameScheduler for RedrawScheduler {
    fn request_frame(&mut self) -> FrameHandle {
        let handle = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let handle = FrameHandle(state.next_id);
            state.pending = Some(handle);
            handle
        };
        self.window.request_redraw();
        handle
    }

    fn cancel_frame(&mut self, handle: FrameHandle) {
        let mut state = self.state.lock();
        if state.pending == Some(handle) {
            state.pending = None;
        }
    }
}
