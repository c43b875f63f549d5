#![cfg(target_arch = "wasm32")]
//! Browser host: mounts viewers into page elements marked with
//! `data-model-viewer` or `data-hero-model-viewer`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use wasm_bindgen::closure::Closure;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{
    AddEventListenerOptions, Document, Element, Event, EventTarget, HtmlCanvasElement,
    MouseEvent, TouchEvent, WheelEvent,
};

use crate::asset::AssetCache;
use crate::config::ContainerSpec;
use crate::engine::{SurfaceId, SurfaceSize};
use crate::host::{ChildNode, FrameHandle, FrameScheduler, HostContainer, ListenerId, ListenerKind};
use crate::interaction::{PointerButton, PointerInput};
use crate::loader::{FetchLoader, LoadEvent};
use crate::render::WgpuEngine;
use crate::session::{Collaborators, ModelViewerSession};
use crate::signal::ViewerSignal;

thread_local! {
    /// Decoded models shared by every viewer mounted on the page.
    static PAGE_CACHE: AssetCache = AssetCache::default();
}

#[wasm_bindgen(start)]
pub fn bootstrap() {
    console_error_panic_hook::set_once();
    let _ = wasm_logger::init(wasm_logger::Config::default());
}

struct Mounted {
    session: ModelViewerSession,
    overlay: Element,
    status: Option<String>,
}

type Slot = Rc<RefCell<Option<Mounted>>>;
type LoadQueue = Rc<RefCell<VecDeque<LoadEvent>>>;

/// Runs `f` against the mounted session, after feeding it any queued load
/// events, then refreshes the status overlay. Does nothing while the session
/// is busy or gone.
fn with_session(
    slot: &Weak<RefCell<Option<Mounted>>>,
    queue: &LoadQueue,
    f: impl FnOnce(&mut ModelViewerSession),
) {
    let Some(slot) = slot.upgrade() else {
        return;
    };
    let Ok(mut guard) = slot.try_borrow_mut() else {
        debug!("viewer busy; deferring host event");
        return;
    };
    let Some(mounted) = guard.as_mut() else {
        return;
    };
    loop {
        let next = queue.borrow_mut().pop_front();
        match next {
            Some(event) => mounted.session.handle_load_event(event),
            None => break,
        }
    }
    f(&mut mounted.session);

    let status = mounted.session.status_text();
    if status != mounted.status {
        mounted.overlay.set_text_content(status.as_deref());
        let hidden = if status.is_some() { "false" } else { "true" };
        let _ = mounted.overlay.set_attribute("aria-hidden", hidden);
        mounted.status = status;
    }
}

/// JavaScript handle of one mounted viewer.
#[wasm_bindgen]
pub struct ViewerHandle {
    slot: Slot,
    queue: LoadQueue,
}

#[wasm_bindgen]
impl ViewerHandle {
    pub fn state(&self) -> String {
        match self.slot.try_borrow() {
            Ok(guard) => guard
                .as_ref()
                .map(|m| m.session.state().to_string())
                .unwrap_or_else(|| "disposed".to_string()),
            Err(_) => "busy".to_string(),
        }
    }

    pub fn retry(&self) -> bool {
        let mut started = false;
        with_session(&Rc::downgrade(&self.slot), &self.queue, |session| {
            started = session.retry();
        });
        started
    }

    pub fn reload(&self) {
        with_session(&Rc::downgrade(&self.slot), &self.queue, |session| session.reload());
    }

    pub fn reset(&self) {
        with_session(&Rc::downgrade(&self.slot), &self.queue, |session| session.reset());
    }

    pub fn dispose(&self) {
        with_session(&Rc::downgrade(&self.slot), &self.queue, |session| session.dispose());
        if let Ok(mut guard) = self.slot.try_borrow_mut() {
            if let Some(mounted) = guard.take() {
                mounted.overlay.remove();
            }
        }
    }
}

/// Mounts a viewer into every marked element of the page.
#[wasm_bindgen]
pub async fn mount_all() -> Result<js_sys::Array, JsValue> {
    let document = document().map_err(to_js)?;
    let handles = js_sys::Array::new();
    let elements = document
        .query_selector_all("[data-model-viewer], [data-hero-model-viewer]")
        .map_err(|err| JsValue::from_str(&format!("selector failed: {err:?}")))?;
    for index in 0..elements.length() {
        let Some(element) = elements.get(index).and_then(|n| n.dyn_into::<Element>().ok()) else {
            continue;
        };
        match mount_element(element).await {
            Ok(Some(handle)) => {
                handles.push(&JsValue::from(handle));
            }
            Ok(None) => {}
            Err(err) => warn!("viewer mount failed: {err:#}"),
        }
    }
    info!("mounted {} viewer(s)", handles.length());
    Ok(handles)
}

/// Mounts a viewer into the element with `element_id`.
#[wasm_bindgen]
pub async fn mount(element_id: String) -> Result<ViewerHandle, JsValue> {
    let element = document()
        .map_err(to_js)?
        .get_element_by_id(&element_id)
        .ok_or_else(|| JsValue::from_str("viewer element not found"))?;
    mount_element(element)
        .await
        .map_err(to_js)?
        .ok_or_else(|| JsValue::from_str("element is not a model viewer container"))
}

async fn mount_element(element: Element) -> Result<Option<ViewerHandle>> {
    let Some(spec) = ContainerSpec::from_attributes(element.id(), |name| element.get_attribute(name))
    else {
        return Ok(None);
    };
    let document = document()?;
    let canvas: HtmlCanvasElement = document
        .create_element("canvas")
        .map_err(|err| anyhow!("failed to create canvas: {err:?}"))?
        .dyn_into()
        .map_err(|_| anyhow!("element is not a canvas"))?;
    let _ = canvas.set_attribute("style", "display:block;width:100%;height:100%");
    let overlay = document
        .create_element("div")
        .map_err(|err| anyhow!("failed to create overlay: {err:?}"))?;
    let _ = overlay.set_attribute("class", "model-viewer-status");
    let _ = overlay.set_attribute("aria-live", "polite");
    element
        .append_child(&overlay)
        .map_err(|err| anyhow!("failed to append overlay: {err:?}"))?;

    let engine = WgpuEngine::probe(wgpu::SurfaceTarget::Canvas(canvas.clone())).await;

    let slot: Slot = Rc::new(RefCell::new(None));
    let queue: LoadQueue = Rc::new(RefCell::new(VecDeque::new()));
    let weak = Rc::downgrade(&slot);

    let loader = {
        let weak = weak.clone();
        let queue = Rc::clone(&queue);
        FetchLoader::new(PAGE_CACHE.with(AssetCache::clone), move |event| {
            queue.borrow_mut().push_back(event);
            let weak = weak.clone();
            let queue = Rc::clone(&queue);
            wasm_bindgen_futures::spawn_local(async move {
                with_session(&weak, &queue, |_| {});
            });
        })
    };
    let signals = {
        let element = element.clone();
        move |signal: ViewerSignal| {
            let state = match &signal {
                ViewerSignal::Unsupported => "unsupported",
                ViewerSignal::Progress { .. } => "loading",
                ViewerSignal::Loaded(_) => "ready",
                ViewerSignal::Error { .. } => "error",
                ViewerSignal::Disposed => "disposed",
            };
            let _ = element.set_attribute("data-viewer-state", state);
            if let ViewerSignal::Error { description, .. } = &signal {
                warn!("viewer `{}`: {description}", element.id());
            }
        }
    };

    let session = ModelViewerSession::new(
        spec.source,
        spec.config,
        Collaborators {
            engine: Box::new(engine),
            container: Box::new(ElementContainer::new(
                element.clone(),
                canvas,
                weak.clone(),
                Rc::clone(&queue),
            )?),
            scheduler: Box::new(AnimationFrameScheduler::new(weak.clone(), Rc::clone(&queue))?),
            loader: Box::new(loader),
            signals: Box::new(signals),
        },
    )
    .map_err(|err| anyhow!("{err}"))?;
    *slot.borrow_mut() = Some(Mounted {
        session,
        overlay,
        status: None,
    });
    with_session(&weak, &queue, |_| {});

    Ok(Some(ViewerHandle { slot, queue }))
}

fn document() -> Result<Document> {
    web_sys::window()
        .and_then(|window| window.document())
        .ok_or_else(|| anyhow!("document not available"))
}

fn to_js(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

struct DomListener {
    target: EventTarget,
    name: &'static str,
    closure: Closure<dyn FnMut(Event)>,
}

impl DomListener {
    fn detach(&self) {
        let _ = self
            .target
            .remove_event_listener_with_callback(self.name, self.closure.as_ref().unchecked_ref());
    }
}

/// The page element hosting the canvas.
struct ElementContainer {
    element: Element,
    canvas: HtmlCanvasElement,
    document: Document,
    window: web_sys::Window,
    slot: Weak<RefCell<Option<Mounted>>>,
    queue: LoadQueue,
    next_id: u64,
    listeners: HashMap<ListenerId, DomListener>,
}

impl ElementContainer {
    fn new(
        element: Element,
        canvas: HtmlCanvasElement,
        slot: Weak<RefCell<Option<Mounted>>>,
        queue: LoadQueue,
    ) -> Result<Self> {
        let window = web_sys::window().ok_or_else(|| anyhow!("window not available"))?;
        Ok(Self {
            element,
            canvas,
            document: document()?,
            window,
            slot,
            queue,
            next_id: 0,
            listeners: HashMap::new(),
        })
    }

    fn target_for(&self, kind: ListenerKind) -> (EventTarget, &'static str) {
        let element: EventTarget = self.element.clone().into();
        match kind {
            ListenerKind::Resize => (self.window.clone().into(), "resize"),
            ListenerKind::VisibilityChange => (self.document.clone().into(), "visibilitychange"),
            ListenerKind::PointerDown => (element, "mousedown"),
            ListenerKind::PointerMove => (element, "mousemove"),
            ListenerKind::PointerUp => (self.window.clone().into(), "mouseup"),
            ListenerKind::Wheel => (element, "wheel"),
            ListenerKind::TouchStart => (element, "touchstart"),
            ListenerKind::TouchMove => (element, "touchmove"),
            ListenerKind::TouchEnd => (element, "touchend"),
        }
    }

    fn handler(&self, kind: ListenerKind) -> Closure<dyn FnMut(Event)> {
        let slot = self.slot.clone();
        let queue = Rc::clone(&self.queue);
        let element = self.element.clone();
        let document = self.document.clone();
        Closure::wrap(Box::new(move |event: Event| {
            match kind {
                ListenerKind::Resize => {
                    let (width, height) = client_size(&element);
                    with_session(&slot, &queue, |s| s.resize(width, height));
                }
                ListenerKind::VisibilityChange => {
                    let visible = !document.hidden();
                    with_session(&slot, &queue, |s| s.set_visibility(visible));
                }
                _ => {
                    if let Some(input) = pointer_input(kind, &event, &element) {
                        if matches!(kind, ListenerKind::Wheel | ListenerKind::TouchMove) {
                            event.prevent_default();
                        }
                        with_session(&slot, &queue, |s| s.handle_pointer(input));
                    }
                }
            }
        }) as Box<dyn FnMut(Event)>)
    }
}

impl HostContainer for ElementContainer {
    fn client_size(&self) -> SurfaceSize {
        let (width, height) = client_size(&self.element);
        SurfaceSize::new(width, height)
    }

    fn attach_surface(&mut self, _surface: SurfaceId) -> ChildNode {
        let size = self.client_size();
        self.canvas.set_width(size.width);
        self.canvas.set_height(size.height);
        if let Err(err) = self.element.append_child(&self.canvas) {
            warn!("failed to attach canvas: {err:?}");
        }
        ChildNode(1)
    }

    fn detach(&mut self, _node: ChildNode) {
        self.canvas.remove();
    }

    fn add_listener(&mut self, kind: ListenerKind) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        let (target, name) = self.target_for(kind);
        let closure = self.handler(kind);
        let options = AddEventListenerOptions::new();
        options.set_passive(false);
        if let Err(err) = target.add_event_listener_with_callback_and_add_event_listener_options(
            name,
            closure.as_ref().unchecked_ref(),
            &options,
        ) {
            warn!("failed to listen for {name}: {err:?}");
        }
        self.listeners.insert(
            id,
            DomListener {
                target,
                name,
                closure,
            },
        );
        id
    }

    fn remove_listener(&mut self, id: ListenerId) {
        if let Some(listener) = self.listeners.remove(&id) {
            listener.detach();
        }
    }
}

impl Drop for ElementContainer {
    fn drop(&mut self) {
        for listener in self.listeners.values() {
            listener.detach();
        }
    }
}

fn client_size(element: &Element) -> (u32, u32) {
    (
        element.client_width().max(1) as u32,
        element.client_height().max(1) as u32,
    )
}

fn pointer_input(kind: ListenerKind, event: &Event, element: &Element) -> Option<PointerInput> {
    match kind {
        ListenerKind::PointerDown => {
            let mouse = event.dyn_ref::<MouseEvent>()?;
            let button = match mouse.button() {
                0 => PointerButton::Primary,
                1 => PointerButton::Middle,
                2 => PointerButton::Secondary,
                _ => return None,
            };
            Some(PointerInput::Down {
                x: mouse.offset_x() as f32,
                y: mouse.offset_y() as f32,
                button,
            })
        }
        ListenerKind::PointerMove => {
            let mouse = event.dyn_ref::<MouseEvent>()?;
            Some(PointerInput::Move {
                x: mouse.offset_x() as f32,
                y: mouse.offset_y() as f32,
            })
        }
        ListenerKind::PointerUp => Some(PointerInput::Up),
        ListenerKind::Wheel => {
            let wheel = event.dyn_ref::<WheelEvent>()?;
            Some(PointerInput::Wheel {
                delta_y: wheel.delta_y() as f32,
            })
        }
        ListenerKind::TouchStart | ListenerKind::TouchMove => {
            let touch_event = event.dyn_ref::<TouchEvent>()?;
            let touches = touch_event.touches();
            let first = touches.get(0)?;
            let rect = element.get_bounding_client_rect();
            let x = first.client_x() as f32 - rect.left() as f32;
            let y = first.client_y() as f32 - rect.top() as f32;
            let count = touches.length();
            Some(if kind == ListenerKind::TouchStart {
                PointerInput::TouchStart { x, y, touches: count }
            } else {
                PointerInput::TouchMove { x, y, touches: count }
            })
        }
        ListenerKind::TouchEnd => {
            let touch_event = event.dyn_ref::<TouchEvent>()?;
            Some(PointerInput::TouchEnd {
                touches: touch_event.touches().length(),
            })
        }
        ListenerKind::Resize | ListenerKind::VisibilityChange => None,
    }
}

/// `requestAnimationFrame` with a single reusable callback.
struct AnimationFrameScheduler {
    window: web_sys::Window,
    pending: Rc<RefCell<Option<FrameHandle>>>,
    callback: Closure<dyn FnMut(f64)>,
}

impl AnimationFrameScheduler {
    fn new(slot: Weak<RefCell<Option<Mounted>>>, queue: LoadQueue) -> Result<Self> {
        let window = web_sys::window().ok_or_else(|| anyhow!("window not available"))?;
        let pending: Rc<RefCell<Option<FrameHandle>>> = Rc::new(RefCell::new(None));
        let fired = Rc::clone(&pending);
        let callback = Closure::wrap(Box::new(move |now: f64| {
            let Some(handle) = fired.borrow_mut().take() else {
                return;
            };
            with_session(&slot, &queue, |s| s.on_frame(handle, now));
        }) as Box<dyn FnMut(f64)>);
        Ok(Self {
            window,
            pending,
            callback,
        })
    }
}

impl FrameScheduler for AnimationFrameScheduler {
    fn request_frame(&mut self) -> FrameHandle {
        match self
            .window
            .request_animation_frame(self.callback.as_ref().unchecked_ref())
        {
            Ok(id) => {
                let handle = FrameHandle(id as u64);
                *self.pending.borrow_mut() = Some(handle);
                handle
            }
            Err(err) => {
                warn!("requestAnimationFrame failed: {err:?}");
                FrameHandle(0)
            }
        }
    }

    fn cancel_frame(&mut self, handle: FrameHandle) {
        let _ = self.window.cancel_animation_frame(handle.0 as i32);
        let mut pending = self.pending.borrow_mut();
        if *pending == Some(handle) {
            *pending = None;
        }
    }
}
