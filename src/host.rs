//! What the session borrows from the page or window that embeds it.

use serde::{Deserialize, Serialize};

use crate::engine::{SurfaceId, SurfaceSize};

/// Host signal or input stream the session can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListenerKind {
    Resize,
    VisibilityChange,
    PointerDown,
    PointerMove,
    PointerUp,
    Wheel,
    TouchStart,
    TouchMove,
    TouchEnd,
}

impl ListenerKind {
    /// Listeners needed to drive drag, orbit, zoom and touch gestures.
    pub const POINTER: [ListenerKind; 7] = [
        ListenerKind::PointerDown,
        ListenerKind::PointerMove,
        ListenerKind::PointerUp,
        ListenerKind::Wheel,
        ListenerKind::TouchStart,
        ListenerKind::TouchMove,
        ListenerKind::TouchEnd,
    ];
}

/// Stable identity of a registered listener, kept for detachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Node the session inserted into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildNode(pub u64);

/// Element the viewer renders into. Borrowed: the session must leave it
/// without any of its own children when disposed.
pub trait HostContainer {
    fn client_size(&self) -> SurfaceSize;

    fn attach_surface(&mut self, surface: SurfaceId) -> ChildNode;

    fn detach(&mut self, node: ChildNode);

    fn add_listener(&mut self, kind: ListenerKind) -> ListenerId;

    fn remove_listener(&mut self, id: ListenerId);
}

/// Handle of one scheduled frame callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle(pub u64);

/// The host's frame-scheduling primitive (an animation-frame request).
pub trait FrameScheduler {
    fn request_frame(&mut self) -> FrameHandle;

    fn cancel_frame(&mut self, handle: FrameHandle);
}
