//! Embeddable 3D model viewer.
//!
//! A [`ModelViewerSession`] owns the full lifecycle of one viewer: it probes
//! the graphics engine, creates a render surface inside a host container,
//! loads a model, drives a frame-rate governed render loop with optional
//! auto-rotation and pointer interaction, degrades shadow quality when the
//! device cannot keep up, and releases everything it created on dispose.
//!
//! The session talks to its environment only through the traits in
//! [`engine`], [`host`], [`loader`] and [`signal`], so it runs the same way
//! against a real window, a browser canvas or the in-memory collaborators in
//! [`headless`].

#[cfg(not(target_arch = "wasm32"))]
pub mod app;
pub mod asset;
pub mod camera;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod headless;
pub mod host;
pub mod interaction;
pub mod loader;
pub mod performance;
pub mod render;
pub mod session;
pub mod signal;
#[cfg(target_arch = "wasm32")]
pub mod web;

pub use asset::{AssetCache, AssetData, AssetSource, AssetSummary, Bounds};
pub use config::{discover_viewers, ContainerSpec, InteractionMode, ViewerConfig};
pub use engine::{GraphicsEngine, ShadowSettings, SurfaceSize};
pub use error::ViewerError;
pub use host::{FrameHandle, FrameScheduler, HostContainer, ListenerKind};
pub use interaction::{PointerButton, PointerInput};
pub use loader::{AssetLoader, LoadEvent, LoadId, LoadRequest};
pub use render::WgpuEngine;
pub use session::{Collaborators, ModelViewerSession, SessionState};
pub use signal::{SignalLog, SignalSink, ViewerSignal};
