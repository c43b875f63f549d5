//! Asynchronous model loading.
//!
//! A loader receives [`LoadRequest`]s and reports back through
//! [`LoadEvent`]s that the host feeds to
//! [`ModelViewerSession::handle_load_event`](crate::ModelViewerSession::handle_load_event).
//! Loaders never block the caller and never touch the session directly.

#[cfg(not(target_arch = "wasm32"))]
mod file;
#[cfg(target_arch = "wasm32")]
mod fetch;

#[cfg(not(target_arch = "wasm32"))]
pub use file::{FileLoader, LoadEventSink};
#[cfg(target_arch = "wasm32")]
pub use fetch::FetchLoader;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::asset::gltf_import::parse_gltf;
use crate::asset::obj::parse_obj;
use crate::asset::primitive::build_builtin;
use crate::asset::{AssetData, AssetSource};
use crate::error::ViewerError;

/// Generation number of a load request. Later requests have larger ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadId(pub u64);

impl fmt::Display for LoadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "load#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub id: LoadId,
    pub source: AssetSource,
}

#[derive(Debug)]
pub enum LoadEvent {
    Progress {
        id: LoadId,
        loaded: u64,
        total: Option<u64>,
    },
    Completed {
        id: LoadId,
        asset: Arc<AssetData>,
    },
    Failed {
        id: LoadId,
        error: ViewerError,
    },
}

impl LoadEvent {
    pub fn id(&self) -> LoadId {
        match self {
            LoadEvent::Progress { id, .. }
            | LoadEvent::Completed { id, .. }
            | LoadEvent::Failed { id, .. } => *id,
        }
    }
}

/// Requests a loader is still working on, each with the loader's own token.
/// Only live requests are tracked: finishing and cancelling both take the
/// entry, so at most one of them succeeds for a given id.
#[derive(Debug)]
pub(crate) struct InFlight<T> {
    entries: HashMap<LoadId, T>,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> InFlight<T> {
    pub(crate) fn begin(&mut self, id: LoadId, token: T) {
        self.entries.insert(id, token);
    }

    /// Removes `id`, returning its token if the request was still live.
    pub(crate) fn take(&mut self, id: LoadId) -> Option<T> {
        self.entries.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub trait AssetLoader {
    /// Starts fetching and decoding. Results arrive later as [`LoadEvent`]s.
    fn load(&mut self, request: LoadRequest);

    /// Stops a request if it is still running. Events already queued for it
    /// may still be delivered; the session discards them by id.
    fn cancel(&mut self, id: LoadId);
}

/// Builds builtin models without fetching anything. Returns `None` for
/// sources that need bytes.
pub fn resolve_builtin(source: &AssetSource) -> Option<Result<AssetData, ViewerError>> {
    source.builtin_name().map(build_builtin)
}

/// Decodes fetched bytes according to the source's file extension.
pub fn decode_asset(source: &AssetSource, bytes: &[u8]) -> Result<AssetData, ViewerError> {
    if let Some(result) = resolve_builtin(source) {
        return result;
    }
    match source.extension().as_deref() {
        Some("obj") => {
            let text = std::str::from_utf8(bytes).map_err(|err| ViewerError::AssetLoad {
                locator: source.to_string(),
                message: format!("OBJ data is not UTF-8: {err}"),
            })?;
            parse_obj(text).map_err(|err| ViewerError::AssetLoad {
                locator: source.to_string(),
                message: format!("{err:#}"),
            })
        }
        Some("gltf" | "glb") => parse_gltf(bytes).map_err(|err| ViewerError::AssetLoad {
            locator: source.to_string(),
            message: format!("{err:#}"),
        }),
        Some(other) => Err(ViewerError::UnsupportedFormat(other.to_string())),
        None => Err(ViewerError::UnsupportedFormat(source.to_string())),
    }
}
