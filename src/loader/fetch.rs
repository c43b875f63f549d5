use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use js_sys::Uint8Array;
use log::debug;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::Response;

use super::{
    decode_asset, resolve_builtin, AssetLoader, InFlight, LoadEvent, LoadId, LoadRequest,
};
use crate::asset::AssetCache;
use crate::error::ViewerError;

/// Fetches models over HTTP with the browser's `fetch`.
///
/// Progress is indeterminate: one signal when the request starts and one
/// with the final size once the body arrives.
pub struct FetchLoader {
    cache: AssetCache,
    sink: Rc<dyn Fn(LoadEvent)>,
    in_flight: Rc<RefCell<InFlight<()>>>,
}

impl FetchLoader {
    pub fn new(cache: AssetCache, sink: impl Fn(LoadEvent) + 'static) -> Self {
        Self {
            cache,
            sink: Rc::new(sink),
            in_flight: Rc::new(RefCell::new(InFlight::default())),
        }
    }
}

impl AssetLoader for FetchLoader {
    fn load(&mut self, request: LoadRequest) {
        let id = request.id;
        if let Some(asset) = self.cache.get(&request.source) {
            (self.sink)(LoadEvent::Completed { id, asset });
            return;
        }
        if let Some(result) = resolve_builtin(&request.source) {
            let event = match result {
                Ok(data) => {
                    let asset = Arc::new(data);
                    self.cache.insert(request.source, Arc::clone(&asset));
                    LoadEvent::Completed { id, asset }
                }
                Err(error) => LoadEvent::Failed { id, error },
            };
            (self.sink)(event);
            return;
        }

        self.in_flight.borrow_mut().begin(id, ());
        let sink = Rc::clone(&self.sink);
        let in_flight = Rc::clone(&self.in_flight);
        let cache = self.cache.clone();
        sink(LoadEvent::Progress {
            id,
            loaded: 0,
            total: None,
        });
        wasm_bindgen_futures::spawn_local(async move {
            let result = fetch_bytes(request.source.as_str()).await;
            if in_flight.borrow_mut().take(id).is_none() {
                debug!("dropping cancelled {id}");
                return;
            }
            let event = match result {
                Ok(bytes) => {
                    sink(LoadEvent::Progress {
                        id,
                        loaded: bytes.len() as u64,
                        total: Some(bytes.len() as u64),
                    });
                    match decode_asset(&request.source, &bytes) {
                        Ok(data) => {
                            let asset = Arc::new(data);
                            cache.insert(request.source.clone(), Arc::clone(&asset));
                            LoadEvent::Completed { id, asset }
                        }
                        Err(error) => LoadEvent::Failed { id, error },
                    }
                }
                Err(message) => LoadEvent::Failed {
                    id,
                    error: ViewerError::AssetLoad {
                        locator: request.source.to_string(),
                        message,
                    },
                },
            };
            sink(event);
        });
    }

    fn cancel(&mut self, id: LoadId) {
        if self.in_flight.borrow_mut().take(id).is_some() {
            debug!("cancelling {id}");
        }
    }
}

async fn fetch_bytes(url: &str) -> Result<Vec<u8>, String> {
    let window = web_sys::window().ok_or_else(|| "window not available".to_string())?;
    let response = JsFuture::from(window.fetch_with_str(url))
        .await
        .map_err(|err| format!("fetch failed: {err:?}"))?
        .dyn_into::<Response>()
        .map_err(|_| "fetch did not return a Response".to_string())?;
    if !response.ok() {
        return Err(format!("HTTP {} {}", response.status(), response.status_text()));
    }
    let buffer = response
        .array_buffer()
        .map_err(|err| format!("failed to read body: {err:?}"))?;
    let buffer = JsFuture::from(buffer)
        .await
        .map_err(|err| format!("failed to read body: {err:?}"))?;
    Ok(Uint8Array::new(&buffer).to_vec())
}
