use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use parking_lot::Mutex;

use super::{decode_asset, AssetLoader, InFlight, LoadEvent, LoadId, LoadRequest};
use crate::asset::{AssetCache, AssetSource};
use crate::error::ViewerError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Where a [`FileLoader`] delivers its events. Must not block: hosts forward
/// events into their own queue and hand them to the session later.
pub type LoadEventSink = Arc<dyn Fn(LoadEvent) + Send + Sync>;

/// Reads models from the local filesystem on worker threads.
pub struct FileLoader {
    root: Option<PathBuf>,
    cache: AssetCache,
    sink: LoadEventSink,
    in_flight: Arc<Mutex<InFlight<Arc<AtomicBool>>>>,
}

impl FileLoader {
    pub fn new(cache: AssetCache, sink: LoadEventSink) -> Self {
        Self {
            root: None,
            cache,
            sink,
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    /// Resolves relative sources against `root` instead of the working directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Fails a request that never got a worker thread.
    fn abandon(&self, id: LoadId, err: std::io::Error) {
        warn!("failed to spawn asset loader thread for {id}: {err}");
        self.in_flight.lock().take(id);
        (self.sink)(LoadEvent::Failed {
            id,
            error: ViewerError::Io(err),
        });
    }

    fn resolve(&self, source: &AssetSource) -> PathBuf {
        let path = Path::new(source.as_str());
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl AssetLoader for FileLoader {
    fn load(&mut self, request: LoadRequest) {
        if let Some(asset) = self.cache.get(&request.source) {
            debug!("{} served {} from cache", request.id, request.source);
            (self.sink)(LoadEvent::Completed {
                id: request.id,
                asset,
            });
            return;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.in_flight
            .lock()
            .begin(request.id, Arc::clone(&cancelled));

        let id = request.id;
        let job = LoadJob {
            path: self.resolve(&request.source),
            request,
            cache: self.cache.clone(),
            sink: Arc::clone(&self.sink),
            cancelled,
        };
        let in_flight = Arc::clone(&self.in_flight);
        let spawned = thread::Builder::new()
            .name(format!("asset-{}", id.0))
            .spawn(move || {
                let id = job.request.id;
                job.run();
                in_flight.lock().take(id);
            });
        if let Err(err) = spawned {
            self.abandon(id, err);
        }
    }

    fn cancel(&mut self, id: LoadId) {
        if let Some(flag) = self.in_flight.lock().take(id) {
            debug!("cancelling {id}");
            flag.store(true, Ordering::Release);
        }
    }
}

struct LoadJob {
    request: LoadRequest,
    path: PathBuf,
    cache: AssetCache,
    sink: LoadEventSink,
    cancelled: Arc<AtomicBool>,
}

impl LoadJob {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn run(self) {
        let id = self.request.id;
        let bytes = if self.request.source.builtin_name().is_some() {
            Vec::new()
        } else {
            match self.read() {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return,
                Err(error) => {
                    (self.sink)(LoadEvent::Failed { id, error });
                    return;
                }
            }
        };

        let event = match decode_asset(&self.request.source, &bytes) {
            Ok(data) => {
                let asset = Arc::new(data);
                self.cache
                    .insert(self.request.source.clone(), Arc::clone(&asset));
                LoadEvent::Completed { id, asset }
            }
            Err(error) => LoadEvent::Failed { id, error },
        };
        if !self.is_cancelled() {
            (self.sink)(event);
        }
    }

    /// Reads the whole file, reporting progress per chunk. `None` when cancelled.
    fn read(&self) -> Result<Option<Vec<u8>>, ViewerError> {
        let id = self.request.id;
        let load_error = |err: std::io::Error| ViewerError::AssetLoad {
            locator: self.path.display().to_string(),
            message: err.to_string(),
        };
        let mut file = File::open(&self.path).map_err(load_error)?;
        let total = file.metadata().ok().map(|meta| meta.len());
        let mut bytes = Vec::with_capacity(total.unwrap_or(0) as usize);
        let mut chunk = vec![0u8; CHUNK_SIZE];
        loop {
            if self.is_cancelled() {
                debug!("{id} cancelled after {} bytes", bytes.len());
                return Ok(None);
            }
            let read = file.read(&mut chunk).map_err(load_error)?;
            if read == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..read]);
            (self.sink)(LoadEvent::Progress {
                id,
                loaded: bytes.len() as u64,
                total,
            });
        }
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc;
    use std::time::Duration;

    fn channel_loader(cache: AssetCache) -> (FileLoader, mpsc::Receiver<LoadEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sink: LoadEventSink = Arc::new(move |event: LoadEvent| {
            let _ = tx.lock().send(event);
        });
        (FileLoader::new(cache, sink), rx)
    }

    fn wait_terminal(rx: &mpsc::Receiver<LoadEvent>) -> LoadEvent {
        loop {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if !matches!(event, LoadEvent::Progress { .. }) {
                return event;
            }
        }
    }

    #[test]
    fn loads_obj_files_with_progress_and_caches_them() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("tri.obj")).unwrap();
        writeln!(file, "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3").unwrap();

        let cache = AssetCache::new(4);
        let (loader, rx) = channel_loader(cache.clone());
        let mut loader = loader.with_root(dir.path());
        loader.load(LoadRequest {
            id: LoadId(1),
            source: AssetSource::new("tri.obj"),
        });

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(first, LoadEvent::Progress { id: LoadId(1), total: Some(_), .. }));
        match wait_terminal(&rx) {
            LoadEvent::Completed { id, asset } => {
                assert_eq!(id, LoadId(1));
                assert_eq!(asset.vertex_count(), 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(cache.len(), 1);

        loader.load(LoadRequest {
            id: LoadId(2),
            source: AssetSource::new("tri.obj"),
        });
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            LoadEvent::Completed { id: LoadId(2), .. }
        ));
    }

    #[test]
    fn missing_files_fail() {
        let (mut loader, rx) = channel_loader(AssetCache::default());
        loader.load(LoadRequest {
            id: LoadId(7),
            source: AssetSource::new("/definitely/not/here.obj"),
        });
        match wait_terminal(&rx) {
            LoadEvent::Failed { id, error } => {
                assert_eq!(id, LoadId(7));
                assert!(matches!(error, ViewerError::AssetLoad { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn requests_without_a_worker_fail_and_leave_no_trace() {
        let (loader, rx) = channel_loader(AssetCache::default());
        loader
            .in_flight
            .lock()
            .begin(LoadId(3), Arc::new(AtomicBool::new(false)));

        loader.abandon(
            LoadId(3),
            std::io::Error::new(std::io::ErrorKind::OutOfMemory, "no threads left"),
        );

        assert_eq!(loader.in_flight(), 0);
        match rx.try_recv().unwrap() {
            LoadEvent::Failed { id, error } => {
                assert_eq!(id, LoadId(3));
                assert!(matches!(error, ViewerError::Io(_)));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn loaders_sharing_a_cache_decode_each_model_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("tri.obj")).unwrap();
        writeln!(file, "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3").unwrap();

        let cache = AssetCache::new(4);
        let (first, first_rx) = channel_loader(cache.clone());
        let (second, second_rx) = channel_loader(cache.clone());
        let (mut first, mut second) = (first.with_root(dir.path()), second.with_root(dir.path()));

        first.load(LoadRequest {
            id: LoadId(1),
            source: AssetSource::new("tri.obj"),
        });
        let LoadEvent::Completed { asset: decoded, .. } = wait_terminal(&first_rx) else {
            panic!("first load failed");
        };

        second.load(LoadRequest {
            id: LoadId(1),
            source: AssetSource::new("tri.obj"),
        });
        match second_rx.try_recv().unwrap() {
            LoadEvent::Completed { asset, .. } => assert!(Arc::ptr_eq(&asset, &decoded)),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(second.in_flight(), 0);
    }
}
