use std::env;
use std::fs;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;

use model_viewer::headless::{HeadlessContainer, HeadlessEngine, ManualScheduler};
use model_viewer::{
    discover_viewers, AssetCache, AssetSource, Collaborators, InteractionMode, LoadEvent,
    ModelViewerSession, SessionState, SignalLog, ViewerConfig, ViewerSignal,
};

const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
fn run() -> Result<()> {
    use model_viewer::app::{run_window, AppOptions, WindowInitError};

    match CliOptions::parse(env::args().skip(1))? {
        Command::Scan { page } => scan(&page),
        Command::View(options) if options.summary_only => run_headless(&options),
        Command::View(options) => {
            let app_options = AppOptions::new(options.source.clone(), options.config.clone());
            match run_window(app_options) {
                Ok(report) => {
                    println!(
                        "Viewer closed after {} frames ({})",
                        report.frames_rendered, report.state
                    );
                    if let Some(ViewerSignal::Error { description, .. }) = report.outcome {
                        bail!("failed to load {}: {description}", options.source);
                    }
                    Ok(())
                }
                Err(err) if err.downcast_ref::<WindowInitError>().is_some() => {
                    eprintln!(
                        "{err}. Falling back to --summary-only mode (set DISPLAY or install X11 libs to enable rendering)."
                    );
                    run_headless(&options)
                }
                Err(err) => Err(err),
            }
        }
    }
}

/// Runs a full session against in-memory collaborators: load, a fixed
/// number of frames, dispose.
#[cfg(not(target_arch = "wasm32"))]
fn run_headless(options: &ViewOptions) -> Result<()> {
    use model_viewer::loader::{FileLoader, LoadEventSink};

    let (tx, rx) = mpsc::channel::<LoadEvent>();
    let tx = Mutex::new(tx);
    let sink: LoadEventSink = Arc::new(move |event: LoadEvent| {
        let _ = tx.lock().send(event);
    });

    let engine = HeadlessEngine::new(true);
    let probe = engine.probe();
    let scheduler = ManualScheduler::new();
    let signals = SignalLog::new();
    let mut session = ModelViewerSession::new(
        options.source.clone(),
        options.config.clone(),
        Collaborators {
            engine: Box::new(engine),
            container: Box::new(HeadlessContainer::new(1280, 720)),
            scheduler: Box::new(scheduler.clone()),
            loader: Box::new(FileLoader::new(AssetCache::default(), sink)),
            signals: Box::new(signals.clone()),
        },
    )?;

    let step = 1000.0 / f64::from(options.config.target_frame_rate);
    let mut now = 0.0;
    while session.state() == SessionState::Loading {
        let event = rx
            .recv_timeout(LOAD_TIMEOUT)
            .map_err(|_| anyhow!("timed out loading {}", options.source))?;
        session.handle_load_event(event);
        if let Some(handle) = scheduler.take_next() {
            now += step;
            session.on_frame(handle, now);
        }
    }

    if session.state() == SessionState::Error {
        let description = session.last_error().unwrap_or("unknown error").to_string();
        session.dispose();
        bail!("failed to load {}: {description}", options.source);
    }

    let summary = session
        .asset()
        .map(|asset| asset.summary())
        .context("session finished loading without a model")?;
    println!(
        "Loaded {}: {} meshes, {} vertices",
        summary.source, summary.mesh_count, summary.vertex_count
    );
    let size = summary.normalized_bounds.size();
    println!(
        "Normalized size: {:.2} x {:.2} x {:.2}",
        size.x, size.y, size.z
    );
    if !summary.animations.is_empty() {
        println!("Animations: {}", summary.animations.join(", "));
    }

    for _ in 0..options.frames {
        let Some(handle) = scheduler.take_next() else {
            break;
        };
        now += step;
        session.on_frame(handle, now);
    }
    let yaw = session
        .asset()
        .map(|asset| asset.transform().yaw)
        .unwrap_or_default();
    println!(
        "Rendered {} frames at {} fps (yaw {yaw:.3} rad)",
        session.frames_rendered(),
        options.config.target_frame_rate
    );

    session.dispose();
    let progress = signals.count(|s| matches!(s, ViewerSignal::Progress { .. }));
    println!(
        "Disposed cleanly ({} progress updates, {} resources left)",
        progress,
        probe.live_resources()
    );
    Ok(())
}

fn scan(page: &str) -> Result<()> {
    let markup =
        fs::read_to_string(page).with_context(|| format!("failed to read page {page}"))?;
    let specs = discover_viewers(&markup)?;
    println!("Found {} viewer container(s)", specs.len());
    for spec in &specs {
        println!(
            " - #{} {} ({}, {:?}, auto-rotate {}, {} fps)",
            spec.id,
            spec.source,
            if spec.hero { "hero" } else { "model" },
            spec.config.interaction,
            if spec.config.auto_rotate { "on" } else { "off" },
            spec.config.target_frame_rate
        );
    }
    Ok(())
}

enum Command {
    View(ViewOptions),
    Scan { page: String },
}

struct ViewOptions {
    source: AssetSource,
    config: ViewerConfig,
    summary_only: bool,
    frames: u32,
}

struct CliOptions;

impl CliOptions {
    const USAGE: &'static str = "Usage: model-viewer <model.obj | builtin:NAME> [--summary-only] [--fps N] [--frames N] [--no-auto-rotate] [--interaction orbit|drag|none]\n       model-viewer --scan <page.html>";

    fn parse(args: impl IntoIterator<Item = String>) -> Result<Command> {
        let mut args = args.into_iter();
        let Some(first) = args.next() else {
            return Err(anyhow!(Self::USAGE));
        };
        if first == "--scan" {
            let page = args
                .next()
                .ok_or_else(|| anyhow!("--scan expects a page path\n{}", Self::USAGE))?;
            return Ok(Command::Scan { page });
        }
        if first.starts_with("--") {
            return Err(anyhow!("expected a model path before {first}\n{}", Self::USAGE));
        }

        let mut config = ViewerConfig::default();
        let mut summary_only = false;
        let mut frames = 60;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--summary-only" => summary_only = true,
                "--no-auto-rotate" => config.auto_rotate = false,
                "--fps" => {
                    config.target_frame_rate = next_value(&mut args, "--fps")?;
                }
                "--frames" => frames = next_value(&mut args, "--frames")?,
                "--interaction" => {
                    let value: String = next_value(&mut args, "--interaction")?;
                    config.interaction = InteractionMode::parse(&value)
                        .ok_or_else(|| anyhow!("unknown interaction mode `{value}`"))?;
                }
                other => {
                    return Err(anyhow!("Unknown argument: {other}\n{}", Self::USAGE));
                }
            }
        }

        let source = AssetSource::new(first);
        if source.is_empty() {
            return Err(anyhow!("model path is empty\n{}", Self::USAGE));
        }
        config.validate()?;
        Ok(Command::View(ViewOptions {
            source,
            config,
            summary_only,
            frames,
        }))
    }
}

fn next_value<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<T> {
    let value = args
        .next()
        .ok_or_else(|| anyhow!("{flag} expects a value"))?;
    value
        .parse()
        .map_err(|_| anyhow!("invalid value `{value}` for {flag}"))
}
