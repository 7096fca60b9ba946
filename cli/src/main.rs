use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use viewfinder_core::{
    camera::{CameraFrame, FrameSource, ImageSequence, RgbFrame},
    config::ViewfinderConfig,
    controller::{ViewfinderController, ViewfinderEvent},
    detection::YoloDetector,
    geometry::{Dimensions, OverlayFit, Rotation, Transform},
    pipeline::DetectionOrchestrator,
    rendering::{CaptionStyle, ImageCanvas, OverlayRenderer, PreviewCompositor},
    runtime::{Viewfinder, configure_ort_dylib},
};

/// Display id the replayed view lives on.
const MAIN_DISPLAY: u32 = 0;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "viewfinder",
    version,
    about = "Live viewfinder with an object-detection overlay",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a video or a directory of stills as a live camera and save the
    /// annotated viewfinder.
    Replay {
        /// Input video file or directory of images
        #[arg(short, long)]
        input: PathBuf,

        /// YOLOv8 ONNX model path
        #[arg(long, default_value = "yolov8n.onnx")]
        model: PathBuf,

        /// Output directory of PNG frames, or a video file (.mp4/.mkv/.mov)
        #[arg(short, long, default_value = "viewfinder-out")]
        output: PathBuf,

        /// Buffer rotation in degrees clockwise (0, 90, 180, 270)
        #[arg(long, default_value = "0")]
        rotation: Rotation,

        /// Viewfinder size, e.g. 1080x1920. Defaults to the upright frame size
        #[arg(long)]
        view: Option<Dimensions>,

        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Frame rate for image directories, or to override the video's rate
        #[arg(long)]
        fps: Option<f64>,

        /// Feed frames as fast as they decode instead of at camera rate
        #[arg(long)]
        fast: bool,

        /// Detection timeout in milliseconds (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Clear the overlay when a frame fails instead of keeping old boxes
        #[arg(long)]
        clear_on_failure: bool,
    },

    /// Run detection once on a still image and save it annotated.
    Detect {
        /// Input image path
        #[arg(short, long)]
        input: PathBuf,

        /// YOLOv8 ONNX model path
        #[arg(long, default_value = "yolov8n.onnx")]
        model: PathBuf,

        /// Annotated output image
        #[arg(short, long, default_value = "detected.png")]
        output: PathBuf,

        /// Rotation of the input image in degrees clockwise
        #[arg(long, default_value = "0")]
        rotation: Rotation,

        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the preview transform and overlay fit for a layout as JSON.
    Fit {
        /// Camera buffer size, e.g. 1920x1080
        #[arg(long)]
        buffer: Dimensions,

        /// View size, e.g. 1080x1920
        #[arg(long)]
        view: Dimensions,

        /// Buffer rotation in degrees clockwise
        #[arg(long, default_value = "0")]
        rotation: Rotation,

        /// Analysis image size; defaults to the upright buffer size
        #[arg(long)]
        image: Option<Dimensions>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            input,
            model,
            output,
            rotation,
            view,
            config,
            fps,
            fast,
            timeout_ms,
            clear_on_failure,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(ms) = timeout_ms {
                config.detection.timeout_ms = ms;
            }
            config.detection.clear_overlay_on_failure |= clear_on_failure;
            cmd_replay(ReplayArgs {
                input,
                model,
                output,
                rotation,
                view,
                fps,
                paced: !fast,
                config,
            })
        }
        Commands::Detect {
            input,
            model,
            output,
            rotation,
            config,
        } => cmd_detect(input, model, output, rotation, load_config(config.as_deref())?),
        Commands::Fit {
            buffer,
            view,
            rotation,
            image,
        } => cmd_fit(buffer, view, rotation, image),
    }
}

fn load_config(path: Option<&Path>) -> Result<ViewfinderConfig> {
    match path {
        Some(path) => ViewfinderConfig::load(path),
        None => Ok(ViewfinderConfig::default()),
    }
}

// ── replay ────────────────────────────────────────────────────────────────────

struct ReplayArgs {
    input: PathBuf,
    model: PathBuf,
    output: PathBuf,
    rotation: Rotation,
    view: Option<Dimensions>,
    fps: Option<f64>,
    paced: bool,
    config: ViewfinderConfig,
}

#[derive(Serialize)]
struct ReplaySummary {
    frames: u64,
    released: u64,
    redraws: u64,
    #[serde(flatten)]
    stats: viewfinder_core::runtime::ViewfinderStats,
}

fn cmd_replay(args: ReplayArgs) -> Result<()> {
    info!("Replay");
    info!("  input    : {}", args.input.display());
    info!("  output   : {}", args.output.display());
    info!("  rotation : {}", args.rotation);

    let mut source = open_source(&args.input, args.fps)?;
    let fps = args.fps.or(source.frame_rate()).unwrap_or(30.0);
    let mut sink = open_sink(&args.output, fps)?;

    configure_ort_dylib();
    let detector = YoloDetector::load(&args.model, &args.config.detection)
        .with_context(|| format!("failed to load model: {}", args.model.display()))?;

    let redraws = Arc::new(AtomicU64::new(0));
    let overlay = {
        let redraws = Arc::clone(&redraws);
        let style = CaptionStyle::from_config(&args.config.overlay).context("invalid overlay style")?;
        Arc::new(OverlayRenderer::new(style).with_redraw(Arc::new(move || {
            redraws.fetch_add(1, Ordering::Relaxed);
        })))
    };
    let viewfinder = Viewfinder::start(detector, Arc::clone(&overlay), &args.config)?;

    // The view is laid out once, sized from the first frame unless given.
    let Some(first) = source.next_frame()? else {
        bail!("{} has no frames", args.input.display());
    };
    let view = args
        .view
        .unwrap_or_else(|| args.rotation.apply(first.dimensions()));
    let compositor = Arc::new(PreviewCompositor::new(view));
    let mut controller = ViewfinderController::new(MAIN_DISPLAY).with_preview(compositor.clone());
    controller.add_sink(overlay.clone());
    controller.handle(ViewfinderEvent::ViewLayoutChanged {
        size: view,
        rotation: Some(args.rotation),
    });
    info!("  view     : {view}");

    let released = Arc::new(AtomicU64::new(0));
    let pb = match source.frame_count() {
        Some(total) => progress_bar(total, "Replaying…"),
        None => spinner("Replaying…"),
    };
    let started = Instant::now();
    let interval = Duration::from_secs_f64(1.0 / fps.max(1.0));
    let mut sequence = 0u64;
    let mut pending = Some(first);

    loop {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => match source.next_frame()? {
                Some(frame) => frame,
                None => break,
            },
        };
        if args.paced {
            let due = started + interval.mul_f64(sequence as f64);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                std::thread::sleep(wait);
            }
        }

        controller.handle(ViewfinderEvent::BufferChanged {
            size: frame.dimensions(),
            rotation: Some(args.rotation),
        });

        let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .context("decoded frame buffer is truncated")?;
        let counter = Arc::clone(&released);
        viewfinder.submit(
            CameraFrame::new(frame, args.rotation, sequence).with_release_hook(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );

        let shown = render_view(&compositor, &overlay, &image);
        sink.write(sequence, &shown)?;
        sequence += 1;
        pb.inc(1);
    }

    controller.handle(ViewfinderEvent::Detached);
    let stats = viewfinder.shutdown()?;
    sink.finish()?;
    pb.finish_with_message("Done.");

    let summary = ReplaySummary {
        frames: sequence,
        released: released.load(Ordering::Relaxed),
        redraws: redraws.load(Ordering::Relaxed),
        stats,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.released != summary.frames {
        warn!(frames = summary.frames, released = summary.released, "not every frame was released");
    }
    Ok(())
}

/// What the viewfinder shows: the preview plus the overlay on top of it.
fn render_view(compositor: &PreviewCompositor, overlay: &OverlayRenderer, buffer: &RgbImage) -> RgbImage {
    let preview = compositor.compose(buffer);
    let mut canvas = ImageCanvas::from_rgb(&preview);
    overlay.draw(&mut canvas);
    canvas.into_rgb()
}

fn open_source(input: &Path, fps: Option<f64>) -> Result<Box<dyn FrameSource>> {
    if input.is_dir() {
        return Ok(Box::new(ImageSequence::open(input, fps)?));
    }
    open_video_source(input)
}

#[cfg(feature = "video")]
fn open_video_source(input: &Path) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(viewfinder_core::video::VideoSource::open(input)?))
}

#[cfg(not(feature = "video"))]
fn open_video_source(input: &Path) -> Result<Box<dyn FrameSource>> {
    bail!(
        "{} is not a directory; rebuild with `--features video` to replay video files",
        input.display()
    )
}

enum FrameSink {
    Pngs(PathBuf),
    #[cfg(feature = "video")]
    Video(viewfinder_core::video::VideoWriter),
}

fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "mp4" | "mkv" | "mov"))
}

fn open_sink(output: &Path, fps: f64) -> Result<FrameSink> {
    if is_video_path(output) {
        return open_video_sink(output, fps);
    }
    fs::create_dir_all(output)
        .with_context(|| format!("failed to create output directory {}", output.display()))?;
    Ok(FrameSink::Pngs(output.to_path_buf()))
}

#[cfg(feature = "video")]
fn open_video_sink(output: &Path, fps: f64) -> Result<FrameSink> {
    Ok(FrameSink::Video(viewfinder_core::video::VideoWriter::create(output, fps)?))
}

#[cfg(not(feature = "video"))]
fn open_video_sink(output: &Path, fps: f64) -> Result<FrameSink> {
    bail!(
        "cannot write {} at {fps} fps; rebuild with `--features video` or pass a directory",
        output.display()
    )
}

impl FrameSink {
    fn write(&mut self, sequence: u64, image: &RgbImage) -> Result<()> {
        match self {
            FrameSink::Pngs(dir) => {
                let path = dir.join(format!("frame_{sequence:06}.png"));
                image
                    .save(&path)
                    .with_context(|| format!("failed to write {}", path.display()))
            }
            #[cfg(feature = "video")]
            FrameSink::Video(writer) => {
                writer.write_frame(&RgbFrame::from_image(image.clone(), sequence as i64))
            }
        }
    }

    fn finish(self) -> Result<()> {
        match self {
            FrameSink::Pngs(_) => Ok(()),
            #[cfg(feature = "video")]
            FrameSink::Video(writer) => writer.finish().map(|_| ()),
        }
    }
}

// ── detect ────────────────────────────────────────────────────────────────────

fn cmd_detect(
    input: PathBuf,
    model: PathBuf,
    output: PathBuf,
    rotation: Rotation,
    config: ViewfinderConfig,
) -> Result<()> {
    info!("Single-frame detection");

    let image = image::open(&input)
        .with_context(|| format!("failed to open image: {}", input.display()))?
        .into_rgb8();

    configure_ort_dylib();
    let detector = YoloDetector::load(&model, &config.detection)
        .with_context(|| format!("failed to load model: {}", model.display()))?;
    let mut orchestrator = DetectionOrchestrator::with_config(detector, &config.detection)?;

    let frame = CameraFrame::new(RgbFrame::from_image(image, 0), rotation, 0);
    let upright = frame
        .image
        .upright(rotation)
        .context("input image buffer is truncated")?;
    let result = orchestrator
        .analyze(frame)
        .context("detection failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    let style = CaptionStyle::from_config(&config.overlay).context("invalid overlay style")?;
    let overlay = OverlayRenderer::new(style);
    overlay.set_view_size(upright.width(), upright.height());
    overlay.apply(result);

    let mut canvas = ImageCanvas::from_rgb(&upright);
    overlay.draw(&mut canvas);
    canvas
        .into_rgb()
        .save(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("annotated image saved to {}", output.display());
    Ok(())
}

// ── fit ───────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct FitReport {
    transform: Transform,
    /// Preview matrix, row-major.
    matrix: [[f32; 3]; 3],
    image: Dimensions,
    overlay_fit: Option<OverlayFit>,
}

fn cmd_fit(
    buffer: Dimensions,
    view: Dimensions,
    rotation: Rotation,
    image: Option<Dimensions>,
) -> Result<()> {
    let Some(transform) = Transform::compute(buffer, view, rotation) else {
        bail!("buffer {buffer} and view {view} must both be non-zero");
    };
    let m = transform.matrix();
    let image = image.unwrap_or_else(|| rotation.apply(buffer));
    let report = FitReport {
        transform,
        matrix: [0, 1, 2].map(|r| [m[(r, 0)], m[(r, 1)], m[(r, 2)]]),
        image,
        overlay_fit: OverlayFit::compute(image, view),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn progress_bar(total: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{msg} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} frames ({eta})",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.set_message(msg.to_string());
    pb
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}] {pos} frames") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}
