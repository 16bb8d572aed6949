use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use face_kiosk::recognition::DEFAULT_FACEBOX_URL;
use face_kiosk::server::{self, AppState};
use face_kiosk::{
    Annotator, FaceboxClient, FrameSource, KioskConfig, KioskError, KioskLoop, LabelPolicy,
    LatestFrame, PollySpeechClient, PreviewPublisher, PreviewSink, PublishMode, PublisherConfig,
    SpeechConfig, StreamSink, TestPatternSource,
};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Webcam through OpenCV
    Camera,
    /// Synthetic test pattern
    Pattern,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address the HTTP server listens on
    #[arg(long, default_value = "localhost:8090")]
    listen_addr: String,

    /// Where frames come from
    #[arg(long, value_enum, default_value_t = SourceKind::Camera)]
    source: SourceKind,

    /// Camera device index
    #[arg(short, long, default_value_t = 0)]
    device: i32,

    /// Requested capture width
    #[arg(long)]
    width: Option<u32>,

    /// Requested capture height
    #[arg(long)]
    height: Option<u32>,

    /// Frame rate of the test pattern
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Base URL of the Facebox recognition service
    #[arg(long, env = "FACEBOX_URL", default_value = DEFAULT_FACEBOX_URL)]
    facebox_url: String,

    /// Recognition request timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    recognition_timeout_ms: u64,

    /// Only stream video, never call the recognition service from the loop
    #[arg(long)]
    no_recognition: bool,

    /// Run a cascade classifier on every frame
    #[arg(long)]
    detect_faces: bool,

    /// Cascade file, or a name found through OpenCV's sample path
    #[arg(long, default_value = "haarcascades/haarcascade_frontalface_default.xml")]
    cascade: String,

    /// Where annotated frames go
    #[arg(long, value_enum, default_value_t = PublishMode::HttpStream)]
    publish_mode: PublishMode,

    /// JPEG quality for stream and recognition
    #[arg(long, default_value_t = 80)]
    jpeg_quality: u8,

    /// Disconnect preview clients that accept nothing for this long
    #[arg(long, default_value_t = 5000)]
    stall_timeout_ms: u64,

    /// Polly voice
    #[arg(long, default_value = "Nicole")]
    tts_voice: String,

    /// Polly output format
    #[arg(long, default_value = "mp3")]
    tts_format: String,

    /// Key expression for zenoh publishing
    #[cfg(feature = "zenoh")]
    #[arg(long, default_value = face_kiosk::sink::DEFAULT_ZENOH_KEY)]
    zenoh_key: String,

    /// Endpoints to connect to.
    #[cfg(feature = "zenoh")]
    #[clap(short = 'e', long)]
    connect: Vec<zenoh_config::EndPoint>,

    /// Endpoints to listen on.
    #[cfg(feature = "zenoh")]
    #[clap(long)]
    listen: Vec<zenoh_config::EndPoint>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    tracing::info!("face-kiosk starting");

    // no camera, no kiosk
    let source = open_source(&args).context("can't find camera")?;
    let (width, height) = source.resolution();
    tracing::info!("Capture: {}x{}", width, height);

    let publisher = PreviewPublisher::new(PublisherConfig {
        stall_timeout: Duration::from_millis(args.stall_timeout_ms),
        ..Default::default()
    });
    let sink = open_sink(&args, &publisher).context("Failed to initialize preview output")?;

    let recognizer = Arc::new(FaceboxClient::new(
        &args.facebox_url,
        Duration::from_millis(args.recognition_timeout_ms),
    )?);
    let speech = Arc::new(
        PollySpeechClient::from_env(&SpeechConfig {
            voice: args.tts_voice.clone(),
            format: args.tts_format.clone(),
            ..Default::default()
        })
        .await,
    );
    let policy = LabelPolicy::default();
    let latest = LatestFrame::default();

    let config = KioskConfig {
        enable_recognition: !args.no_recognition,
        jpeg_quality: args.jpeg_quality,
        ..Default::default()
    };
    let mut kiosk = KioskLoop::new(
        source,
        recognizer.clone(),
        sink,
        Annotator::new(policy.clone()),
        Handle::current(),
        config,
    )
    .with_latest_frame(latest.clone());
    if args.detect_faces {
        kiosk = kiosk.with_detector(open_detector(&args.cascade)?);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let (loop_done_tx, loop_done_rx) = oneshot::channel::<()>();
    let kiosk_thread = std::thread::Builder::new()
        .name("kiosk-loop".into())
        .spawn({
            let stop = stop.clone();
            move || {
                let result = kiosk.run(&stop);
                let _ = loop_done_tx.send(());
                result
            }
        })
        .context("Failed to spawn kiosk loop thread")?;

    let shutdown = {
        let stop = stop.clone();
        let publisher = publisher.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl-C received"),
                _ = loop_done_rx => tracing::warn!("Kiosk loop stopped"),
            }
            stop.store(true, Ordering::Relaxed);
            publisher.close();
        }
    };

    let state = AppState {
        publisher,
        latest,
        recognizer,
        speech,
        policy: Arc::new(policy),
        jpeg_quality: args.jpeg_quality,
    };
    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen_addr))?;
    server::serve(listener, state, shutdown).await?;

    kiosk_thread
        .join()
        .map_err(|_| anyhow!("kiosk loop panicked"))??;
    tracing::info!("face-kiosk stopped");
    Ok(())
}

fn open_source(args: &Args) -> anyhow::Result<Box<dyn FrameSource>> {
    match args.source {
        SourceKind::Pattern => Ok(Box::new(TestPatternSource::new(
            args.width.unwrap_or(640),
            args.height.unwrap_or(480),
            args.fps,
        )?)),
        SourceKind::Camera => open_camera(args),
    }
}

#[cfg(feature = "opencv")]
fn open_camera(args: &Args) -> anyhow::Result<Box<dyn FrameSource>> {
    let resolution = args.width.zip(args.height);
    Ok(Box::new(face_kiosk::CameraSource::new(args.device, resolution)?))
}

#[cfg(not(feature = "opencv"))]
fn open_camera(_args: &Args) -> anyhow::Result<Box<dyn FrameSource>> {
    Err(KioskError::Unsupported("camera capture", "opencv").into())
}

#[cfg(feature = "opencv")]
fn open_detector(cascade: &str) -> anyhow::Result<Box<dyn face_kiosk::RegionDetector>> {
    Ok(Box::new(face_kiosk::CascadeDetector::new(cascade)?))
}

#[cfg(not(feature = "opencv"))]
fn open_detector(_cascade: &str) -> anyhow::Result<Box<dyn face_kiosk::RegionDetector>> {
    Err(KioskError::Unsupported("face detection", "opencv").into())
}

fn open_sink(args: &Args, publisher: &PreviewPublisher) -> anyhow::Result<Box<dyn PreviewSink>> {
    tracing::info!("Publish mode {:?}", args.publish_mode);
    match args.publish_mode {
        PublishMode::HttpStream => Ok(Box::new(StreamSink::new(
            publisher.clone(),
            args.jpeg_quality,
        ))),
        PublishMode::LocalWindow => open_window(),
        PublishMode::Zenoh => open_zenoh(args),
    }
}

#[cfg(feature = "opencv")]
fn open_window() -> anyhow::Result<Box<dyn PreviewSink>> {
    Ok(Box::new(face_kiosk::LocalWindow::new("face kiosk")?))
}

#[cfg(not(feature = "opencv"))]
fn open_window() -> anyhow::Result<Box<dyn PreviewSink>> {
    Err(KioskError::Unsupported("local window", "opencv").into())
}

#[cfg(feature = "zenoh")]
fn open_zenoh(args: &Args) -> anyhow::Result<Box<dyn PreviewSink>> {
    let config = face_kiosk::sink::peer_config(&args.connect, &args.listen);
    Ok(Box::new(face_kiosk::ZenohSink::new(
        config,
        &args.zenoh_key,
        args.jpeg_quality,
    )?))
}

#[cfg(not(feature = "zenoh"))]
fn open_zenoh(_args: &Args) -> anyhow::Result<Box<dyn PreviewSink>> {
    Err(KioskError::Unsupported("zenoh publishing", "zenoh").into())
}
