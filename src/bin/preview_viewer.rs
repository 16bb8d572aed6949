use std::time::Instant;

use clap::Parser;
use face_kiosk::detector::jpeg_to_mat;
use face_kiosk::sink::{peer_config, DEFAULT_ZENOH_KEY};
use face_kiosk::ErrorWrapper;
use opencv::highgui;
use zenoh::prelude::r#async::*;

/// Shows the annotated kiosk preview published over zenoh.
#[derive(Parser, Debug)]
#[command()]
struct Args {
    /// Endpoints to connect to.
    #[clap(short = 'e', long)]
    connect: Vec<zenoh_config::EndPoint>,

    /// Endpoints to listen on.
    #[clap(long)]
    listen: Vec<zenoh_config::EndPoint>,

    /// Key expression the kiosk publishes on
    #[clap(long, default_value = DEFAULT_ZENOH_KEY)]
    key: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();
    tracing_subscriber::fmt().with_target(false).init();

    let window = "face kiosk preview";
    highgui::named_window_def(window)?;

    let session = zenoh::open(peer_config(&args.connect, &args.listen))
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?
        .into_arc();
    let subscriber = session
        .declare_subscriber(args.key.clone())
        .best_effort()
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    tracing::info!("Watching {}", args.key);

    let mut shown: u64 = 0;
    let mut window_start = Instant::now();
    loop {
        let sample = subscriber.recv_async().await?;
        let payload: Vec<u8> = sample.value.try_into()?;

        let image = match jpeg_to_mat(&payload) {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!("Unable to decode preview frame: {}", err);
                continue;
            }
        };
        highgui::imshow(window, &image)?;
        _ = highgui::poll_key()?;

        shown += 1;
        if shown % 30 == 0 {
            let fps = 30.0 / window_start.elapsed().as_secs_f64();
            tracing::info!("Shown {} frames, {:.1} fps", shown, fps);
            window_start = Instant::now();
        }
    }
}
