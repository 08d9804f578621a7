//! Iris machine-vision runtime: capture, DNN pipeline and serial reporting

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use iris::capture::{self, ColorOrder, InputFrame, OutputFrame, VideoInput};
use iris::dnn::{self, Network};
use iris::imgproc::Interp;
use iris::params::ParameterRegistry;
use iris::pipeline::Pipeline;
use iris::serial::{SerialQueue, SerialReporter};
use iris::Config;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("iris=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Iris launching...");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    #[allow(unused_mut)]
    let mut config = Config::load(path.as_deref())?;

    #[cfg(feature = "v4l2")]
    if config.capture.source == capture::SourceKind::V4l2 && config.capture.device.is_empty() {
        let (device, format) = iris::utils::auto_detect_device()?;
        config.capture.device = device;
        config.capture.format = format;
    }
    iris::CONFIG.store(Arc::new(config.clone()));

    let params = ParameterRegistry::new();
    iris::register_tunables(&params)?;

    let input: Arc<dyn VideoInput> = Arc::from(capture::open(&config.capture)?);
    let (camw, camh, fmt, fps) = input.format();
    info!("Capturing {camw}x{camh} {fmt} @ {fps} fps");

    let net = match dnn::create_backend(&config.dnn.network)? {
        Some(backend) => Some(Network::new(backend, &config.dnn.network)?),
        None => {
            warn!("No network configured, frames are captured only");
            None
        }
    };
    let mut pipeline = Pipeline::from_config(&config.dnn, net, config.pipeline.clone())?;
    let output = capture::open_output(&config.output)?;

    let (queue, messages) = SerialQueue::new(config.serial.queue);
    let reporter = config
        .serial
        .enabled
        .then(|| SerialReporter::new(config.serial.style, config.serial.prec, queue));
    let writer = tokio::task::spawn_blocking(move || {
        let mut out = std::io::stdout().lock();
        for msg in messages.iter() {
            if let Err(e) = writeln!(out, "{msg}").and_then(|_| out.flush()) {
                error!("Serial write failed: {e}");
                break;
            }
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    {
        let (running, input) = (running.clone(), input.clone());
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping capture");
                running.store(false, Ordering::SeqCst);
                input.abort_stream();
            }
        });
    }

    input.stream_on()?;
    if let Some(out) = &output {
        out.stream_on()?;
    }

    let worker = {
        let input = input.clone();
        tokio::task::spawn_blocking(move || -> iris::Result<()> {
            while running.load(Ordering::SeqCst) {
                let mut frame = InputFrame::new(input.as_ref());
                let shown = match &output {
                    Some(_) => frame.getp().ok(),
                    None => None,
                };

                if let Some(results) = pipeline.run_frame(&mut frame) {
                    if let Some(reporter) = &reporter {
                        if let Err(e) = reporter.report(results, camw, camh) {
                            warn!("Reporting failed: {e}");
                        }
                    }
                }
                drop(frame);

                if let (Some(out), Some(img)) = (&output, shown) {
                    let mut oframe = OutputFrame::new(out.as_ref());
                    let (w, h) = match oframe.get() {
                        Ok(o) => (o.width, o.height),
                        Err(e) if e.is_cancelled() => break,
                        Err(e) => return Err(e),
                    };
                    oframe.send_packed(&img.resize(w, h, Interp::Linear)?, ColorOrder::Rgb)?;
                }
            }
            let stats = pipeline.stats();
            info!(
                "{} frames, {} processed, {} errors, {} late",
                stats.frames, stats.processed, stats.errors, stats.late
            );
            if let Some(out) = &output {
                out.stream_off()?;
            }
            Ok(())
        })
    };

    let res = worker.await.map_err(|e| eyre!("pipeline task failed: {e}"))?;
    input.stream_off()?;
    writer.await.map_err(|e| eyre!("serial task failed: {e}"))?;
    res?;

    info!("Iris shutting down");
    Ok(())
}
