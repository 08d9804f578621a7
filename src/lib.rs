pub mod capture;
pub mod coords;
pub mod dnn;
pub mod error;
pub mod imgproc;
pub mod params;
pub mod pipeline;
pub mod serial;
pub mod threadpool;
#[cfg(feature = "v4l2")]
pub mod utils;

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use capture::{CaptureConfig, OutputConfig};
use dnn::DnnConfig;
use params::ParameterRegistry;
use pipeline::PipelineConfig;
use serial::SerialConfig;
use threadpool::ThreadsConfig;

pub use error::{Error, Result};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    pub dnn: DnnConfig,
    pub pipeline: PipelineConfig,
    pub serial: SerialConfig,
    pub threads: ThreadsConfig,
}

impl Config {
    /// Reads `path` (TOML) if given, then `IRIS__SECTION__KEY` overrides
    /// from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let cfg = builder
            .add_source(
                config::Environment::with_prefix("IRIS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

fn tunable<T>(
    reg: &ParameterRegistry,
    path: &str,
    description: &str,
    default: T,
    range: (T, T),
    apply: fn(&mut Config, T),
) -> Result<()>
where
    T: FromStr + PartialOrd + Display + Copy + Send + Sync + 'static,
    T::Err: Display,
{
    reg.register(path, description, default, Some(range))?;
    reg.on_commit(
        path,
        Arc::new(move |new: &str| match new.trim().parse::<T>() {
            Ok(v) => {
                CONFIG.rcu(|cur| {
                    let mut cfg = Config::clone(cur);
                    apply(&mut cfg, v);
                    cfg
                });
            }
            Err(e) => warn!("{new}: not published: {e}"),
        }),
    )
}

/// Registers the settings that may change while frames are flowing. A
/// committed `set` is published through [`CONFIG`]; a value rejected by any
/// change callback never is.
pub fn register_tunables(reg: &ParameterRegistry) -> Result<()> {
    let cfg = CONFIG.load();
    let post = &cfg.dnn.postprocessor;
    tunable(reg, "dnn.postprocessor.cthresh", "Classification threshold, percent", post.cthresh, (0.0, 100.0), |c, v| {
        c.dnn.postprocessor.cthresh = v
    })?;
    tunable(reg, "dnn.postprocessor.dthresh", "Detection box threshold, percent", post.dthresh, (0.0, 100.0), |c, v| {
        c.dnn.postprocessor.dthresh = v
    })?;
    tunable(reg, "dnn.postprocessor.nms", "Non-maximum suppression IoU, percent", post.nms, (0.0, 100.0), |c, v| {
        c.dnn.postprocessor.nms = v
    })?;
    tunable(reg, "dnn.postprocessor.top", "Maximum recognitions reported", post.top, (1, 1000), |c, v| {
        c.dnn.postprocessor.top = v
    })?;
    tunable(reg, "serial.prec", "Decimals in serial messages", cfg.serial.prec, (0, 6), |c, v| c.serial.prec = v)?;
    Ok(())
}
