//! Per-frame orchestration: pre-process, infer, post-process

pub mod ringbuf;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{InputFrame, RawImage};
use crate::dnn::postprocess::{self, PostProcessor, PostProcessorConfig, Results};
use crate::dnn::{DnnConfig, Network, PreProcessor};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Log network and pre-processor details for every frame
    pub enable_profiling: bool,
    /// Frames slower than this are counted as late
    pub target_latency_ms: u32,
    /// Rebuild the post-processor when the global configuration changes
    pub follow_config: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_profiling: false,
            target_latency_ms: 33,
            follow_config: true,
        }
    }
}

/// Frame counters of a [`Pipeline`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames handed to the pipeline
    pub frames: u64,
    /// Frames that produced results
    pub processed: u64,
    /// Frames skipped while the network was loading
    pub not_ready: u64,
    /// Frames whose processing failed
    pub errors: u64,
    /// Frames over the latency target
    pub late: u64,
}

pub struct Pipeline {
    pre: PreProcessor,
    net: Option<Network>,
    post: Box<dyn PostProcessor>,
    /// Set when the post-processor follows [`crate::CONFIG`]
    post_cfg: Option<PostProcessorConfig>,
    cfg: PipelineConfig,
    stats: PipelineStats,
}

impl Pipeline {
    /// Without a network, frames are only counted.
    pub fn new(pre: PreProcessor, net: Option<Network>, post: Box<dyn PostProcessor>) -> Self {
        Self {
            pre,
            net,
            post,
            post_cfg: None,
            cfg: PipelineConfig::default(),
            stats: PipelineStats::default(),
        }
    }

    /// Builds all three stages from `dnn`.
    pub fn from_config(dnn: &DnnConfig, net: Option<Network>, cfg: PipelineConfig) -> Result<Self> {
        let post = postprocess::create(&dnn.postprocessor)?;
        let mut pipeline = Self::new(PreProcessor::new(dnn.preprocessor.clone()), net, post);
        if cfg.follow_config {
            pipeline.post_cfg = Some(dnn.postprocessor.clone());
        }
        pipeline.cfg = cfg;
        Ok(pipeline)
    }

    /// Non-blocking; true once the network is loaded.
    pub fn ready(&mut self) -> Result<bool> {
        match &mut self.net {
            Some(net) => net.ready(),
            None => Ok(false),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn preprocessor(&self) -> &PreProcessor {
        &self.pre
    }

    /// Swaps in a new post-processor if its global settings changed.
    fn refresh(&mut self) {
        let Some(current) = &self.post_cfg else {
            return;
        };
        let global = crate::CONFIG.load();
        let wanted = &global.dnn.postprocessor;
        if wanted == current {
            return;
        }
        match postprocess::create(wanted) {
            Ok(post) => {
                info!("Post-processor settings changed, rebuilding");
                self.post = post;
                self.post_cfg = Some(wanted.clone());
            }
            Err(e) => {
                warn!("Keeping previous post-processor: {e}");
                self.post_cfg = Some(wanted.clone());
            }
        }
    }

    /// Runs one frame through all stages. `None` means there is nothing to
    /// report yet because no network is loaded.
    #[instrument(skip_all, fields(w = img.width, h = img.height))]
    pub fn process(&mut self, img: &RawImage) -> Result<Option<Results<'_>>> {
        self.stats.frames += 1;
        self.refresh();
        let Some(net) = self.net.as_mut() else {
            return Ok(None);
        };
        if !net.ready()? {
            self.stats.not_ready += 1;
            return Ok(None);
        }
        let start = Instant::now();

        let attrs = net.blob_attrs()?;
        let blobs = self.pre.process(img, &attrs)?;
        let outs = net.process(blobs)?;

        let post_start = Instant::now();
        self.post.process(&outs, &self.pre)?;
        metrics::histogram!("postprocess_time_us").record(post_start.elapsed().as_micros() as f64);

        let elapsed = start.elapsed();
        if elapsed > Duration::from_millis(self.cfg.target_latency_ms as u64) {
            self.stats.late += 1;
        }
        if self.cfg.enable_profiling {
            for line in self.pre.info().iter().chain(net.info()) {
                debug!("{line}");
            }
            debug!("Frame processed in {elapsed:?}");
        }
        self.stats.processed += 1;
        Ok(Some(self.post.results()))
    }

    /// Takes the next frame from `frame`, runs every stage on it and hands
    /// it back to the input before returning the results. Errors are logged
    /// and the frame is skipped.
    pub fn run_frame(&mut self, frame: &mut InputFrame<'_>) -> Option<Results<'_>> {
        let img = match frame.get() {
            Ok(img) => img,
            Err(e) => {
                if !e.is_cancelled() {
                    self.stats.errors += 1;
                    error!("Frame capture failed: {e}");
                }
                return None;
            }
        };
        let ok = match self.process(img) {
            Ok(res) => res.is_some(),
            Err(e) => {
                self.stats.errors += 1;
                error!("Frame skipped: {e}");
                false
            }
        };
        if let Err(e) = frame.done() {
            warn!("Releasing frame failed: {e}");
        }
        if ok {
            Some(self.post.results())
        } else {
            None
        }
    }
}
