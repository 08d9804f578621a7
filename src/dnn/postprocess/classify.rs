use tracing::error;

use super::{ObjReco, PostProcessor, PostProcessorConfig, Results};
use crate::dnn::preprocess::PreProcessor;
use crate::dnn::tensor::Tensor;
use crate::dnn::utils::{softmax, top_k, Labels};
use crate::error::Result;

/// Top-K classification above a confidence threshold
pub struct Classify {
    cfg: PostProcessorConfig,
    labels: Labels,
    reco: Vec<ObjReco>,
    warned: bool,
}

impl Classify {
    pub fn new(cfg: PostProcessorConfig) -> Result<Self> {
        Ok(Self {
            labels: cfg.labels()?,
            cfg,
            reco: Vec::new(),
            warned: false,
        })
    }

    /// Scores with their class ids, best first, already filtered
    pub fn decode(&self, out: &Tensor) -> Result<Vec<(i32, f32)>> {
        let data = out.require_f32("classify")?;
        let k = self.cfg.top.min(data.len());

        let top = if self.cfg.softmax {
            let mut sm = data.to_vec();
            softmax(&mut sm, 1.0, false);
            top_k(&sm, k)
        } else {
            top_k(data, k)
        };

        let fac = 100.0 * self.cfg.scorescale;
        Ok(top
            .into_iter()
            .map(|(id, p)| (id as i32 + self.cfg.classoffset, p * fac))
            .take_while(|&(_, score)| score >= self.cfg.cthresh)
            .collect())
    }
}

impl PostProcessor for Classify {
    fn process(&mut self, outs: &[Tensor], _pre: &PreProcessor) -> Result<()> {
        self.reco.clear();
        let Some(out) = outs.first() else {
            return Ok(());
        };
        if outs.len() != 1 && !self.warned {
            self.warned = true;
            error!("Expected 1 output tensor, got {} - using the first one", outs.len());
        }
        let top = self.decode(out)?;
        self.reco = top
            .into_iter()
            .map(|(id, score)| ObjReco {
                score,
                category: self.labels.get(id).into_owned(),
            })
            .collect();
        Ok(())
    }

    fn results(&self) -> Results<'_> {
        Results::Recognitions(&self.reco)
    }
}
