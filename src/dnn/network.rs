//! Uniform front for inference backends: asynchronous load, input
//! validation, auxiliary inputs and output reshaping

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::tensor::{parse_tensor_specs, Tensor, TensorAttr};
use super::utils::parse_extra_tensors;
use crate::error::{Error, Result};
use crate::threadpool::{self, TaskHandle};

/// Which backend the binary builds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// No network: frames are captured and counted only
    #[default]
    None,
    /// ONNX model through tract
    Onnx,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub backend: BackendKind,
    /// Model file
    pub model: Option<PathBuf>,
    /// Shown in the processing info
    pub comment: String,
    /// Declared inputs, overriding what the model reports
    pub intensors: String,
    /// Declared outputs, overriding what the model reports
    pub outtensors: String,
    /// Constant inputs appended after the pre-processed blobs,
    /// `TYPE:NxCxHxW:v1 v2 ...`, comma-separated
    pub extraintensors: String,
    /// New shapes for the outputs, one spec per output
    pub outreshape: String,
}

/// An inference engine behind [`Network`]
pub trait Backend: Send + 'static {
    /// Loads weights and prepares the device. May take seconds.
    fn load(&mut self) -> Result<()>;

    /// Inputs the loaded model expects, in order
    fn input_attrs(&self) -> Result<Vec<TensorAttr>>;

    fn output_attrs(&self) -> Result<Vec<TensorAttr>>;

    /// Runs one inference. Inputs have already been checked against
    /// [`input_attrs`](Self::input_attrs).
    fn execute(&mut self, inputs: &[Tensor], info: &mut Vec<String>) -> Result<Vec<Tensor>>;
}

enum LoadState {
    Idle(Box<dyn Backend>),
    Loading(TaskHandle<(Box<dyn Backend>, Result<()>)>),
    Loaded {
        backend: Box<dyn Backend>,
        inputs: Vec<TensorAttr>,
    },
    Broken(String),
}

pub struct Network {
    state: LoadState,
    comment: String,
    extra: Vec<Tensor>,
    reshape: Vec<TensorAttr>,
    info: Vec<String>,
}

impl Network {
    /// Wraps `backend`. Extra-input and reshape specs are parsed here so a
    /// malformed configuration fails before any frame is processed.
    pub fn new(backend: Box<dyn Backend>, cfg: &NetworkConfig) -> Result<Self> {
        Ok(Self {
            state: LoadState::Idle(backend),
            comment: cfg.comment.clone(),
            extra: parse_extra_tensors(&cfg.extraintensors)?,
            reshape: parse_tensor_specs(&cfg.outreshape)?,
            info: Vec::new(),
        })
    }

    /// Non-blocking readiness check. The first call starts loading on the
    /// worker pool; later calls poll it. A failed load is reported once and
    /// retried on the next call.
    pub fn ready(&mut self) -> Result<bool> {
        let state = std::mem::replace(&mut self.state, LoadState::Broken(String::new()));
        let (state, res) = match state {
            LoadState::Loaded { .. } => (state, Ok(true)),
            LoadState::Idle(mut backend) => {
                info!("Loading network...");
                let task = threadpool::big().execute(move || {
                    let res = backend.load();
                    Ok((backend, res))
                });
                (LoadState::Loading(task), Ok(false))
            }
            LoadState::Loading(task) => match task.wait_timeout(Duration::from_millis(2)) {
                None => (LoadState::Loading(task), Ok(false)),
                Some(Ok((backend, Ok(())))) => match backend.input_attrs() {
                    Ok(inputs) => {
                        info!("Network loaded.");
                        (LoadState::Loaded { backend, inputs }, Ok(true))
                    }
                    Err(e) => (LoadState::Idle(backend), Err(e)),
                },
                Some(Ok((backend, Err(e)))) => {
                    warn!("Network load failed: {e}");
                    (LoadState::Idle(backend), Err(e))
                }
                Some(Err(e)) => (LoadState::Broken(e.to_string()), Err(e)),
            },
            LoadState::Broken(msg) => {
                let err = Error::backend(format!("network unusable: {msg}"));
                (LoadState::Broken(msg), Err(err))
            }
        };
        self.state = state;
        res
    }

    fn loaded(&self) -> Result<(&dyn Backend, &[TensorAttr])> {
        match &self.state {
            LoadState::Loaded { backend, inputs } => Ok((backend.as_ref(), inputs)),
            _ => Err(Error::NotReady),
        }
    }

    /// Inputs of the loaded model, including those fed from extra tensors
    pub fn input_attrs(&self) -> Result<Vec<TensorAttr>> {
        Ok(self.loaded()?.1.to_vec())
    }

    /// Inputs the pre-processor has to produce, i.e. all but the extra ones
    pub fn blob_attrs(&self) -> Result<Vec<TensorAttr>> {
        let inputs = self.loaded()?.1;
        let n = inputs.len().saturating_sub(self.extra.len());
        Ok(inputs[..n].to_vec())
    }

    pub fn output_attrs(&self) -> Result<Vec<TensorAttr>> {
        self.loaded()?.0.output_attrs()
    }

    /// Runs inference on the pre-processed `blobs`.
    #[instrument(skip_all, fields(blobs = blobs.len()))]
    pub fn process(&mut self, blobs: &[Tensor]) -> Result<Vec<Tensor>> {
        if !self.ready()? {
            return Err(Error::NotReady);
        }
        let start = Instant::now();
        let mut info = vec!["* Input Tensors".to_string()];

        let inputs: Vec<Tensor>;
        let inputs: &[Tensor] = if self.extra.is_empty() {
            blobs
        } else {
            inputs = blobs.iter().chain(&self.extra).cloned().collect();
            &inputs
        };
        info.extend(inputs.iter().map(|t| format!("- {}", t.shapestr())));

        let LoadState::Loaded {
            backend,
            inputs: attrs,
        } = &mut self.state
        else {
            return Err(Error::NotReady);
        };
        if attrs.len() != inputs.len() {
            return Err(Error::ShapeMismatch {
                expected: format!("{} input tensors", attrs.len()),
                got: format!("{}", inputs.len()),
            });
        }
        for (attr, t) in attrs.iter().zip(inputs) {
            attr.check(t)?;
        }

        info.push("* Network".into());
        if !self.comment.is_empty() {
            info.push(self.comment.clone());
        }
        let mut outs = backend.execute(inputs, &mut info)?;

        info.push("* Output Tensors".into());
        info.extend(outs.iter().map(|t| format!("- {}", t.shapestr())));

        if !self.reshape.is_empty() {
            if self.reshape.len() != outs.len() {
                return Err(Error::format(format!(
                    "received {} outputs but outreshape has {} entries",
                    outs.len(),
                    self.reshape.len()
                )));
            }
            info.push("* Reshaped Output Tensors".into());
            for (t, r) in outs.iter_mut().zip(&self.reshape) {
                t.reshape(r.dims.clone())?;
                info.push(format!("- {}", t.shapestr()));
            }
        }

        metrics::histogram!("network_time_us").record(start.elapsed().as_micros() as f64);
        self.info = info;
        Ok(outs)
    }

    /// Description of the last [`process`](Self::process) call
    pub fn info(&self) -> &[String] {
        &self.info
    }

    /// Blocks while a load is in flight, so a loading backend is never torn down.
    pub fn wait_before_destroy(&mut self) {
        let mut count = 0;
        while matches!(self.state, LoadState::Loading(_)) {
            std::thread::sleep(Duration::from_millis(5));
            if let Ok(true) = self.ready() {
                break;
            }
            count += 1;
            if count == 200 {
                info!("Waiting for network load to complete...");
                count = 0;
            }
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.wait_before_destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnn::tensor::{DType, Layout, TensorData};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Sums each input into a 1-element output after a short load
    struct SumBackend {
        inputs: Vec<TensorAttr>,
        fail_loads: Arc<AtomicUsize>,
    }

    impl Backend for SumBackend {
        fn load(&mut self) -> Result<()> {
            std::thread::sleep(Duration::from_millis(10));
            if self.fail_loads.load(Ordering::SeqCst) > 0 {
                self.fail_loads.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::backend("device busy"));
            }
            Ok(())
        }

        fn input_attrs(&self) -> Result<Vec<TensorAttr>> {
            Ok(self.inputs.clone())
        }

        fn output_attrs(&self) -> Result<Vec<TensorAttr>> {
            Ok(vec![TensorAttr::new(Layout::Na, DType::F32, vec![1, 2])])
        }

        fn execute(&mut self, inputs: &[Tensor], _info: &mut Vec<String>) -> Result<Vec<Tensor>> {
            let sums = inputs
                .iter()
                .map(|t| t.data.to_f32_vec().iter().sum())
                .collect();
            Ok(vec![Tensor::from_f32(vec![1, inputs.len()], sums)?])
        }
    }

    fn wait_ready(net: &mut Network) -> Result<()> {
        for _ in 0..1000 {
            if net.ready()? {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(Error::NotReady)
    }

    fn network(cfg: &NetworkConfig, fail_loads: usize) -> Network {
        let backend = SumBackend {
            inputs: vec![
                TensorAttr::new(Layout::Na, DType::F32, vec![1, 4]),
                TensorAttr::new(Layout::Na, DType::U8, vec![2]),
            ],
            fail_loads: Arc::new(AtomicUsize::new(fail_loads)),
        };
        Network::new(Box::new(backend), cfg).unwrap()
    }

    #[test]
    fn ready_is_non_blocking_and_extra_inputs_are_appended() {
        let cfg = NetworkConfig {
            extraintensors: "8U:2:3 4".into(),
            outreshape: "32F:2".into(),
            comment: "sum".into(),
            ..Default::default()
        };
        let mut net = network(&cfg, 0);
        assert!(!net.ready().unwrap());
        let blob = Tensor::from_f32(vec![1, 4], vec![1.0; 4]).unwrap();
        assert!(matches!(net.process(&[blob.clone()]), Err(Error::NotReady)));

        wait_ready(&mut net).unwrap();
        assert_eq!(net.blob_attrs().unwrap().len(), 1);
        let out = net.process(&[blob]).unwrap();
        assert_eq!(out[0].dims(), &[2]);
        assert_eq!(out[0].as_f32().unwrap(), &[4.0, 7.0]);
        assert!(net.info().iter().any(|l| l == "sum"));
        assert!(net.info().iter().any(|l| l == "* Reshaped Output Tensors"));
    }

    #[test]
    fn shape_mismatch_fails_fast() {
        let cfg = NetworkConfig {
            extraintensors: "8U:2:3 4".into(),
            ..Default::default()
        };
        let mut net = network(&cfg, 0);
        wait_ready(&mut net).unwrap();
        let wrong = Tensor::new(
            TensorAttr::new(Layout::Na, DType::U8, vec![1, 4]),
            TensorData::U8(vec![0; 4]),
        )
        .unwrap();
        assert!(matches!(net.process(&[wrong]), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn failed_load_surfaces_then_retries() {
        let mut net = network(&NetworkConfig::default(), 1);
        let mut saw_error = false;
        for _ in 0..1000 {
            match net.ready() {
                Ok(true) => break,
                Ok(false) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => {
                    assert!(e.to_string().contains("device busy"));
                    saw_error = true;
                }
            }
        }
        assert!(saw_error);
        assert!(net.ready().unwrap());
    }

    #[test]
    fn malformed_config_is_rejected() {
        let cfg = NetworkConfig {
            extraintensors: "32F:1x2:1".into(),
            ..Default::default()
        };
        let backend = SumBackend {
            inputs: vec![],
            fail_loads: Arc::new(AtomicUsize::new(0)),
        };
        assert!(Network::new(Box::new(backend), &cfg).is_err());
    }
}
