//! Pre-processing, inference and post-processing of frames

pub mod network;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod postprocess;
pub mod preprocess;
pub mod streamed;
pub mod tensor;
pub mod utils;

use serde::{Deserialize, Serialize};

pub use network::{Backend, BackendKind, Network, NetworkConfig};
pub use postprocess::{PostProcessor, PostProcessorConfig};
pub use preprocess::{PreProcessor, PreProcessorConfig};
pub use tensor::{DType, Layout, Tensor, TensorAttr};

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnnConfig {
    pub preprocessor: PreProcessorConfig,
    pub network: NetworkConfig,
    pub postprocessor: PostProcessorConfig,
}

/// Instantiates the configured backend, or `None` when no network is set up.
pub fn create_backend(cfg: &NetworkConfig) -> Result<Option<Box<dyn Backend>>> {
    match cfg.backend {
        BackendKind::None => Ok(None),
        #[cfg(feature = "onnx")]
        BackendKind::Onnx => Ok(Some(Box::new(onnx::OnnxBackend::new(cfg)?))),
        #[cfg(not(feature = "onnx"))]
        BackendKind::Onnx => Err(crate::error::Error::format("ONNX support is not compiled in (feature \"onnx\")")),
    }
}
