//! ONNX models on the CPU through tract

use std::path::PathBuf;

use tracing::info;
use tract_onnx::prelude::Tensor as TractTensor;
use tract_onnx::prelude::*;

use super::network::{Backend, NetworkConfig};
use super::tensor::{parse_tensor_specs, DType, Layout, Tensor, TensorAttr, TensorData};
use crate::error::{Error, Result};

type Plan = RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>;

fn tract_err(e: impl std::fmt::Display) -> Error {
    Error::backend(format!("onnx: {e}"))
}

pub struct OnnxBackend {
    path: PathBuf,
    /// Declared inputs; when empty the model's own facts are used
    declared_in: Vec<TensorAttr>,
    declared_out: Vec<TensorAttr>,
    plan: Option<Plan>,
}

impl OnnxBackend {
    pub fn new(cfg: &NetworkConfig) -> Result<Self> {
        let path = cfg
            .model
            .clone()
            .ok_or_else(|| Error::format("onnx backend needs a model path"))?;
        Ok(Self {
            path,
            declared_in: parse_tensor_specs(&cfg.intensors)?,
            declared_out: parse_tensor_specs(&cfg.outtensors)?,
            plan: None,
        })
    }

    fn plan(&self) -> Result<&Plan> {
        self.plan.as_ref().ok_or(Error::NotReady)
    }
}

fn to_datum(d: DType) -> DatumType {
    match d {
        DType::U8 => u8::datum_type(),
        DType::I8 => i8::datum_type(),
        DType::U16 => u16::datum_type(),
        DType::I16 => i16::datum_type(),
        DType::U32 => u32::datum_type(),
        DType::I32 => i32::datum_type(),
        DType::F32 => f32::datum_type(),
        DType::F64 => f64::datum_type(),
    }
}

fn from_datum(d: DatumType) -> Result<DType> {
    Ok(match d {
        DatumType::U8 => DType::U8,
        DatumType::I8 => DType::I8,
        DatumType::U16 => DType::U16,
        DatumType::I16 => DType::I16,
        DatumType::U32 => DType::U32,
        DatumType::I32 => DType::I32,
        DatumType::F32 => DType::F32,
        DatumType::F64 => DType::F64,
        other => return Err(tract_err(format!("unsupported tensor type {other:?}"))),
    })
}

fn fact_attr(fact: &TypedFact) -> Result<TensorAttr> {
    let dims = fact
        .shape
        .as_concrete()
        .ok_or_else(|| tract_err(format!("symbolic shape {:?}", fact.shape)))?
        .to_vec();
    Ok(TensorAttr::new(Layout::Auto, from_datum(fact.datum_type)?, dims))
}

fn to_tract(t: &Tensor) -> Result<TractTensor> {
    let dims = t.dims();
    let res = match &t.data {
        TensorData::U8(v) => TractTensor::from_shape(dims, v.as_slice()),
        TensorData::I8(v) => TractTensor::from_shape(dims, v.as_slice()),
        TensorData::U16(v) => TractTensor::from_shape(dims, v.as_slice()),
        TensorData::I16(v) => TractTensor::from_shape(dims, v.as_slice()),
        TensorData::U32(v) => TractTensor::from_shape(dims, v.as_slice()),
        TensorData::I32(v) => TractTensor::from_shape(dims, v.as_slice()),
        TensorData::F32(v) => TractTensor::from_shape(dims, v.as_slice()),
        TensorData::F64(v) => TractTensor::from_shape(dims, v.as_slice()),
    };
    res.map_err(tract_err)
}

/// Outputs come back as float; integer outputs are widened.
fn from_tract(t: &TractTensor, attr: TensorAttr) -> Result<Tensor> {
    let t = t.cast_to::<f32>().map_err(tract_err)?;
    let view = t.to_array_view::<f32>().map_err(tract_err)?;
    let attr = TensorAttr {
        dtype: DType::F32,
        dims: view.shape().to_vec(),
        ..attr
    };
    Tensor::new(attr, TensorData::F32(view.iter().copied().collect()))
}

impl Backend for OnnxBackend {
    fn load(&mut self) -> Result<()> {
        info!("Loading {}", self.path.display());
        let mut model = tract_onnx::onnx()
            .model_for_path(&self.path)
            .map_err(tract_err)?;
        for (i, attr) in self.declared_in.iter().enumerate() {
            let fact = InferenceFact::dt_shape(to_datum(attr.dtype), attr.dims.clone());
            model = model.with_input_fact(i, fact).map_err(tract_err)?;
        }
        let plan = model
            .into_optimized()
            .map_err(tract_err)?
            .into_runnable()
            .map_err(tract_err)?;
        self.plan = Some(plan);
        Ok(())
    }

    fn input_attrs(&self) -> Result<Vec<TensorAttr>> {
        if !self.declared_in.is_empty() {
            return Ok(self.declared_in.clone());
        }
        let model = self.plan()?.model();
        (0..model.inputs.len())
            .map(|i| fact_attr(model.input_fact(i).map_err(tract_err)?))
            .collect()
    }

    fn output_attrs(&self) -> Result<Vec<TensorAttr>> {
        if !self.declared_out.is_empty() {
            return Ok(self.declared_out.clone());
        }
        let model = self.plan()?.model();
        (0..model.outputs.len())
            .map(|i| fact_attr(model.output_fact(i).map_err(tract_err)?))
            .collect()
    }

    fn execute(&mut self, inputs: &[Tensor], info: &mut Vec<String>) -> Result<Vec<Tensor>> {
        let plan = self.plan()?;
        let values = inputs
            .iter()
            .map(|t| to_tract(t).map(Into::into))
            .collect::<Result<_>>()?;
        let outs = plan.run(values).map_err(tract_err)?;
        info.push(format!("Forward pass on {}", self.path.display()));
        outs.iter()
            .map(|o| from_tract(o, TensorAttr::new(Layout::Auto, DType::F32, Vec::new())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_path_is_required() {
        assert!(OnnxBackend::new(&NetworkConfig::default()).is_err());
    }

    #[test]
    fn declared_tensors_override_model_facts() {
        let cfg = NetworkConfig {
            model: Some("model.onnx".into()),
            intensors: "NCHW:32F:1x3x64x64".into(),
            ..Default::default()
        };
        let b = OnnxBackend::new(&cfg).unwrap();
        let attrs = b.input_attrs().unwrap();
        assert_eq!(attrs[0].dims, vec![1, 3, 64, 64]);
        assert!(matches!(b.output_attrs(), Err(Error::NotReady)));
    }

    #[test]
    fn tensors_cross_the_boundary() {
        let t = Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let tt = to_tract(&t).unwrap();
        let back = from_tract(&tt, t.attr.clone()).unwrap();
        assert_eq!(back.as_f32().unwrap(), t.as_f32().unwrap());
        assert_eq!(back.dims(), &[2, 2]);
    }
}
