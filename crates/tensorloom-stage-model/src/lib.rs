use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use bytes::BytesMut;
use tensorloom_core::{
    validate_batch, DType, InferError, Shape, SlotInputs, SlotResult, StageAdapter,
    StageCapabilities, StageKind, StageSpec, Tensor,
};
use tract_onnx::prelude::{
    DatumType, Framework, InferenceModelExt, IntoTensor, TValue, TVec, Tensor as TractTensor,
    TypedModel, TypedRunnableModel,
};

/// Seam to the compiled numeric executor. Inputs arrive stacked along a new
/// leading batch dim, one tensor per declared stage input in declared order;
/// outputs must come back stacked the same way, one per declared output.
pub trait ModelRuntime: Send + 'static {
    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>>;
}

/// Adapter for model stages. Stacks the batch's slots into whole-batch
/// tensors, makes one runtime call, then splits the outputs back to slots by
/// byte stride. The executor sees the batch as a unit, so a fault lands on
/// every co-batched slot.
pub struct ModelStage {
    spec: StageSpec,
    runtime: Box<dyn ModelRuntime>,
}

impl std::fmt::Debug for ModelStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelStage")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl ModelStage {
    /// Input dims must all be fixed: stacking requires every slot of a batch
    /// to share one shape, and validation pins slot shapes to the declared
    /// dims.
    pub fn new(spec: StageSpec, runtime: Box<dyn ModelRuntime>) -> Result<Self> {
        ensure!(
            spec.kind == StageKind::Model,
            "stage `{}` is declared `{}`, not `model`",
            spec.id,
            spec.kind
        );
        ensure!(
            !spec.inputs.is_empty() && !spec.outputs.is_empty(),
            "model stage `{}` must declare at least one input and one output",
            spec.id
        );
        for input in &spec.inputs {
            ensure!(
                input.dims.iter().all(|d| d.is_some()),
                "model input `{}` must declare fixed dims so slots stack uniformly",
                input.name
            );
        }
        Ok(Self { spec, runtime })
    }

    fn contract_fault(&self, message: String) -> InferError {
        InferError::ExecutorFault {
            stage: self.spec.id.clone(),
            retry_safe: false,
            message,
        }
    }
}

impl StageAdapter for ModelStage {
    fn spec(&self) -> &StageSpec {
        &self.spec
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities {
            per_slot_faults: false,
            dynamic_shapes: false,
        }
    }

    fn execute(&mut self, batch: Vec<SlotInputs>) -> Result<Vec<SlotResult>, InferError> {
        validate_batch(&self.spec, &batch)?;
        let Some(first) = batch.first() else {
            return Ok(Vec::new());
        };
        let slots = batch.len();

        let mut stacked = Vec::with_capacity(self.spec.inputs.len());
        for (i, decl) in self.spec.inputs.iter().enumerate() {
            let mut data = BytesMut::with_capacity(slots * first[i].1.byte_len);
            for slot in &batch {
                data.extend_from_slice(slot[i].1.bytes());
            }
            let mut dims = Vec::with_capacity(decl.dims.len() + 1);
            dims.push(slots);
            dims.extend(first[i].1.shape().dims());
            stacked.push(Tensor::from_cpu_bytes(
                decl.dtype,
                Shape::from_slice(&dims),
                data.freeze(),
            ));
        }

        let outputs = match self.runtime.infer(stacked) {
            Ok(outputs) => outputs,
            Err(e) => {
                return Err(self.contract_fault(format!("model execution failed: {e:#}")));
            }
        };
        if outputs.len() != self.spec.outputs.len() {
            return Err(self.contract_fault(format!(
                "executor returned {} outputs, expected {}",
                outputs.len(),
                self.spec.outputs.len()
            )));
        }

        let mut per_slot: Vec<Vec<_>> = (0..slots)
            .map(|_| Vec::with_capacity(self.spec.outputs.len()))
            .collect();
        for (decl, batched) in self.spec.outputs.iter().zip(outputs) {
            if batched.dtype() != decl.dtype {
                return Err(self.contract_fault(format!(
                    "executor returned {} for output `{}`, declared {}",
                    batched.dtype(),
                    decl.name,
                    decl.dtype
                )));
            }
            let dims = batched.shape().dims();
            if dims.first() != Some(&slots) {
                return Err(self.contract_fault(format!(
                    "executor returned shape {} for output `{}` over {slots} slots",
                    batched.shape(),
                    decl.name
                )));
            }
            let slot_shape = Shape::from_slice(&dims[1..]);
            if !decl.admits(&slot_shape) {
                return Err(self.contract_fault(format!(
                    "executor returned per-slot shape {} for output `{}`, declared {}",
                    slot_shape,
                    decl.name,
                    decl.render_dims()
                )));
            }
            let stride = slot_shape.numel() * decl.dtype.byte_size();
            if batched.byte_len != stride * slots {
                return Err(self.contract_fault(format!(
                    "executor returned {} bytes for output `{}`, expected {}",
                    batched.byte_len,
                    decl.name,
                    stride * slots
                )));
            }
            for (s, slot_outputs) in per_slot.iter_mut().enumerate() {
                let bytes = batched.bytes().slice(s * stride..(s + 1) * stride);
                slot_outputs.push((
                    decl.name.clone(),
                    Tensor::from_cpu_bytes(decl.dtype, slot_shape.clone(), bytes),
                ));
            }
        }

        Ok(per_slot.into_iter().map(Ok).collect())
    }
}

/// Classification labels, one per line, index aligned with the class axis of
/// the output it annotates. Blank trailing lines are dropped; interior blank
/// lines are kept so indices stay aligned.
#[derive(Clone, Debug)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read label file {}", path.display()))?;
        let mut labels: Vec<String> = text.lines().map(|l| l.trim_end().to_string()).collect();
        while labels.last().is_some_and(|l| l.is_empty()) {
            labels.pop();
        }
        ensure!(!labels.is_empty(), "label file {} is empty", path.display());
        Ok(Self { labels })
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// Label of the highest-scoring class.
    pub fn top(&self, scores: &[f32]) -> Option<&str> {
        let mut best: Option<(usize, f32)> = None;
        for (i, score) in scores.iter().enumerate() {
            if best.map_or(true, |(_, b)| *score > b) {
                best = Some((i, *score));
            }
        }
        best.and_then(|(i, _)| self.get(i))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// CPU reference executor over a compiled ONNX graph. Inputs are fed
/// positionally, so the stage's declared input order must match the graph's
/// input order. The leading batch dim varies per call, which is why the
/// loader leaves input facts to the model's own shape metadata.
pub struct TractRuntime {
    plan: TypedRunnableModel<TypedModel>,
}

impl TractRuntime {
    pub fn load(path: &Path) -> Result<Self> {
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("failed to read model {}", path.display()))?
            .into_optimized()
            .with_context(|| format!("failed to compile model {}", path.display()))?
            .into_runnable()
            .with_context(|| format!("failed to plan model {}", path.display()))?;
        Ok(Self { plan })
    }
}

impl ModelRuntime for TractRuntime {
    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let mut values: TVec<TValue> = TVec::with_capacity(inputs.len());
        for input in inputs {
            values.push(to_tract(&input)?.into());
        }

        let outputs = self.plan.run(values)?;
        outputs
            .into_iter()
            .map(|v| from_tract(v.into_tensor()))
            .collect()
    }
}

fn to_tract(tensor: &Tensor) -> Result<TractTensor> {
    let dims = tensor.shape().dims();
    let value = match tensor.dtype() {
        DType::F32 => {
            let data = tensor.as_f32().context("f32 tensor has a torn byte length")?;
            TractTensor::from_shape(dims, &data)?
        }
        DType::I64 => {
            let data = tensor.as_i64().context("i64 tensor has a torn byte length")?;
            TractTensor::from_shape(dims, &data)?
        }
        DType::I32 => {
            let data = tensor.as_i32().context("i32 tensor has a torn byte length")?;
            TractTensor::from_shape(dims, &data)?
        }
        DType::U8 => {
            let data = tensor.as_u8().context("u8 tensor is not byte backed")?;
            TractTensor::from_shape(dims, &data)?
        }
        DType::F16 => bail!("FP16 inputs are not supported by the CPU executor"),
    };
    Ok(value)
}

fn from_tract(tensor: TractTensor) -> Result<Tensor> {
    let shape = Shape::from_slice(tensor.shape());
    match tensor.datum_type() {
        DatumType::F32 => Ok(Tensor::from_f32(shape, tensor.as_slice::<f32>()?)),
        DatumType::I64 => Ok(Tensor::from_i64(shape, tensor.as_slice::<i64>()?)),
        DatumType::I32 => Ok(Tensor::from_i32(shape, tensor.as_slice::<i32>()?)),
        DatumType::U8 => Ok(Tensor::from_u8(shape, tensor.as_slice::<u8>()?)),
        other => bail!("unsupported output datum type {other:?}"),
    }
}
