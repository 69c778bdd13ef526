use crate::{InferError, StageSpec, Tensor, TensorName};

/// Capability flags the scheduler relies on.
#[derive(Clone, Copy, Debug)]
pub struct StageCapabilities {
    /// Whether the executor can report a fault for one slot without failing
    /// the whole batch. When false, any fault is surfaced identically to
    /// every co-batched slot and callers retry individually.
    pub per_slot_faults: bool,
    /// Whether dynamic (caller-sized) input dims are accepted.
    pub dynamic_shapes: bool,
}

/// Named inputs for one slot of a physical batch, in the stage's declared
/// input order and under the stage's local tensor names.
pub type SlotInputs = Vec<(TensorName, Tensor)>;

/// Named outputs for one slot, or that slot's own fault.
pub type SlotResult = Result<Vec<(TensorName, Tensor)>, InferError>;

/// Uniform contract over a heterogeneous executable unit (preprocessing
/// engine or compiled-model executor).
///
/// Slot `i` of the returned vector corresponds to slot `i` of `batch`; the
/// result length must equal the batch length. An outer `Err` is a
/// whole-batch fault. Implementations must reject batches over
/// `spec().max_batch` and tensors outside the declared shape bounds; the
/// worker enforces the same checks before dispatch.
pub trait StageAdapter: Send + 'static {
    fn spec(&self) -> &StageSpec;

    fn capabilities(&self) -> StageCapabilities;

    fn execute(&mut self, batch: Vec<SlotInputs>) -> Result<Vec<SlotResult>, InferError>;
}

/// Validate one slot's inputs against the declared spec: complete, known
/// names, matching dtype, shape within bounds. Invariant: tensors delivered
/// to an executor always satisfy its declared bounds.
pub fn validate_slot(spec: &StageSpec, slot: &SlotInputs) -> Result<(), InferError> {
    for (name, tensor) in slot {
        let decl = spec.input(name).ok_or_else(|| InferError::UnknownInput {
            name: name.clone(),
        })?;
        if decl.dtype != tensor.dtype() {
            return Err(InferError::DtypeMismatch {
                stage: spec.id.clone(),
                tensor: name.clone(),
                expected: decl.dtype,
                actual: tensor.dtype(),
            });
        }
        if !decl.admits(tensor.shape()) {
            return Err(InferError::ShapeMismatch {
                stage: spec.id.clone(),
                tensor: name.clone(),
                expected: decl.render_dims(),
                actual: tensor.shape().clone(),
            });
        }
    }
    for decl in &spec.inputs {
        if !slot.iter().any(|(name, _)| name == &decl.name) {
            return Err(InferError::MissingInput {
                name: decl.name.clone(),
            });
        }
    }
    Ok(())
}

/// Batch-level guard used by adapters: size cap plus [`validate_slot`] for
/// every slot.
pub fn validate_batch(spec: &StageSpec, batch: &[SlotInputs]) -> Result<(), InferError> {
    if batch.len() > spec.max_batch {
        return Err(InferError::BatchTooLarge {
            stage: spec.id.clone(),
            len: batch.len(),
            max: spec.max_batch,
        });
    }
    for slot in batch {
        validate_slot(spec, slot)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DType, Shape, StageKind, TensorSpec};

    fn spec() -> StageSpec {
        StageSpec {
            id: "decode_resize".into(),
            kind: StageKind::Preprocessing,
            inputs: vec![TensorSpec::new("raw", DType::U8, vec![None])],
            outputs: vec![TensorSpec::new(
                "image",
                DType::F32,
                vec![Some(3), Some(224), Some(224)],
            )],
            max_batch: 2,
        }
    }

    fn slot(len: usize) -> SlotInputs {
        vec![(
            "raw".into(),
            Tensor::from_u8(Shape::from_slice(&[len]), &vec![0u8; len]),
        )]
    }

    #[test]
    fn oversized_batch_rejected() {
        let err = validate_batch(&spec(), &[slot(4), slot(4), slot(4)]).unwrap_err();
        assert!(matches!(err, InferError::BatchTooLarge { len: 3, max: 2, .. }));
    }

    #[test]
    fn wrong_dtype_rejected() {
        let bad = vec![(
            TensorName::from("raw"),
            Tensor::from_f32(Shape::from_slice(&[4]), &[0.0; 4]),
        )];
        let err = validate_batch(&spec(), &[bad]).unwrap_err();
        assert!(matches!(err, InferError::DtypeMismatch { .. }));
        assert!(err.caller_fault());
    }

    #[test]
    fn incomplete_slot_rejected() {
        let err = validate_slot(&spec(), &Vec::new()).unwrap_err();
        assert!(matches!(err, InferError::MissingInput { .. }));
    }
}
