use thiserror::Error;

use crate::{DType, Shape, StageId, TensorName};

/// Per-request failure taxonomy. Build-time failures live in the graph
/// crate; everything here terminates exactly one request and is reported to
/// its caller with the failing stage's identity where one exists.
///
/// Errors are `Clone` so a whole-batch fault can be fanned out identically
/// to every co-batched slot.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InferError {
    #[error("stage `{stage}`: tensor `{tensor}` has shape {actual}, declared {expected}")]
    ShapeMismatch {
        stage: StageId,
        tensor: TensorName,
        expected: String,
        actual: Shape,
    },

    #[error("stage `{stage}`: tensor `{tensor}` is {actual}, declared {expected}")]
    DtypeMismatch {
        stage: StageId,
        tensor: TensorName,
        expected: DType,
        actual: DType,
    },

    #[error("stage `{stage}`: batch of {len} exceeds max_batch {max}")]
    BatchTooLarge {
        stage: StageId,
        len: usize,
        max: usize,
    },

    #[error("stage `{stage}` executor fault: {message}")]
    ExecutorFault {
        stage: StageId,
        retry_safe: bool,
        message: String,
    },

    #[error("request is missing declared input `{name}`")]
    MissingInput { name: TensorName },

    #[error("request carries undeclared input `{name}`")]
    UnknownInput { name: TensorName },

    #[error("request supplies input `{name}` more than once")]
    DuplicateInput { name: TensorName },

    #[error("requested output `{name}` is not declared by the pipeline")]
    UnknownOutput { name: TensorName },

    #[error("tensor `{name}` was produced twice within one request")]
    DuplicateWrite { name: TensorName },

    #[error("pipeline finished without producing `{name}`")]
    IncompletePipeline { name: TensorName },
}

impl InferError {
    /// True when the caller's own request caused the failure and a corrected
    /// resubmission can succeed.
    pub fn caller_fault(&self) -> bool {
        matches!(
            self,
            InferError::ShapeMismatch { .. }
                | InferError::DtypeMismatch { .. }
                | InferError::BatchTooLarge { .. }
                | InferError::MissingInput { .. }
                | InferError::UnknownInput { .. }
                | InferError::DuplicateInput { .. }
                | InferError::UnknownOutput { .. }
        )
    }

    /// True when resubmitting the identical request may succeed (transient
    /// infrastructure fault rather than bad input or a logic defect).
    pub fn retry_safe(&self) -> bool {
        match self {
            InferError::ExecutorFault { retry_safe, .. } => *retry_safe,
            _ => false,
        }
    }

    /// The stage a failure originated in, when it originated in one.
    pub fn stage(&self) -> Option<&StageId> {
        match self {
            InferError::ShapeMismatch { stage, .. }
            | InferError::DtypeMismatch { stage, .. }
            | InferError::BatchTooLarge { stage, .. }
            | InferError::ExecutorFault { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Infrastructure fault for a stage whose executor vanished or broke in
    /// a way the caller did not cause. Always retry-safe.
    pub fn infrastructure(stage: &StageId, message: impl Into<String>) -> Self {
        InferError::ExecutorFault {
            stage: stage.clone(),
            retry_safe: true,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_classification() {
        let shape = InferError::ShapeMismatch {
            stage: "classify".into(),
            tensor: "input".into(),
            expected: "[3, 224, 224]".to_string(),
            actual: Shape::from_slice(&[3, 224, 225]),
        };
        assert!(shape.caller_fault());
        assert!(!shape.retry_safe());
        assert_eq!(shape.stage().unwrap().as_str(), "classify");

        let infra = InferError::infrastructure(&"classify".into(), "worker dropped");
        assert!(!infra.caller_fault());
        assert!(infra.retry_safe());

        let defect = InferError::IncompletePipeline {
            name: "OUTPUT".into(),
        };
        assert!(!defect.caller_fault());
        assert!(!defect.retry_safe());
        assert!(defect.stage().is_none());
    }
}
