use thiserror::Error;

/// Failures while validating definitions or compiling an execution plan.
/// Always fatal at load time: a repository with any build error never
/// serves, in whole or in part.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("ensemble `{ensemble}` has a cycle among stages: {}", stages.join(", "))]
    Cycle {
        ensemble: String,
        stages: Vec<String>,
    },

    #[error("input `{input}` of stage `{stage}` has no binding")]
    UnboundInput { stage: String, input: String },

    #[error("input `{input}` of stage `{stage}` maps to `{scope}`, which nothing produces")]
    UnknownSource {
        stage: String,
        input: String,
        scope: String,
    },

    #[error("tensor `{scope}` is produced by both {first} and {second}")]
    DuplicateProducer {
        scope: String,
        first: String,
        second: String,
    },

    #[error("ensemble output `{output}` is not produced by any step")]
    UnboundOutput { output: String },

    #[error("step {step} references unknown stage `{stage}`")]
    UnknownStage { step: usize, stage: String },

    #[error("stage `{stage}` declares no tensor named `{tensor}`")]
    UnknownStageTensor { stage: String, tensor: String },

    #[error("tensor `{scope}`: {producer} produces {produced}, {consumer} expects {expected}")]
    BindingMismatch {
        scope: String,
        producer: String,
        produced: String,
        consumer: String,
        expected: String,
    },

    #[error("servable `{servable}`: unknown kind `{kind}`")]
    InvalidKind { servable: String, kind: String },

    #[error("servable `{servable}`, tensor `{tensor}`: {reason}")]
    InvalidTensorDecl {
        servable: String,
        tensor: String,
        reason: String,
    },

    #[error("servable `{servable}`: {reason}")]
    Malformed { servable: String, reason: String },
}
