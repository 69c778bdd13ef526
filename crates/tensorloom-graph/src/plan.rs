use tensorloom_core::{StageId, TensorName, TensorSpec};

/// One wire of a planned step: a stage-local tensor name bound to the
/// ensemble-scope name it reads from or writes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub local: TensorName,
    pub scope: TensorName,
}

impl Binding {
    pub fn new(local: impl Into<TensorName>, scope: impl Into<TensorName>) -> Self {
        Self {
            local: local.into(),
            scope: scope.into(),
        }
    }
}

/// One stage invocation within a compiled plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedStep {
    pub stage: StageId,
    /// Stage inputs in declared order, each bound to an ensemble-scope name
    /// guaranteed (at build time) to exist by the time this step runs.
    pub inputs: Vec<Binding>,
    /// The stage outputs the ensemble keeps; unmapped outputs are discarded.
    pub outputs: Vec<Binding>,
    /// Ensemble-scope names among `outputs` that are declared final pipeline
    /// outputs: the response assembler's checklist for this step.
    pub final_outputs: Vec<TensorName>,
}

/// Compiled, topologically ordered, immutable stage sequence for one
/// pipeline. Built once at load and shared read-only by every concurrent
/// request; rebuilding from the same definition yields an identical plan.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionPlan {
    pub pipeline: String,
    /// External inputs the caller must supply, with their declared bounds.
    pub inputs: Vec<TensorSpec>,
    /// External outputs the response is assembled from.
    pub outputs: Vec<TensorSpec>,
    pub steps: Vec<PlannedStep>,
}

impl ExecutionPlan {
    pub fn input(&self, name: &TensorName) -> Option<&TensorSpec> {
        self.inputs.iter().find(|s| &s.name == name)
    }

    pub fn output(&self, name: &TensorName) -> Option<&TensorSpec> {
        self.outputs.iter().find(|s| &s.name == name)
    }

    /// Every distinct stage the plan touches, in execution order.
    pub fn stage_ids(&self) -> Vec<StageId> {
        let mut ids = Vec::new();
        for step in &self.steps {
            if !ids.contains(&step.stage) {
                ids.push(step.stage.clone());
            }
        }
        ids
    }
}
