use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tensorloom_core::{InferError, StageId, Tensor, TensorName};
use tensorloom_graph::{ExecutionPlan, PlannedStep};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::{StageHandle, StageRequest, TensorRegistry};

/// One caller-facing inference call against a pipeline.
#[derive(Debug)]
pub struct PipelineRequest {
    /// Correlation id; generated when empty.
    pub id: String,
    pub inputs: Vec<(TensorName, Tensor)>,
    /// Requested subset of the declared outputs; `None` returns all of them.
    pub outputs: Option<Vec<TensorName>>,
}

#[derive(Debug)]
pub struct PipelineResponse {
    pub id: String,
    pub outputs: Vec<(TensorName, Tensor)>,
}

/// Drives single requests through a compiled plan, step by step, on the
/// caller's task. Parallelism comes from many callers walking their own
/// requests concurrently; the per-stage batchers merge their slots into
/// shared physical batches.
pub struct PipelineExecutor {
    plan: Arc<ExecutionPlan>,
    stages: HashMap<StageId, StageHandle>,
}

impl PipelineExecutor {
    /// Wire a compiled plan to its running stages.
    pub fn new(
        plan: Arc<ExecutionPlan>,
        stages: HashMap<StageId, StageHandle>,
    ) -> anyhow::Result<Self> {
        for step in &plan.steps {
            anyhow::ensure!(
                stages.contains_key(&step.stage),
                "plan `{}` references stage `{}` with no running instances",
                plan.pipeline,
                step.stage
            );
        }
        Ok(Self { plan, stages })
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub async fn infer(&self, request: PipelineRequest) -> Result<PipelineResponse, InferError> {
        let id = if request.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            request.id
        };
        let requested = self.resolve_requested(request.outputs)?;
        let mut registry = self.admit(request.inputs)?;

        let mut collected: Vec<(TensorName, Tensor)> =
            Vec::with_capacity(self.plan.outputs.len());
        for step in &self.plan.steps {
            self.run_step(&id, step, &mut registry, &mut collected)
                .await?;
        }

        let mut outputs = Vec::with_capacity(requested.len());
        for name in requested {
            match collected.iter().find(|(n, _)| n == &name) {
                Some((_, tensor)) => outputs.push((name, tensor.clone())),
                None => return Err(InferError::IncompletePipeline { name }),
            }
        }
        Ok(PipelineResponse { id, outputs })
    }

    fn resolve_requested(
        &self,
        outputs: Option<Vec<TensorName>>,
    ) -> Result<Vec<TensorName>, InferError> {
        match outputs {
            None => Ok(self.plan.outputs.iter().map(|s| s.name.clone()).collect()),
            Some(names) => {
                for name in &names {
                    if self.plan.output(name).is_none() {
                        return Err(InferError::UnknownOutput { name: name.clone() });
                    }
                }
                Ok(names)
            }
        }
    }

    /// Check the request against the pipeline boundary and seed the
    /// registry. Dynamic dims accept whatever the caller sized them to;
    /// fixed dims must match exactly.
    fn admit(
        &self,
        inputs: Vec<(TensorName, Tensor)>,
    ) -> Result<TensorRegistry, InferError> {
        let boundary = StageId::new(self.plan.pipeline.as_str());
        let mut registry = TensorRegistry::new();
        for (name, tensor) in inputs {
            let decl = self
                .plan
                .input(&name)
                .ok_or_else(|| InferError::UnknownInput { name: name.clone() })?;
            if decl.dtype != tensor.dtype() {
                return Err(InferError::DtypeMismatch {
                    stage: boundary.clone(),
                    expected: decl.dtype,
                    actual: tensor.dtype(),
                    tensor: name,
                });
            }
            if !decl.admits(tensor.shape()) {
                return Err(InferError::ShapeMismatch {
                    stage: boundary.clone(),
                    expected: decl.render_dims(),
                    actual: tensor.shape().clone(),
                    tensor: name,
                });
            }
            match registry.insert(name, tensor) {
                Err(InferError::DuplicateWrite { name }) => {
                    return Err(InferError::DuplicateInput { name })
                }
                Err(other) => return Err(other),
                Ok(()) => {}
            }
        }
        for decl in &self.plan.inputs {
            if !registry.contains(&decl.name) {
                return Err(InferError::MissingInput {
                    name: decl.name.clone(),
                });
            }
        }
        Ok(registry)
    }

    async fn run_step(
        &self,
        id: &str,
        step: &PlannedStep,
        registry: &mut TensorRegistry,
        collected: &mut Vec<(TensorName, Tensor)>,
    ) -> Result<(), InferError> {
        let handle = self
            .stages
            .get(&step.stage)
            .ok_or_else(|| InferError::infrastructure(&step.stage, "stage is not running"))?;

        let mut inputs = Vec::with_capacity(step.inputs.len());
        for binding in &step.inputs {
            let tensor = registry
                .get(&binding.scope)
                .ok_or_else(|| InferError::IncompletePipeline {
                    name: binding.scope.clone(),
                })?
                .clone();
            inputs.push((binding.local.clone(), tensor));
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        handle
            .submit(StageRequest {
                request_id: id.to_string(),
                inputs,
                enqueued_at: Instant::now(),
                resp_tx,
            })
            .await?;

        let response = resp_rx
            .await
            .map_err(|_| InferError::infrastructure(&step.stage, "stage dropped the request"))?;
        debug!(
            request = %id,
            stage = %step.stage,
            queued_us = response.timings.queued_us,
            execute_us = response.timings.execute_us,
            "step finished"
        );
        let outputs = response.result?;

        for binding in &step.outputs {
            let tensor = outputs
                .iter()
                .find(|(name, _)| name == &binding.local)
                .map(|(_, t)| t.clone())
                .ok_or_else(|| InferError::IncompletePipeline {
                    name: binding.local.clone(),
                })?;
            registry.insert(binding.scope.clone(), tensor)?;
        }
        for name in &step.final_outputs {
            let tensor = registry
                .get(name)
                .ok_or_else(|| InferError::IncompletePipeline { name: name.clone() })?
                .clone();
            collected.push((name.clone(), tensor));
        }
        Ok(())
    }
}
