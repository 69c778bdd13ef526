//! Compiles ensemble declarations into execution plans.
//!
//! The builder resolves every stage-local tensor name to its ensemble-scope
//! source, rejects dangling or ambiguous wiring, cross-checks dtypes and
//! fixed dims across each binding, and orders the steps topologically. Ties
//! between ready steps break toward the lower declaration index, so the same
//! definition always compiles to the same plan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use tensorloom_core::{StageId, StageSpec, TensorSpec};

use crate::definition::{EnsembleDecl, StepDecl};
use crate::error::BuildError;
use crate::plan::{Binding, ExecutionPlan, PlannedStep};

/// Where an ensemble-scope tensor comes from.
#[derive(Clone, Copy)]
enum Producer<'a> {
    External(&'a TensorSpec),
    Step { step: usize, output: &'a TensorSpec },
}

impl Producer<'_> {
    fn spec(&self) -> &TensorSpec {
        match self {
            Producer::External(spec) => spec,
            Producer::Step { output, .. } => output,
        }
    }

    fn describe(&self, steps: &[StepDecl]) -> String {
        match self {
            Producer::External(_) => "the ensemble inputs".to_string(),
            Producer::Step { step, .. } => {
                format!("step {} (stage `{}`)", step, steps[*step].stage)
            }
        }
    }
}

/// One step with its maps resolved against the stage's declared IO.
struct ResolvedStep<'a> {
    stage: &'a StageSpec,
    /// Declared inputs in order, each with the scope name it reads.
    inputs: Vec<(&'a TensorSpec, &'a str)>,
    /// Declared outputs in order, restricted to the mapped ones.
    outputs: Vec<(&'a TensorSpec, &'a str)>,
}

/// Compile an ensemble into a topologically ordered [`ExecutionPlan`].
///
/// `stages` holds the specs of every stage the repository loaded. All
/// validation happens here, once, so request admission only ever checks
/// concrete shapes against an already-coherent plan.
pub fn build_plan(
    ensemble: &EnsembleDecl,
    stages: &HashMap<StageId, StageSpec>,
) -> Result<ExecutionPlan, BuildError> {
    let resolved = resolve_steps(ensemble, stages)?;
    let producers = producer_table(ensemble, &resolved)?;
    let edges = check_bindings(ensemble, &resolved, &producers)?;
    check_outputs(ensemble, &producers)?;
    let order = topo_order(ensemble, resolved.len(), &edges)?;

    let final_names: BTreeSet<&str> = ensemble
        .outputs
        .iter()
        .map(|spec| spec.name.as_str())
        .collect();

    let steps = order
        .into_iter()
        .map(|idx| {
            let step = &resolved[idx];
            let outputs: Vec<Binding> = step
                .outputs
                .iter()
                .map(|&(spec, scope)| Binding::new(spec.name.as_str(), scope))
                .collect();
            let final_outputs = outputs
                .iter()
                .filter(|b| final_names.contains(b.scope.as_str()))
                .map(|b| b.scope.clone())
                .collect();
            PlannedStep {
                stage: step.stage.id.clone(),
                inputs: step
                    .inputs
                    .iter()
                    .map(|&(spec, scope)| Binding::new(spec.name.as_str(), scope))
                    .collect(),
                outputs,
                final_outputs,
            }
        })
        .collect();

    Ok(ExecutionPlan {
        pipeline: ensemble.name.clone(),
        inputs: ensemble.inputs.clone(),
        outputs: ensemble.outputs.clone(),
        steps,
    })
}

/// Wrap a bare stage in a one-step plan so the executor serves stages and
/// ensembles through the same path. Locals double as scope names.
pub fn single_stage_plan(spec: &StageSpec) -> ExecutionPlan {
    let identity = |t: &TensorSpec| Binding::new(t.name.as_str(), t.name.as_str());
    ExecutionPlan {
        pipeline: spec.id.to_string(),
        inputs: spec.inputs.clone(),
        outputs: spec.outputs.clone(),
        steps: vec![PlannedStep {
            stage: spec.id.clone(),
            inputs: spec.inputs.iter().map(identity).collect(),
            outputs: spec.outputs.iter().map(identity).collect(),
            final_outputs: spec.outputs.iter().map(|t| t.name.clone()).collect(),
        }],
    }
}

fn resolve_steps<'a>(
    ensemble: &'a EnsembleDecl,
    stages: &'a HashMap<StageId, StageSpec>,
) -> Result<Vec<ResolvedStep<'a>>, BuildError> {
    let mut resolved = Vec::with_capacity(ensemble.steps.len());
    for (idx, step) in ensemble.steps.iter().enumerate() {
        let stage = stages
            .get(&StageId::new(step.stage.as_str()))
            .ok_or_else(|| BuildError::UnknownStage {
                step: idx,
                stage: step.stage.clone(),
            })?;

        for local in step.input_map.keys() {
            if !stage.inputs.iter().any(|s| s.name.as_str() == local) {
                return Err(BuildError::UnknownStageTensor {
                    stage: step.stage.clone(),
                    tensor: local.clone(),
                });
            }
        }
        for local in step.output_map.keys() {
            if !stage.outputs.iter().any(|s| s.name.as_str() == local) {
                return Err(BuildError::UnknownStageTensor {
                    stage: step.stage.clone(),
                    tensor: local.clone(),
                });
            }
        }

        let mut inputs = Vec::with_capacity(stage.inputs.len());
        for spec in &stage.inputs {
            match step.input_map.get(spec.name.as_str()) {
                Some(scope) => inputs.push((spec, scope.as_str())),
                None => {
                    return Err(BuildError::UnboundInput {
                        stage: step.stage.clone(),
                        input: spec.name.to_string(),
                    })
                }
            }
        }
        // Unmapped outputs are legal; the stage computes them and the
        // ensemble drops them.
        let outputs = stage
            .outputs
            .iter()
            .filter_map(|spec| {
                step.output_map
                    .get(spec.name.as_str())
                    .map(|scope| (spec, scope.as_str()))
            })
            .collect();

        resolved.push(ResolvedStep {
            stage,
            inputs,
            outputs,
        });
    }
    Ok(resolved)
}

/// Build the scope-name ownership table: ensemble inputs first, then every
/// mapped step output. Each scope name gets exactly one producer.
fn producer_table<'a>(
    ensemble: &'a EnsembleDecl,
    resolved: &[ResolvedStep<'a>],
) -> Result<BTreeMap<&'a str, Producer<'a>>, BuildError> {
    let mut producers: BTreeMap<&str, Producer> = BTreeMap::new();
    let mut claim = |scope: &'a str, producer: Producer<'a>| match producers.insert(scope, producer)
    {
        Some(first) => Err(BuildError::DuplicateProducer {
            scope: scope.to_string(),
            first: first.describe(&ensemble.steps),
            second: producer.describe(&ensemble.steps),
        }),
        None => Ok(()),
    };

    for spec in &ensemble.inputs {
        claim(spec.name.as_str(), Producer::External(spec))?;
    }
    for (idx, step) in resolved.iter().enumerate() {
        for &(output, scope) in &step.outputs {
            claim(scope, Producer::Step { step: idx, output })?;
        }
    }
    Ok(producers)
}

/// Resolve every consumed scope name to its producer, verify the binding is
/// type-coherent, and collect producer-to-consumer step edges.
fn check_bindings(
    ensemble: &EnsembleDecl,
    resolved: &[ResolvedStep<'_>],
    producers: &BTreeMap<&str, Producer<'_>>,
) -> Result<BTreeSet<(usize, usize)>, BuildError> {
    let mut edges = BTreeSet::new();
    for (idx, step) in resolved.iter().enumerate() {
        for &(spec, scope) in &step.inputs {
            let producer = producers.get(scope).ok_or_else(|| BuildError::UnknownSource {
                stage: step.stage.id.to_string(),
                input: spec.name.to_string(),
                scope: scope.to_string(),
            })?;
            let produced = producer.spec();
            if !binding_compatible(produced, spec) {
                return Err(BuildError::BindingMismatch {
                    scope: scope.to_string(),
                    producer: producer.describe(&ensemble.steps),
                    produced: render(produced),
                    consumer: format!("stage `{}` input `{}`", step.stage.id, spec.name),
                    expected: render(spec),
                });
            }
            if let Producer::Step { step: src, .. } = producer {
                edges.insert((*src, idx));
            }
        }
    }
    Ok(edges)
}

/// Every declared ensemble output must come out of a step; forwarding an
/// ensemble input straight through is not wiring, it is a caller-side copy.
fn check_outputs(
    ensemble: &EnsembleDecl,
    producers: &BTreeMap<&str, Producer<'_>>,
) -> Result<(), BuildError> {
    for out in &ensemble.outputs {
        match producers.get(out.name.as_str()) {
            Some(producer @ Producer::Step { .. }) => {
                let produced = producer.spec();
                if !binding_compatible(produced, out) {
                    return Err(BuildError::BindingMismatch {
                        scope: out.name.to_string(),
                        producer: producer.describe(&ensemble.steps),
                        produced: render(produced),
                        consumer: "the ensemble output declaration".to_string(),
                        expected: render(out),
                    });
                }
            }
            _ => {
                return Err(BuildError::UnboundOutput {
                    output: out.name.to_string(),
                })
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over step indices. The ready heap pops the lowest
/// declaration index first, which pins the order of independent steps.
fn topo_order(
    ensemble: &EnsembleDecl,
    n: usize,
    edges: &BTreeSet<(usize, usize)>,
) -> Result<Vec<usize>, BuildError> {
    let mut in_degree = vec![0usize; n];
    let mut successors = vec![Vec::new(); n];
    for (src, dst) in edges {
        in_degree[*dst] += 1;
        successors[*src].push(*dst);
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|i| in_degree[*i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for &next in &successors[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < n {
        let mut stuck: Vec<String> = (0..n)
            .filter(|i| !order.contains(i))
            .map(|i| ensemble.steps[i].stage.clone())
            .collect();
        stuck.sort();
        stuck.dedup();
        return Err(BuildError::Cycle {
            ensemble: ensemble.name.clone(),
            stages: stuck,
        });
    }
    Ok(order)
}

/// Fixed dims must agree on both sides of a binding; a dynamic dim defers
/// the check to admission time, when the concrete shape is known.
fn binding_compatible(produced: &TensorSpec, expected: &TensorSpec) -> bool {
    produced.dtype == expected.dtype
        && produced.dims.len() == expected.dims.len()
        && produced
            .dims
            .iter()
            .zip(&expected.dims)
            .all(|(p, e)| match (p, e) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
}

fn render(spec: &TensorSpec) -> String {
    format!("{} {}", spec.dtype, spec.render_dims())
}
