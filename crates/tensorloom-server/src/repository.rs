//! Model repository loading and activation.
//!
//! Loading happens in two phases. [`load_repository`] walks the repository
//! root, parses every servable's `config.json`, and compiles an
//! [`ExecutionPlan`] for each servable (single-stage plans for bare stages,
//! built plans for ensembles). [`activate`] then instantiates the stage
//! executors, starts one batching runtime per stage, and wires a
//! [`PipelineExecutor`] per servable. Any error in either phase aborts
//! startup; a repository that loads is a repository that serves.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tensorloom_core::{StageAdapter, StageId, TensorName};
use tensorloom_graph::{
    build_plan, single_stage_plan, EnsembleDecl, ExecutionPlan, ModelParams, ServableConfig,
    ServableDecl, StageDecl, StageParams,
};
use tensorloom_runtime::{launch_stage, BatchPolicy, PipelineExecutor, PipelineStats, StageHandle};
use tensorloom_stage_image::{ImageOptions, ImagePipeline};
use tensorloom_stage_model::{LabelTable, ModelStage, TractRuntime};
use tracing::info;

/// A stage parsed from the repository, not yet running.
#[derive(Debug)]
pub struct LoadedStage {
    /// The servable's directory, for resolving artifact and label paths.
    pub dir: PathBuf,
    pub decl: StageDecl,
    pub labels: Option<Arc<LabelTable>>,
}

/// A servable with its compiled plan, ready for activation.
#[derive(Debug)]
pub struct Servable {
    pub plan: ExecutionPlan,
    pub kind: String,
    /// Label tables keyed by the external output they classify.
    pub labels: HashMap<TensorName, Arc<LabelTable>>,
}

/// Everything [`load_repository`] produced: stage declarations plus one
/// compiled servable per repository directory and per ensemble.
#[derive(Debug)]
pub struct Repository {
    pub stages: BTreeMap<StageId, LoadedStage>,
    pub servables: BTreeMap<String, Servable>,
}

/// A running stage plus the static facts the metadata endpoint reports.
#[derive(Clone)]
pub struct StageRuntime {
    pub handle: StageHandle,
    pub instances: usize,
}

/// One served endpoint: the executor for its plan, the stages it crosses,
/// and the counters the stats endpoint reads.
pub struct ServingPipeline {
    pub executor: PipelineExecutor,
    pub kind: String,
    pub labels: HashMap<TensorName, Arc<LabelTable>>,
    pub stats: Arc<PipelineStats>,
    pub stages: Vec<StageRuntime>,
}

impl ServingPipeline {
    /// The largest request batch the pipeline accepts end to end: the
    /// smallest `max_batch` among its member stages.
    pub fn max_batch(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.handle.spec().max_batch)
            .min()
            .unwrap_or(0)
    }
}

/// Parses every servable under `root` and compiles an execution plan per
/// servable. Fails on the first malformed config, unknown stage reference,
/// or uncompilable ensemble.
pub fn load_repository(root: &Path) -> Result<Repository> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("failed to read model repository {}", root.display()))?;
    let mut dirs: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to scan {}", root.display()))?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let mut stages: BTreeMap<StageId, LoadedStage> = BTreeMap::new();
    let mut ensembles: Vec<EnsembleDecl> = Vec::new();
    for dir in dirs {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match load_servable(&dir, &name)? {
            ServableDecl::Stage(decl) => {
                let labels = load_stage_labels(&dir, &name, &decl)?;
                stages.insert(decl.spec.id.clone(), LoadedStage { dir, decl, labels });
            }
            ServableDecl::Ensemble(decl) => ensembles.push(decl),
        }
    }

    let specs: HashMap<_, _> = stages
        .iter()
        .map(|(id, loaded)| (id.clone(), loaded.decl.spec.clone()))
        .collect();

    let mut servables = BTreeMap::new();
    for ensemble in ensembles {
        let plan = build_plan(&ensemble, &specs)
            .with_context(|| format!("failed to compile ensemble `{}`", ensemble.name))?;
        let labels = attach_labels(&plan, &stages);
        servables.insert(
            ensemble.name.clone(),
            Servable {
                plan,
                kind: "ensemble".to_string(),
                labels,
            },
        );
    }
    for (id, loaded) in &stages {
        let plan = single_stage_plan(&loaded.decl.spec);
        let labels = attach_labels(&plan, &stages);
        servables.insert(
            id.to_string(),
            Servable {
                plan,
                kind: loaded.decl.spec.kind.as_str().to_string(),
                labels,
            },
        );
    }

    info!(
        stages = stages.len(),
        servables = servables.len(),
        "model repository loaded"
    );
    Ok(Repository { stages, servables })
}

/// Starts every stage and wires one executor per servable. Stage handles
/// are shared: an ensemble step and a direct request to the same stage land
/// in the same batching queue.
pub fn activate(
    repository: Repository,
    batch_delay: Duration,
) -> Result<BTreeMap<String, ServingPipeline>> {
    let mut running: HashMap<StageId, StageRuntime> = HashMap::new();
    for (id, loaded) in &repository.stages {
        let adapters = build_adapters(loaded)
            .with_context(|| format!("failed to instantiate stage `{id}`"))?;
        let policy = BatchPolicy {
            max_batch: loaded.decl.spec.max_batch,
            max_delay: batch_delay,
        };
        let handle = launch_stage(adapters, policy)
            .with_context(|| format!("failed to start stage `{id}`"))?;
        info!(
            stage = %id,
            kind = %loaded.decl.spec.kind,
            instances = loaded.decl.instances,
            max_batch = loaded.decl.spec.max_batch,
            "stage running"
        );
        running.insert(
            id.clone(),
            StageRuntime {
                handle,
                instances: loaded.decl.instances,
            },
        );
    }

    let mut pipelines = BTreeMap::new();
    for (name, servable) in repository.servables {
        let mut handles = HashMap::new();
        let mut members = Vec::new();
        for id in servable.plan.stage_ids() {
            // load_repository only emits plans over stages it parsed.
            let runtime = running
                .get(&id)
                .with_context(|| format!("servable `{name}` references unloaded stage `{id}`"))?;
            handles.insert(id.clone(), runtime.handle.clone());
            members.push(runtime.clone());
        }
        let executor = PipelineExecutor::new(Arc::new(servable.plan), handles)
            .with_context(|| format!("failed to wire servable `{name}`"))?;
        info!(servable = %name, kind = %servable.kind, "servable ready");
        pipelines.insert(
            name,
            ServingPipeline {
                executor,
                kind: servable.kind,
                labels: servable.labels,
                stats: Arc::new(PipelineStats::new()),
                stages: members,
            },
        );
    }
    Ok(pipelines)
}

fn load_servable(dir: &Path, name: &str) -> Result<ServableDecl> {
    let config_path = dir.join("config.json");
    if !config_path.is_file() {
        bail!("servable directory `{name}` has no config.json");
    }
    let raw = fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let config: ServableConfig = serde_json::from_str(&raw)
        .with_context(|| format!("malformed config for servable `{name}`"))?;
    let decl = config
        .into_decl(name)
        .with_context(|| format!("invalid config for servable `{name}`"))?;
    Ok(decl)
}

fn load_stage_labels(dir: &Path, name: &str, decl: &StageDecl) -> Result<Option<Arc<LabelTable>>> {
    let StageParams::Model(ModelParams {
        labels: Some(file), ..
    }) = &decl.params
    else {
        return Ok(None);
    };
    let table = LabelTable::load(&dir.join(file))
        .with_context(|| format!("failed to load label file for servable `{name}`"))?;
    Ok(Some(Arc::new(table)))
}

/// Wires each external output to the label table of the model stage that
/// produces it. Only a model's primary output (its first declared one)
/// carries labels; secondary outputs such as raw embeddings stay bare.
fn attach_labels(
    plan: &ExecutionPlan,
    stages: &BTreeMap<StageId, LoadedStage>,
) -> HashMap<TensorName, Arc<LabelTable>> {
    let mut attached = HashMap::new();
    for output in &plan.outputs {
        for step in &plan.steps {
            if !step.final_outputs.contains(&output.name) {
                continue;
            }
            let Some(binding) = step.outputs.iter().find(|b| b.scope == output.name) else {
                continue;
            };
            let Some(loaded) = stages.get(&step.stage) else {
                continue;
            };
            let Some(table) = &loaded.labels else {
                continue;
            };
            if loaded.decl.spec.outputs.first().map(|s| &s.name) == Some(&binding.local) {
                attached.insert(output.name.clone(), Arc::clone(table));
            }
        }
    }
    attached
}

fn build_adapters(loaded: &LoadedStage) -> Result<Vec<Box<dyn StageAdapter>>> {
    let decl = &loaded.decl;
    let mut adapters: Vec<Box<dyn StageAdapter>> = Vec::with_capacity(decl.instances);
    for _ in 0..decl.instances {
        let adapter: Box<dyn StageAdapter> = match &decl.params {
            StageParams::Preprocessing(p) => {
                let options = ImageOptions {
                    target_height: p.target_height,
                    target_width: p.target_width,
                    mean: p.mean,
                    std: p.std,
                };
                Box::new(ImagePipeline::new(decl.spec.clone(), options)?)
            }
            StageParams::Model(m) => {
                let runtime = TractRuntime::load(&loaded.dir.join(&m.artifact))?;
                Box::new(ModelStage::new(decl.spec.clone(), Box::new(runtime))?)
            }
        };
        adapters.push(adapter);
    }
    Ok(adapters)
}
