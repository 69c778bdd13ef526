//! Serde vocabulary for the model-repository config files, plus the
//! validated declarations the builder consumes. Each servable lives in its
//! own repository subdirectory holding one `config.json` describing either
//! a stage or an ensemble.

use std::collections::BTreeMap;

use serde::Deserialize;
use tensorloom_core::{StageId, StageKind, StageSpec, TensorSpec};

use crate::BuildError;

/// One declared IO tensor: `-1` dims are dynamic.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TensorDecl {
    pub name: String,
    pub datatype: String,
    pub dims: Vec<i64>,
}

impl TensorDecl {
    fn to_spec(&self, servable: &str) -> Result<TensorSpec, BuildError> {
        let dtype = self
            .datatype
            .parse()
            .map_err(|_| BuildError::InvalidTensorDecl {
                servable: servable.to_string(),
                tensor: self.name.clone(),
                reason: format!("unknown datatype `{}`", self.datatype),
            })?;
        let mut dims = Vec::with_capacity(self.dims.len());
        for d in &self.dims {
            match *d {
                -1 => dims.push(None),
                d if d >= 1 => dims.push(Some(d as usize)),
                other => {
                    return Err(BuildError::InvalidTensorDecl {
                        servable: servable.to_string(),
                        tensor: self.name.clone(),
                        reason: format!("dim {other} is neither positive nor -1"),
                    })
                }
            }
        }
        if dims.is_empty() {
            return Err(BuildError::InvalidTensorDecl {
                servable: servable.to_string(),
                tensor: self.name.clone(),
                reason: "dims must not be empty".to_string(),
            });
        }
        Ok(TensorSpec::new(self.name.as_str(), dtype, dims))
    }
}

/// One ensemble step: which stage runs, and how its local tensor names bind
/// to ensemble-scope names. Maps are ordered so compiled plans are
/// reproducible byte for byte.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StepDecl {
    pub stage: String,
    #[serde(default)]
    pub input_map: BTreeMap<String, String>,
    #[serde(default)]
    pub output_map: BTreeMap<String, String>,
}

/// Engine parameters for a preprocessing stage (decode, resize, normalize).
/// Mean/std defaults are the ImageNet constants scaled to byte range.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PreprocessingParams {
    pub target_height: usize,
    pub target_width: usize,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_mean() -> [f32; 3] {
    [0.485 * 255.0, 0.456 * 255.0, 0.406 * 255.0]
}

fn default_std() -> [f32; 3] {
    [0.229 * 255.0, 0.224 * 255.0, 0.225 * 255.0]
}

/// Artifact references for a model stage, relative to the servable's
/// directory.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ModelParams {
    pub artifact: String,
    #[serde(default)]
    pub labels: Option<String>,
}

/// Raw deserialization target for one `config.json`. Validation happens in
/// [`ServableConfig::into_decl`]; keeping this struct dumb lets any config
/// format feed it.
#[derive(Clone, Debug, Deserialize)]
pub struct ServableConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    #[serde(default)]
    pub instances: Option<usize>,
    #[serde(default, rename = "input")]
    pub inputs: Vec<TensorDecl>,
    #[serde(default, rename = "output")]
    pub outputs: Vec<TensorDecl>,
    #[serde(default, rename = "step")]
    pub steps: Vec<StepDecl>,
    #[serde(default)]
    pub preprocessing: Option<PreprocessingParams>,
    #[serde(default)]
    pub model: Option<ModelParams>,
}

/// Kind-specific engine configuration attached to a stage declaration.
#[derive(Clone, Debug, PartialEq)]
pub enum StageParams {
    Preprocessing(PreprocessingParams),
    Model(ModelParams),
}

/// A validated stage declaration: the immutable spec plus how many worker
/// instances (the per-stage concurrency cap) to run.
#[derive(Clone, Debug)]
pub struct StageDecl {
    pub spec: StageSpec,
    pub instances: usize,
    pub params: StageParams,
}

/// A validated ensemble declaration, ready for plan compilation.
#[derive(Clone, Debug)]
pub struct EnsembleDecl {
    pub name: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub steps: Vec<StepDecl>,
}

/// Everything a repository subdirectory can declare.
#[derive(Clone, Debug)]
pub enum ServableDecl {
    Stage(StageDecl),
    Ensemble(EnsembleDecl),
}

impl ServableConfig {
    /// Validate the raw config into a declaration. `default_name` is the
    /// servable's directory name; an explicit `name` must match it.
    pub fn into_decl(self, default_name: &str) -> Result<ServableDecl, BuildError> {
        let name = match &self.name {
            Some(explicit) if explicit != default_name => {
                return Err(BuildError::Malformed {
                    servable: default_name.to_string(),
                    reason: format!(
                        "config name `{explicit}` does not match directory `{default_name}`"
                    ),
                })
            }
            _ => default_name.to_string(),
        };

        match self.kind.as_str() {
            "preprocessing" => self.into_stage(name, StageKind::Preprocessing),
            "model" => self.into_stage(name, StageKind::Model),
            "ensemble" => self.into_ensemble(name),
            other => Err(BuildError::InvalidKind {
                servable: name,
                kind: other.to_string(),
            }),
        }
    }

    fn into_stage(self, name: String, kind: StageKind) -> Result<ServableDecl, BuildError> {
        let malformed = |reason: &str| BuildError::Malformed {
            servable: name.clone(),
            reason: reason.to_string(),
        };

        if !self.steps.is_empty() {
            return Err(malformed("stage configs must not declare steps"));
        }
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(malformed("stages need at least one input and one output"));
        }
        let max_batch = match self.max_batch_size {
            Some(n) if n >= 1 => n,
            Some(_) => return Err(malformed("max_batch_size must be at least 1")),
            None => return Err(malformed("stages must declare max_batch_size")),
        };
        let instances = match self.instances {
            Some(0) => return Err(malformed("instances must be at least 1")),
            Some(n) => n,
            None => 1,
        };
        let params = match kind {
            StageKind::Preprocessing => StageParams::Preprocessing(
                self.preprocessing
                    .ok_or_else(|| malformed("missing preprocessing params"))?,
            ),
            StageKind::Model => StageParams::Model(
                self.model.ok_or_else(|| malformed("missing model params"))?,
            ),
        };

        let inputs = decl_specs(&self.inputs, &name)?;
        let outputs = decl_specs(&self.outputs, &name)?;

        Ok(ServableDecl::Stage(StageDecl {
            spec: StageSpec {
                id: StageId::new(name),
                kind,
                inputs,
                outputs,
                max_batch,
            },
            instances,
            params,
        }))
    }

    fn into_ensemble(self, name: String) -> Result<ServableDecl, BuildError> {
        let malformed = |reason: &str| BuildError::Malformed {
            servable: name.clone(),
            reason: reason.to_string(),
        };

        if self.preprocessing.is_some() || self.model.is_some() {
            return Err(malformed("ensemble configs must not carry engine params"));
        }
        if self.steps.is_empty() {
            return Err(malformed("ensembles need at least one step"));
        }
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(malformed(
                "ensembles need at least one input and one output",
            ));
        }

        let inputs = decl_specs(&self.inputs, &name)?;
        let outputs = decl_specs(&self.outputs, &name)?;

        Ok(ServableDecl::Ensemble(EnsembleDecl {
            name,
            inputs,
            outputs,
            steps: self.steps,
        }))
    }
}

fn decl_specs(decls: &[TensorDecl], servable: &str) -> Result<Vec<TensorSpec>, BuildError> {
    let mut specs: Vec<TensorSpec> = Vec::with_capacity(decls.len());
    for decl in decls {
        let spec = decl.to_spec(servable)?;
        if specs.iter().any(|s| s.name == spec.name) {
            return Err(BuildError::InvalidTensorDecl {
                servable: servable.to_string(),
                tensor: decl.name.clone(),
                reason: "declared more than once".to_string(),
            });
        }
        specs.push(spec);
    }
    Ok(specs)
}
