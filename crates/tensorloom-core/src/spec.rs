use std::fmt;

use crate::{DType, Shape};

/// Name of a tensor, either stage-local or in ensemble scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorName(pub String);

impl TensorName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TensorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TensorName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a stage as declared in the model repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The two executable-unit flavors a pipeline composes. New kinds are added
/// as variants plus an adapter implementation, never by subclassing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Preprocessing,
    Model,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Preprocessing => "preprocessing",
            StageKind::Model => "model",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared IO slot of a stage: dtype plus per-dimension bounds.
/// `None` dims are dynamic (`-1` in config files) and resolve per request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: TensorName,
    pub dtype: DType,
    pub dims: Vec<Option<usize>>,
}

impl TensorSpec {
    pub fn new(name: impl Into<TensorName>, dtype: DType, dims: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            dtype,
            dims,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Whether a concrete shape satisfies the declared bounds: equal rank and
    /// every fixed dim equal. Dynamic dims admit any size.
    pub fn admits(&self, shape: &Shape) -> bool {
        self.dims.len() == shape.rank()
            && self
                .dims
                .iter()
                .zip(shape.dims())
                .all(|(decl, actual)| match decl {
                    Some(fixed) => fixed == actual,
                    None => true,
                })
    }

    /// Declared dims in the `-1`-for-dynamic grammar, for error messages.
    pub fn render_dims(&self) -> String {
        let mut out = String::from("[");
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            match d {
                Some(v) => out.push_str(&v.to_string()),
                None => out.push_str("-1"),
            }
        }
        out.push(']');
        out
    }
}

/// Immutable description of one stage: identity, kind, ordered IO, and the
/// largest physical batch its executor accepts.
#[derive(Clone, Debug)]
pub struct StageSpec {
    pub id: StageId,
    pub kind: StageKind,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub max_batch: usize,
}

impl StageSpec {
    pub fn input(&self, name: &TensorName) -> Option<&TensorSpec> {
        self.inputs.iter().find(|s| &s.name == name)
    }

    pub fn output(&self, name: &TensorName) -> Option<&TensorSpec> {
        self.outputs.iter().find(|s| &s.name == name)
    }
}
