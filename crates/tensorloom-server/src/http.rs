//! JSON/HTTP serving boundary.
//!
//! One route set per daemon, serving every loaded pipeline:
//!
//!   GET  /v2/health/live
//!   GET  /v2/health/ready
//!   GET  /v2/models/:name
//!   GET  /v2/models/:name/stats
//!   POST /v2/models/:name/infer
//!
//! Tensors cross the boundary as JSON arrays of numbers with explicit
//! `datatype` and `shape` fields. FP16 is rejected at this boundary; it has
//! no faithful JSON number representation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tensorloom_core::{DType, InferError, Shape, Tensor, TensorName, TensorSpec};
use tensorloom_runtime::{PipelineRequest, PipelineResponse, PipelineSnapshot, StatsSnapshot};
use tensorloom_stage_model::LabelTable;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::repository::ServingPipeline;

pub struct AppState {
    pub pipelines: BTreeMap<String, ServingPipeline>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v2/health/live", get(live))
        .route("/v2/health/ready", get(ready))
        .route("/v2/models/:name", get(metadata))
        .route("/v2/models/:name/stats", get(stats))
        .route("/v2/models/:name/infer", post(infer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct InferRequestBody {
    #[serde(default)]
    pub id: String,
    pub inputs: Vec<WireInput>,
    /// Empty means every declared pipeline output.
    #[serde(default)]
    pub outputs: Vec<RequestedOutput>,
}

#[derive(Debug, Deserialize)]
pub struct WireInput {
    pub name: String,
    pub datatype: String,
    pub shape: Vec<i64>,
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct RequestedOutput {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct InferResponseBody {
    pub model_name: String,
    pub id: String,
    pub outputs: Vec<WireOutput>,
}

#[derive(Debug, Serialize)]
pub struct WireOutput {
    pub name: String,
    pub datatype: String,
    pub shape: Vec<usize>,
    pub data: serde_json::Value,
    /// Top-1 class label, present when the producing model ships a label
    /// file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub caller_fault: bool,
    pub retry_safe: bool,
}

async fn live() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<Arc<AppState>>) -> StatusCode {
    // An empty repository is a misconfiguration, not a servable daemon.
    if state.pipelines.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn metadata(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let Some(pipeline) = state.pipelines.get(&name) else {
        return unknown_model(&name);
    };
    let plan = pipeline.executor.plan();
    let body = ModelMetadata {
        name: plan.pipeline.clone(),
        kind: pipeline.kind.clone(),
        max_batch: pipeline.max_batch(),
        inputs: plan
            .inputs
            .iter()
            .map(|spec| tensor_metadata(spec, None))
            .collect(),
        outputs: plan
            .outputs
            .iter()
            .map(|spec| tensor_metadata(spec, pipeline.labels.get(&spec.name).map(|t| t.len())))
            .collect(),
        stages: pipeline
            .stages
            .iter()
            .map(|member| {
                let spec = member.handle.spec();
                StageMetadata {
                    id: spec.id.to_string(),
                    kind: spec.kind.as_str().to_string(),
                    max_batch: spec.max_batch,
                    instances: member.instances,
                    per_slot_faults: member.handle.capabilities().per_slot_faults,
                }
            })
            .collect(),
    };
    Json(body).into_response()
}

async fn stats(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let Some(pipeline) = state.pipelines.get(&name) else {
        return unknown_model(&name);
    };
    let body = ModelStatsBody {
        name,
        totals: pipeline.stats.snapshot(),
        stages: pipeline
            .stages
            .iter()
            .map(|member| StageStatsBody {
                id: member.handle.spec().id.to_string(),
                counters: member.handle.stats().snapshot(),
            })
            .collect(),
    };
    Json(body).into_response()
}

async fn infer(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<InferRequestBody>,
) -> Response {
    let Some(pipeline) = state.pipelines.get(&name) else {
        return unknown_model(&name);
    };

    let mut inputs = Vec::with_capacity(body.inputs.len());
    for wire in body.inputs {
        match decode_input(wire) {
            Ok(pair) => inputs.push(pair),
            Err(message) => return bad_request(message),
        }
    }
    let outputs = if body.outputs.is_empty() {
        None
    } else {
        Some(
            body.outputs
                .into_iter()
                .map(|o| TensorName::new(o.name))
                .collect(),
        )
    };

    let started = Instant::now();
    let result = pipeline
        .executor
        .infer(PipelineRequest {
            id: body.id,
            inputs,
            outputs,
        })
        .await;
    let elapsed_us = started.elapsed().as_micros() as u64;

    match result {
        Ok(response) => {
            pipeline.stats.record_success(elapsed_us);
            debug!(model = %name, id = %response.id, elapsed_us, "request served");
            match encode_response(&name, response, &pipeline.labels) {
                Ok(body) => Json(body).into_response(),
                Err(message) => internal_error(message),
            }
        }
        Err(err) => {
            pipeline.stats.record_failure(elapsed_us);
            warn!(model = %name, error = %err, "request failed");
            infer_error(err)
        }
    }
}

#[derive(Debug, Serialize)]
struct ModelMetadata {
    name: String,
    kind: String,
    max_batch: usize,
    inputs: Vec<TensorMetadata>,
    outputs: Vec<TensorMetadata>,
    stages: Vec<StageMetadata>,
}

#[derive(Debug, Serialize)]
struct TensorMetadata {
    name: String,
    datatype: String,
    shape: Vec<i64>,
    /// Class count of the attached label table, for labeled outputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<usize>,
}

#[derive(Debug, Serialize)]
struct StageMetadata {
    id: String,
    kind: String,
    max_batch: usize,
    instances: usize,
    per_slot_faults: bool,
}

#[derive(Debug, Serialize)]
struct ModelStatsBody {
    name: String,
    #[serde(flatten)]
    totals: PipelineSnapshot,
    stages: Vec<StageStatsBody>,
}

#[derive(Debug, Serialize)]
struct StageStatsBody {
    id: String,
    #[serde(flatten)]
    counters: StatsSnapshot,
}

fn tensor_metadata(spec: &TensorSpec, labels: Option<usize>) -> TensorMetadata {
    TensorMetadata {
        name: spec.name.to_string(),
        datatype: spec.dtype.as_str().to_string(),
        shape: spec.dims.iter().map(|d| d.map_or(-1, |d| d as i64)).collect(),
        labels,
    }
}

fn decode_input(wire: WireInput) -> Result<(TensorName, Tensor), String> {
    let dtype: DType = wire
        .datatype
        .parse()
        .map_err(|e| format!("input `{}`: {e}", wire.name))?;

    let mut dims = Vec::with_capacity(wire.shape.len());
    for d in &wire.shape {
        if *d < 0 {
            return Err(format!("input `{}`: negative dim {d} in shape", wire.name));
        }
        dims.push(*d as usize);
    }
    let expected: usize = dims.iter().product();
    let shape = Shape::from_slice(&dims);

    let Some(items) = wire.data.as_array() else {
        return Err(format!("input `{}`: data must be a JSON array", wire.name));
    };
    if items.len() != expected {
        return Err(format!(
            "input `{}`: {} data elements for a shape holding {expected}",
            wire.name,
            items.len()
        ));
    }

    let tensor = match dtype {
        DType::U8 => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                let v = item
                    .as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| format!("input `{}`: {item} is not a UINT8 value", wire.name))?;
                values.push(v);
            }
            Tensor::from_u8(shape, &values)
        }
        DType::F32 => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                let v = item
                    .as_f64()
                    .ok_or_else(|| format!("input `{}`: {item} is not an FP32 value", wire.name))?;
                values.push(v as f32);
            }
            Tensor::from_f32(shape, &values)
        }
        DType::I32 => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                let v = item
                    .as_i64()
                    .and_then(|n| i32::try_from(n).ok())
                    .ok_or_else(|| format!("input `{}`: {item} is not an INT32 value", wire.name))?;
                values.push(v);
            }
            Tensor::from_i32(shape, &values)
        }
        DType::I64 => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                let v = item
                    .as_i64()
                    .ok_or_else(|| format!("input `{}`: {item} is not an INT64 value", wire.name))?;
                values.push(v);
            }
            Tensor::from_i64(shape, &values)
        }
        DType::F16 => {
            return Err(format!(
                "input `{}`: FP16 tensors cannot be carried as JSON numbers",
                wire.name
            ))
        }
    };
    Ok((TensorName::new(wire.name), tensor))
}

fn encode_response(
    model: &str,
    response: PipelineResponse,
    labels: &HashMap<TensorName, Arc<LabelTable>>,
) -> Result<InferResponseBody, String> {
    let mut outputs = Vec::with_capacity(response.outputs.len());
    for (name, tensor) in &response.outputs {
        outputs.push(encode_output(name, tensor, labels.get(name).map(Arc::as_ref))?);
    }
    Ok(InferResponseBody {
        model_name: model.to_string(),
        id: response.id,
        outputs,
    })
}

fn encode_output(
    name: &TensorName,
    tensor: &Tensor,
    labels: Option<&LabelTable>,
) -> Result<WireOutput, String> {
    let top = labels.and_then(|table| {
        tensor
            .as_f32()
            .and_then(|scores| table.top(&scores).map(|label| vec![label.to_string()]))
    });
    let data = match tensor.dtype() {
        DType::U8 => json_numbers(tensor.as_u8(), name)?,
        DType::F32 => json_numbers(tensor.as_f32(), name)?,
        DType::I32 => json_numbers(tensor.as_i32(), name)?,
        DType::I64 => json_numbers(tensor.as_i64(), name)?,
        DType::F16 => {
            return Err(format!(
                "output `{name}` is FP16, which the JSON boundary cannot carry"
            ))
        }
    };
    Ok(WireOutput {
        name: name.to_string(),
        datatype: tensor.dtype().as_str().to_string(),
        shape: tensor.shape().dims().to_vec(),
        data,
        labels: top,
    })
}

fn json_numbers<T: Serialize>(
    values: Option<Vec<T>>,
    name: &TensorName,
) -> Result<serde_json::Value, String> {
    let values = values.ok_or_else(|| format!("output `{name}` bytes disagree with its dtype"))?;
    serde_json::to_value(values)
        .map_err(|_| format!("output `{name}` holds values JSON cannot represent"))
}

fn unknown_model(name: &str) -> Response {
    let body = ErrorBody {
        error: format!("unknown servable `{name}`"),
        stage: None,
        caller_fault: true,
        retry_safe: false,
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

fn bad_request(message: String) -> Response {
    let body = ErrorBody {
        error: message,
        stage: None,
        caller_fault: true,
        retry_safe: false,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn internal_error(message: String) -> Response {
    let body = ErrorBody {
        error: message,
        stage: None,
        caller_fault: false,
        retry_safe: false,
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

fn infer_error(err: InferError) -> Response {
    let status = if err.caller_fault() {
        StatusCode::BAD_REQUEST
    } else if err.retry_safe() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = ErrorBody {
        error: err.to_string(),
        stage: err.stage().map(|s| s.to_string()),
        caller_fault: err.caller_fault(),
        retry_safe: err.retry_safe(),
    };
    (status, Json(body)).into_response()
}
