use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tempfile::TempDir;
use tensorloom_core::{
    DType, InferError, Shape, SlotInputs, StageAdapter, StageKind, StageSpec, Tensor, TensorSpec,
};
use tensorloom_stage_model::{LabelTable, ModelRuntime, ModelStage};

enum Script {
    Double,
    Fail,
    ExtraOutput,
    WrongLeadingDim,
}

/// Scripted stand-in for a compiled executor. `Double` doubles every value
/// and keeps the stacked shape; the other scripts break the contract in one
/// specific way. Records the stacked input shape of every call.
struct Scripted {
    seen: Arc<Mutex<Vec<Vec<usize>>>>,
    script: Script,
}

impl ModelRuntime for Scripted {
    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        self.seen
            .lock()
            .unwrap()
            .push(inputs[0].shape().dims().to_vec());
        match self.script {
            Script::Fail => bail!("executor exploded"),
            Script::Double => {
                let doubled: Vec<f32> = inputs[0]
                    .as_f32()
                    .unwrap()
                    .iter()
                    .map(|v| v * 2.0)
                    .collect();
                Ok(vec![Tensor::from_f32(inputs[0].shape().clone(), &doubled)])
            }
            Script::ExtraOutput => {
                let values = inputs[0].as_f32().unwrap();
                let echo = Tensor::from_f32(inputs[0].shape().clone(), &values);
                Ok(vec![echo.clone(), echo])
            }
            Script::WrongLeadingDim => Ok(vec![Tensor::from_f32(
                Shape::from_slice(&[1, 2]),
                &[0.0, 0.0],
            )]),
        }
    }
}

fn spec() -> StageSpec {
    StageSpec {
        id: "classify".into(),
        kind: StageKind::Model,
        inputs: vec![TensorSpec::new("in", DType::F32, vec![Some(2)])],
        outputs: vec![TensorSpec::new("out", DType::F32, vec![Some(2)])],
        max_batch: 4,
    }
}

fn adapter(script: Script) -> (ModelStage, Arc<Mutex<Vec<Vec<usize>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stage = ModelStage::new(
        spec(),
        Box::new(Scripted {
            seen: seen.clone(),
            script,
        }),
    )
    .unwrap();
    (stage, seen)
}

fn slot(values: [f32; 2]) -> SlotInputs {
    vec![("in".into(), Tensor::from_f32(Shape::from_slice(&[2]), &values))]
}

#[test]
fn slots_stack_and_split_in_order() {
    let (mut adapter, seen) = adapter(Script::Double);

    let results = adapter
        .execute(vec![slot([1.0, 2.0]), slot([3.0, 4.0]), slot([5.0, 6.0])])
        .unwrap();

    assert_eq!(seen.lock().unwrap().as_slice(), &[vec![3, 2]]);
    assert_eq!(results.len(), 3);
    for (i, result) in results.into_iter().enumerate() {
        let outputs = result.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].0.as_str(), "out");
        assert_eq!(outputs[0].1.shape().dims(), &[2]);
        let expected = vec![(2 * i + 1) as f32 * 2.0, (2 * i + 2) as f32 * 2.0];
        assert_eq!(outputs[0].1.as_f32().unwrap(), expected);
    }
}

#[test]
fn executor_failure_lands_on_the_whole_batch() {
    let (mut adapter, _) = adapter(Script::Fail);

    let err = adapter
        .execute(vec![slot([1.0, 2.0]), slot([3.0, 4.0])])
        .unwrap_err();
    match err {
        InferError::ExecutorFault {
            stage,
            retry_safe,
            message,
        } => {
            assert_eq!(stage.as_str(), "classify");
            assert!(!retry_safe);
            assert!(message.contains("executor exploded"));
        }
        other => panic!("expected an executor fault, got {other:?}"),
    }
}

#[test]
fn extra_output_breaks_the_slot_contract() {
    let (mut adapter, _) = adapter(Script::ExtraOutput);

    let err = adapter.execute(vec![slot([1.0, 2.0])]).unwrap_err();
    assert!(matches!(err, InferError::ExecutorFault { .. }));
    assert!(err.to_string().contains("returned 2 outputs, expected 1"));
}

#[test]
fn batch_dim_mismatch_breaks_the_slot_contract() {
    let (mut adapter, _) = adapter(Script::WrongLeadingDim);

    let err = adapter
        .execute(vec![slot([1.0, 2.0]), slot([3.0, 4.0]), slot([5.0, 6.0])])
        .unwrap_err();
    assert!(err.to_string().contains("[1, 2]"));
}

#[test]
fn dynamic_input_dims_are_rejected() {
    let mut bad = spec();
    bad.inputs[0].dims = vec![Some(3), None];
    let err = ModelStage::new(
        bad,
        Box::new(Scripted {
            seen: Arc::default(),
            script: Script::Double,
        }),
    )
    .unwrap_err();
    assert!(err.to_string().contains("fixed dims"));
}

#[test]
fn label_table_maps_indices_and_argmax() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "tench\ngoldfish\ngreat white shark\n")?;

    let table = LabelTable::load(&path)?;
    assert_eq!(table.len(), 3);
    assert_eq!(table.get(1), Some("goldfish"));
    assert_eq!(table.get(3), None);
    assert_eq!(table.top(&[0.1, 0.2, 1.5]), Some("great white shark"));
    assert_eq!(table.top(&[]), None);
    Ok(())
}

#[test]
fn blank_label_file_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("labels.txt");
    std::fs::write(&path, "\n\n")?;

    assert!(LabelTable::load(&path).is_err());
    Ok(())
}
