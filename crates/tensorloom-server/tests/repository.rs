use std::fs;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tensorloom_core::{StageId, TensorName};
use tensorloom_server::{activate, load_repository};

const DECODE_RESIZE: &str = r#"{
  "kind": "preprocessing",
  "max_batch_size": 8,
  "instances": 2,
  "input": [{ "name": "raw", "datatype": "UINT8", "dims": [-1] }],
  "output": [{ "name": "image", "datatype": "FP32", "dims": [3, 224, 224] }],
  "preprocessing": { "target_height": 224, "target_width": 224 }
}"#;

const CLASSIFY: &str = r#"{
  "kind": "model",
  "max_batch_size": 4,
  "input": [{ "name": "pixels", "datatype": "FP32", "dims": [3, 224, 224] }],
  "output": [{ "name": "scores", "datatype": "FP32", "dims": [1000] }],
  "model": { "artifact": "model.onnx", "labels": "labels.txt" }
}"#;

const IMAGENET_ENSEMBLE: &str = r#"{
  "kind": "ensemble",
  "input": [{ "name": "IMAGE_BYTES", "datatype": "UINT8", "dims": [-1] }],
  "output": [{ "name": "SCORES", "datatype": "FP32", "dims": [1000] }],
  "step": [
    {
      "stage": "decode_resize",
      "input_map": { "raw": "IMAGE_BYTES" },
      "output_map": { "image": "pixels_t" }
    },
    {
      "stage": "classify",
      "input_map": { "pixels": "pixels_t" },
      "output_map": { "scores": "SCORES" }
    }
  ]
}"#;

fn write_servable(root: &Path, name: &str, config: &str) {
    let dir = root.join(name);
    fs::create_dir_all(&dir).expect("create servable dir");
    fs::write(dir.join("config.json"), config).expect("write config");
}

fn demo_repository() -> TempDir {
    let root = TempDir::new().expect("tempdir");
    write_servable(root.path(), "decode_resize", DECODE_RESIZE);
    write_servable(root.path(), "classify", CLASSIFY);
    fs::write(
        root.path().join("classify").join("labels.txt"),
        "tabby\ntiger cat\n",
    )
    .expect("write labels");
    write_servable(root.path(), "imagenet_ensemble", IMAGENET_ENSEMBLE);
    root
}

#[test]
fn repository_compiles_every_servable() {
    let root = demo_repository();
    let repo = load_repository(root.path()).expect("repository should load");

    let servables: Vec<&str> = repo.servables.keys().map(String::as_str).collect();
    assert_eq!(
        servables,
        vec!["classify", "decode_resize", "imagenet_ensemble"]
    );
    assert_eq!(repo.stages.len(), 2);
    assert!(repo.stages.contains_key(&StageId::new("decode_resize")));
    assert!(repo.stages.contains_key(&StageId::new("classify")));

    assert_eq!(repo.servables["imagenet_ensemble"].kind, "ensemble");
    assert_eq!(repo.servables["decode_resize"].kind, "preprocessing");
    assert_eq!(repo.servables["classify"].kind, "model");
}

#[test]
fn ensemble_plan_routes_through_scope_names() {
    let root = demo_repository();
    let repo = load_repository(root.path()).expect("repository should load");

    let plan = &repo.servables["imagenet_ensemble"].plan;
    assert_eq!(plan.pipeline, "imagenet_ensemble");
    assert_eq!(plan.steps.len(), 2);

    let decode = &plan.steps[0];
    assert_eq!(decode.stage, StageId::new("decode_resize"));
    assert_eq!(decode.inputs[0].local.as_str(), "raw");
    assert_eq!(decode.inputs[0].scope.as_str(), "IMAGE_BYTES");
    assert!(decode.final_outputs.is_empty());

    let classify = &plan.steps[1];
    assert_eq!(classify.stage, StageId::new("classify"));
    assert_eq!(classify.inputs[0].scope.as_str(), "pixels_t");
    assert_eq!(classify.outputs[0].local.as_str(), "scores");
    assert_eq!(classify.outputs[0].scope.as_str(), "SCORES");
    assert_eq!(classify.final_outputs.len(), 1);
}

#[test]
fn labels_attach_to_the_producing_output() {
    let root = demo_repository();
    let repo = load_repository(root.path()).expect("repository should load");

    let ensemble = &repo.servables["imagenet_ensemble"];
    let table = ensemble
        .labels
        .get(&TensorName::new("SCORES"))
        .expect("ensemble output should carry the classifier's labels");
    assert_eq!(table.len(), 2);
    assert_eq!(table.get(1), Some("tiger cat"));

    let bare = &repo.servables["classify"];
    assert!(bare.labels.contains_key(&TensorName::new("scores")));

    let preprocessing = &repo.servables["decode_resize"];
    assert!(preprocessing.labels.is_empty());
}

#[test]
fn single_stage_plans_serve_bare_stages() {
    let root = demo_repository();
    let repo = load_repository(root.path()).expect("repository should load");

    let plan = &repo.servables["classify"].plan;
    assert_eq!(plan.pipeline, "classify");
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.inputs[0].name.as_str(), "pixels");
    assert_eq!(plan.outputs[0].name.as_str(), "scores");
    assert_eq!(plan.steps[0].final_outputs.len(), 1);
}

#[test]
fn directory_without_config_aborts_the_load() {
    let root = demo_repository();
    fs::create_dir(root.path().join("stray")).expect("create dir");

    let err = load_repository(root.path()).expect_err("stray directory should fail");
    assert!(
        format!("{err:#}").contains("no config.json"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn malformed_json_aborts_the_load() {
    let root = demo_repository();
    fs::write(
        root.path().join("classify").join("config.json"),
        "kind = \"model\"",
    )
    .expect("overwrite config");

    let err = load_repository(root.path()).expect_err("bad JSON should fail");
    assert!(
        format!("{err:#}").contains("malformed config for servable `classify`"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn unknown_stage_reference_aborts_the_load() {
    let root = demo_repository();
    fs::remove_dir_all(root.path().join("classify")).expect("drop stage dir");

    let err = load_repository(root.path()).expect_err("dangling step should fail");
    assert!(
        format!("{err:#}").contains("failed to compile ensemble `imagenet_ensemble`"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn config_name_must_match_the_directory() {
    let root = TempDir::new().expect("tempdir");
    let renamed = DECODE_RESIZE.replacen('{', "{\n  \"name\": \"other\",", 1);
    write_servable(root.path(), "decode_resize", &renamed);

    let err = load_repository(root.path()).expect_err("name mismatch should fail");
    assert!(
        format!("{err:#}").contains("does not match directory"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn missing_label_file_aborts_the_load() {
    let root = TempDir::new().expect("tempdir");
    write_servable(root.path(), "classify", CLASSIFY);

    let err = load_repository(root.path()).expect_err("absent labels.txt should fail");
    assert!(
        format!("{err:#}").contains("label file for servable `classify`"),
        "unexpected error: {err:#}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn preprocessing_stage_activates_without_artifacts() {
    let root = TempDir::new().expect("tempdir");
    write_servable(root.path(), "decode_resize", DECODE_RESIZE);

    let repo = load_repository(root.path()).expect("repository should load");
    let pipelines = activate(repo, Duration::from_millis(2)).expect("activation should succeed");

    let served = &pipelines["decode_resize"];
    assert_eq!(served.kind, "preprocessing");
    assert_eq!(served.max_batch(), 8);
    assert_eq!(served.stages.len(), 1);
    assert_eq!(served.stages[0].instances, 2);
}
