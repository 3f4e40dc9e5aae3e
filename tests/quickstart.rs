use stagehand::pipeline::Pipeline;
use stagehand::validation::validate_pipeline;
use std::path::Path;

#[test]
fn sample_pipeline_is_valid() {
    let pipeline = Pipeline::load(Path::new("pipelines/python-ci.yaml"))
        .expect("sample pipeline should load");
    let report = validate_pipeline(&pipeline, &[]);
    assert!(
        report.is_ok(),
        "sample pipeline should pass validation: {:?}",
        report.errors
    );
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert!(pipeline.stage("run-tests").unwrap().best_effort);
}
