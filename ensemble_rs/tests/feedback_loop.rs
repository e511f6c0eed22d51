//! Cyclic two-model couplings: one that contracts to a fixed point and one
//! that diverges until the iteration cap.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ensemble_rs::data::{shared, PointSet, SharedStore};
use ensemble_rs::model::external::ExternalModel;
use ensemble_rs::{
    EnsembleConfig, EnsembleModel, FinishedJob, InitContext, JobHandler, LocalJobHandler, Model,
    RunInfo, SampleDescription, Value,
};

/// Surface per-iteration residual logs when RUST_LOG is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn loop_config(settings: &str) -> EnsembleConfig {
    EnsembleConfig::from_json(&format!(
        r#"{{
            "name": "loop",
            "subModel": [
                {{"name": "forward", "inputNames": [], "targetEvaluation": "forwardData"}},
                {{"name": "feedback", "inputNames": [], "targetEvaluation": "feedbackData"}}
            ]{settings}
        }}"#,
    ))
    .unwrap()
}

fn loop_stores() -> Vec<SharedStore> {
    vec![
        shared(PointSet::new("forwardData", ["x", "z"], ["y"])),
        shared(PointSet::new("feedbackData", ["y"], ["z"])),
    ]
}

async fn initialized_loop(
    config: EnsembleConfig,
    forward: ExternalModel,
    feedback: ExternalModel,
    sampled: &[&str],
) -> EnsembleModel {
    let ensemble = EnsembleModel::new(
        config,
        [
            Arc::new(forward) as Arc<dyn Model>,
            Arc::new(feedback) as Arc<dyn Model>,
        ],
        loop_stores(),
    )
    .unwrap();
    ensemble
        .initialize(
            &RunInfo::default(),
            &[],
            &InitContext {
                sampled_variables: sampled.iter().map(|s| (*s).to_owned()).collect(),
            },
        )
        .await
        .unwrap();
    ensemble
}

async fn run_sample(
    ensemble: &EnsembleModel,
    handler: &Arc<dyn JobHandler>,
    sample: &SampleDescription,
) -> FinishedJob {
    let packet = ensemble
        .create_new_input(&[], &sample.sampler_tag, sample)
        .unwrap();
    ensemble.run(packet, handler).await.unwrap();
    while !handler.is_finished(&sample.prefix) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    handler.take_finished(&sample.prefix, "any").unwrap()
}

#[tokio::test]
async fn contracting_loop_converges_to_the_fixed_point() {
    init_tracing();
    // y = x + z/2 and z = y/2 have the unique fixed point y = 4x/3, z = 2x/3.
    let forward = ExternalModel::from_fn("forward", ["x", "z"], ["y"], |ns| {
        let x = ns.scalar("x")?;
        let z = ns.scalar("z")?;
        ns.set("y", x + 0.5 * z);
        Ok(())
    });
    let feedback = ExternalModel::from_fn("feedback", ["y"], ["z"], |ns| {
        let y = ns.scalar("y")?;
        ns.set("z", 0.5 * y);
        Ok(())
    });
    let ensemble = initialized_loop(loop_config(""), forward, feedback, &["x"]).await;
    assert!(ensemble.execution_order().unwrap().cyclic);

    let handler: Arc<dyn JobHandler> = LocalJobHandler::new(2);
    let sample = SampleDescription {
        prefix: "1".to_owned(),
        sampler_tag: "MonteCarlo".to_owned(),
        sampled_vars: BTreeMap::from([("x".to_owned(), Value::Scalar(4.0))]),
        sampled_vars_pb: BTreeMap::from([("x".to_owned(), 1.0)]),
        extra: BTreeMap::new(),
    };
    let finished = run_sample(&ensemble, &handler, &sample).await;

    let mut sink = PointSet::new("results", ["x"], ["y", "z"]);
    ensemble.collect_output(&finished, &mut sink).unwrap();

    let y = sink.latest("y").unwrap().coupling_scalar().unwrap();
    let z = sink.latest("z").unwrap().coupling_scalar().unwrap();
    assert!((y - 16.0 / 3.0).abs() < 2e-3, "y = {y}");
    assert!((z - 8.0 / 3.0).abs() < 2e-3, "z = {z}");

    assert_eq!(
        Some(&serde_json::Value::Bool(true)),
        sink.metadata().get("converged")
    );
    let iterations = sink.metadata()["iterations"].as_u64().unwrap();
    assert!(iterations <= 20, "took {iterations} iterations");
    let norm = sink.metadata()["residualNorm"].as_f64().unwrap();
    assert!(norm <= 1e-3, "final norm {norm}");
}

#[tokio::test]
async fn expanding_loop_exhausts_the_iteration_cap() {
    init_tracing();
    // y = 2z and z = 2y + 1 expand without bound from any seed.
    let forward = ExternalModel::from_fn("forward", ["z"], ["y"], |ns| {
        let z = ns.scalar("z")?;
        ns.set("y", 2.0 * z);
        Ok(())
    });
    let feedback = ExternalModel::from_fn("feedback", ["y"], ["z"], |ns| {
        let y = ns.scalar("y")?;
        ns.set("z", 2.0 * y + 1.0);
        Ok(())
    });
    let config = EnsembleConfig::from_json(
        r#"{
            "name": "loop",
            "subModel": [
                {"name": "forward", "inputNames": [], "targetEvaluation": "forwardData"},
                {"name": "feedback", "inputNames": [], "targetEvaluation": "feedbackData"}
            ]
        }"#,
    )
    .unwrap();
    let ensemble = EnsembleModel::new(
        config,
        [
            Arc::new(forward) as Arc<dyn Model>,
            Arc::new(feedback) as Arc<dyn Model>,
        ],
        vec![
            shared(PointSet::new("forwardData", ["z"], ["y"])),
            shared(PointSet::new("feedbackData", ["y"], ["z"])),
        ],
    )
    .unwrap();
    ensemble
        .initialize(&RunInfo::default(), &[], &InitContext::default())
        .await
        .unwrap();
    assert!(ensemble.execution_order().unwrap().cyclic);

    let handler: Arc<dyn JobHandler> = LocalJobHandler::new(2);
    let sample = SampleDescription {
        prefix: "1".to_owned(),
        sampler_tag: "MonteCarlo".to_owned(),
        ..SampleDescription::default()
    };
    let finished = run_sample(&ensemble, &handler, &sample).await;

    // The default policy keeps the last iterate and flags the metadata.
    let mut sink = PointSet::new("results", Vec::<String>::new(), ["y", "z"]);
    ensemble.collect_output(&finished, &mut sink).unwrap();
    assert!(sink.latest("y").is_some());
    assert!(sink.latest("z").is_some());
    assert_eq!(
        Some(&serde_json::Value::Bool(false)),
        sink.metadata().get("converged")
    );
    assert_eq!(
        Some(&serde_json::Value::from(30u32)),
        sink.metadata().get("iterations")
    );
    assert!(sink.metadata()["residualNorm"].as_f64().unwrap() > 1e-3);

    // A history sink receives the full iteration trace, not just the last
    // iterate.
    let mut history = ensemble_rs::data::HistorySet::new("history", Vec::<String>::new(), ["y", "z"]);
    ensemble.collect_output(&finished, &mut history).unwrap();
    assert_eq!(30, history.0.output_column("y").unwrap().len());
}

#[tokio::test]
async fn non_convergence_can_be_made_fatal() {
    let forward = ExternalModel::from_fn("forward", ["x", "z"], ["y"], |ns| {
        let z = ns.scalar("z")?;
        ns.set("y", 3.0 * z);
        Ok(())
    });
    let feedback = ExternalModel::from_fn("feedback", ["y"], ["z"], |ns| {
        let y = ns.scalar("y")?;
        ns.set("z", 3.0 * y + 1.0);
        Ok(())
    });
    let config = loop_config(
        r#", "settings": {"maxIterations": 5, "tolerance": 1e-6, "fatalOnNonConvergence": true}"#,
    );
    let ensemble = initialized_loop(config, forward, feedback, &["x"]).await;

    let handler: Arc<dyn JobHandler> = LocalJobHandler::new(2);
    let sample = SampleDescription {
        prefix: "9".to_owned(),
        sampler_tag: "MonteCarlo".to_owned(),
        sampled_vars: BTreeMap::from([("x".to_owned(), Value::Scalar(1.0))]),
        sampled_vars_pb: BTreeMap::from([("x".to_owned(), 1.0)]),
        extra: BTreeMap::new(),
    };
    let finished = run_sample(&ensemble, &handler, &sample).await;
    match &finished.result {
        Err(ensemble_rs::EnsembleError::PicardNonConvergence {
            prefix, iterations, ..
        }) => {
            assert_eq!("9", prefix);
            assert_eq!(5, *iterations);
        }
        other => panic!("expected non-convergence failure, got {other:?}"),
    }
}
