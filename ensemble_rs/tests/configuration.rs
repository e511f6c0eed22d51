//! Configuration-time validation and sink-overlap enforcement.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ensemble_rs::data::{shared, PointSet};
use ensemble_rs::model::external::ExternalModel;
use ensemble_rs::{
    EnsembleConfig, EnsembleError, EnsembleModel, InitContext, JobHandler, LocalJobHandler, Model,
    RunInfo, SampleDescription, Value,
};

fn two_model_config() -> EnsembleConfig {
    EnsembleConfig::from_json(
        r#"{
            "name": "pair",
            "subModel": [
                {"name": "a", "inputNames": [], "targetEvaluation": "aData"},
                {"name": "b", "inputNames": [], "targetEvaluation": "bData"}
            ]
        }"#,
    )
    .unwrap()
}

fn doubling_model(name: &str, input: &str, output: &str) -> Arc<dyn Model> {
    let input_name = input.to_owned();
    let output_name = output.to_owned();
    Arc::new(ExternalModel::from_fn(
        name,
        [input],
        [output],
        move |ns| {
            let v = ns.scalar(&input_name)?;
            ns.set(output_name.clone(), 2.0 * v);
            Ok(())
        },
    ))
}

#[tokio::test]
async fn unresolvable_input_is_fatal_at_initialize() {
    // `b` declares input `w`: never sampled, not produced by `a`.
    let ensemble = EnsembleModel::new(
        two_model_config(),
        [doubling_model("a", "x", "y"), doubling_model("b", "w", "z")],
        [
            shared(PointSet::new("aData", ["x"], ["y"])),
            shared(PointSet::new("bData", ["w"], ["z"])),
        ],
    )
    .unwrap();
    let err = ensemble
        .initialize(
            &RunInfo::default(),
            &[],
            &InitContext {
                sampled_variables: ["x".to_owned()].into(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        EnsembleError::UnresolvableInput {
            model: "b".to_owned(),
            variable: "w".to_owned(),
        },
        err
    );
    // An uninitialized ensemble refuses to build sample inputs.
    assert!(ensemble
        .create_new_input(&[], "Grid", &SampleDescription::default())
        .is_err());
}

#[tokio::test]
async fn sampled_name_colliding_with_an_output_fails_the_sample() {
    let ensemble = EnsembleModel::new(
        two_model_config(),
        [doubling_model("a", "x", "y"), doubling_model("b", "y", "z")],
        [
            shared(PointSet::new("aData", ["x"], ["y"])),
            shared(PointSet::new("bData", ["y"], ["z"])),
        ],
    )
    .unwrap();
    ensemble
        .initialize(
            &RunInfo::default(),
            &[],
            &InitContext {
                sampled_variables: ["x".to_owned()].into(),
            },
        )
        .await
        .unwrap();

    let sample = SampleDescription {
        prefix: "1".to_owned(),
        sampler_tag: "Grid".to_owned(),
        sampled_vars: BTreeMap::from([
            ("x".to_owned(), Value::Scalar(1.0)),
            ("y".to_owned(), Value::Scalar(2.0)),
        ]),
        sampled_vars_pb: BTreeMap::new(),
        extra: BTreeMap::new(),
    };
    let err = ensemble.create_new_input(&[], "Grid", &sample).unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::SampledOutputCollision { ref variable, .. } if variable == "y"
    ));
}

#[tokio::test]
async fn sink_overlapping_a_target_evaluation_is_rejected() {
    let ensemble = EnsembleModel::new(
        two_model_config(),
        [doubling_model("a", "x", "y"), doubling_model("b", "y", "z")],
        [
            shared(PointSet::new("aData", ["x"], ["y"])),
            shared(PointSet::new("bData", ["y"], ["z"])),
        ],
    )
    .unwrap();
    ensemble
        .initialize(
            &RunInfo::default(),
            &[],
            &InitContext {
                sampled_variables: ["x".to_owned()].into(),
            },
        )
        .await
        .unwrap();

    let handler: Arc<dyn JobHandler> = LocalJobHandler::new(2);
    let sample = SampleDescription {
        prefix: "1".to_owned(),
        sampler_tag: "Grid".to_owned(),
        sampled_vars: BTreeMap::from([("x".to_owned(), Value::Scalar(1.0))]),
        sampled_vars_pb: BTreeMap::from([("x".to_owned(), 1.0)]),
        extra: BTreeMap::new(),
    };
    let packet = ensemble.create_new_input(&[], "Grid", &sample).unwrap();
    ensemble.run(packet, &handler).await.unwrap();
    while !handler.is_finished("1") {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let finished = handler.take_finished("1", "any").unwrap();

    // Writing into a store that *is* a sub-model's target evaluation must be
    // refused at the first collect.
    let mut overlapping = PointSet::new("bData", ["y"], ["z"]);
    let err = ensemble
        .collect_output(&finished, &mut overlapping)
        .unwrap_err();
    assert_eq!(
        EnsembleError::SinkOverlap {
            sink: "bData".to_owned(),
            model: "b".to_owned(),
        },
        err
    );
    assert!(overlapping.is_empty());
}

#[tokio::test]
async fn grouped_sinks_get_one_group_per_sample() {
    let ensemble = EnsembleModel::new(
        two_model_config(),
        [doubling_model("a", "x", "y"), doubling_model("b", "y", "z")],
        [
            shared(PointSet::new("aData", ["x"], ["y"])),
            shared(PointSet::new("bData", ["y"], ["z"])),
        ],
    )
    .unwrap();
    ensemble
        .initialize(
            &RunInfo::default(),
            &[],
            &InitContext {
                sampled_variables: ["x".to_owned()].into(),
            },
        )
        .await
        .unwrap();

    let handler: Arc<dyn JobHandler> = LocalJobHandler::new(4);
    let mut grouped = ensemble_rs::data::GroupedStore::hierarchical("archive");
    for (prefix, x) in [("1", 1.0), ("2", 2.0)] {
        let sample = SampleDescription {
            prefix: prefix.to_owned(),
            sampler_tag: "Grid".to_owned(),
            sampled_vars: BTreeMap::from([("x".to_owned(), Value::Scalar(x))]),
            sampled_vars_pb: BTreeMap::from([("x".to_owned(), 1.0)]),
            extra: BTreeMap::new(),
        };
        let packet = ensemble.create_new_input(&[], "Grid", &sample).unwrap();
        ensemble.run(packet, &handler).await.unwrap();
        while !handler.is_finished(prefix) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let finished = handler.take_finished(prefix, "any").unwrap();
        ensemble.collect_output(&finished, &mut grouped).unwrap();
    }

    let first = grouped.group("pair1").expect("group for sample 1");
    assert_eq!(Some(&Value::Scalar(4.0)), first.latest("z"));
    let second = grouped.group("pair2").expect("group for sample 2");
    assert_eq!(Some(&Value::Scalar(8.0)), second.latest("z"));
}
