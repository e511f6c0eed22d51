//! Ensemble model execution runtime.
//!
//! Wraps heterogeneous compute elements (surrogates, external executables,
//! user code blocks, post-processing actions) behind one polymorphic
//! [`Model`] lifecycle, and couples them into possibly cyclic dataflow
//! ensembles executed per-sample through an asynchronous job handler. Cyclic
//! couplings are solved by Picard fixed-point iteration with residual-norm
//! convergence testing.
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use ensemble_rs::data::{shared, PointSet};
//! use ensemble_rs::model::external::ExternalModel;
//! use ensemble_rs::{
//!     EnsembleConfig, EnsembleModel, InitContext, JobHandler, LocalJobHandler, Model, RunInfo,
//!     SampleDescription, Value,
//! };
//!
//! # async fn demo() -> ensemble_rs::Result<()> {
//! let double = ExternalModel::from_fn("double", ["x"], ["y"], |ns| {
//!     let x = ns.scalar("x")?;
//!     ns.set("y", 2.0 * x);
//!     Ok(())
//! });
//! let offset = ExternalModel::from_fn("offset", ["y"], ["z"], |ns| {
//!     let y = ns.scalar("y")?;
//!     ns.set("z", y + 3.0);
//!     Ok(())
//! });
//! let config = EnsembleConfig::from_json(
//!     r#"{"name": "chain", "subModel": [
//!         {"name": "double", "inputNames": [], "targetEvaluation": "doubleData"},
//!         {"name": "offset", "inputNames": [], "targetEvaluation": "offsetData"}
//!     ]}"#,
//! )?;
//! let ensemble = EnsembleModel::new(
//!     config,
//!     [Arc::new(double) as Arc<dyn Model>, Arc::new(offset)],
//!     [
//!         shared(PointSet::new("doubleData", ["x"], ["y"])),
//!         shared(PointSet::new("offsetData", ["y"], ["z"])),
//!     ],
//! )?;
//! ensemble
//!     .initialize(
//!         &RunInfo::default(),
//!         &[],
//!         &InitContext { sampled_variables: ["x".to_owned()].into() },
//!     )
//!     .await?;
//!
//! let handler: Arc<dyn JobHandler> = LocalJobHandler::new(4);
//! let sample = SampleDescription {
//!     prefix: "1".to_owned(),
//!     sampled_vars: BTreeMap::from([("x".to_owned(), Value::Scalar(5.0))]),
//!     ..SampleDescription::default()
//! };
//! let packet = ensemble.create_new_input(&[], "MonteCarlo", &sample)?;
//! ensemble.run(packet, &handler).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod ensemble;
pub mod error;
pub mod jobs;
pub mod model;
pub mod value;

pub use config::{EnsembleConfig, EnsembleSettings, SubModelConfig};
pub use ensemble::{
    DependencyGraph, EnsembleModel, ExecutionOrder, ResultBundle, SampleOutcome, SamplePhase,
};
pub use error::{EnsembleError, Result};
pub use jobs::coordinator::JobCoordinator;
pub use jobs::{Evaluation, FinishedJob, JobHandler, JobMetadata, JobPayload, LocalJobHandler};
pub use model::{
    InitContext, InputPacket, Model, ModelVariant, RunInfo, SampleDescription, StepInput,
};
pub use value::{Value, ValueKind};
