//! External executable model.
//!
//! Each run materializes the resolved input variables into a JSON file under
//! a per-job working directory, spawns the executable with the input and
//! output paths appended to its argument list, and parses the JSON output
//! file once the process exits cleanly. A nonzero exit is a failure
//! evaluation for the owning sample, never a crash of the runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::FutureExt;

use crate::data::DataSink;
use crate::error::{EnsembleError, Result};
use crate::jobs::{Evaluation, FinishedJob, JobHandler, JobMetadata, JobPayload};
use crate::model::{
    collect_evaluation, Backend, InitContext, InputPacket, Model, ModelBlueprint, ModelVariant,
    RunInfo, SampleDescription, StepInput, IDENTIFIER_SEPARATOR,
};
use crate::value::Value;

/// How to invoke the external executable.
#[derive(Clone, Debug)]
pub struct ExecutableSpec {
    pub command: PathBuf,
    /// Arguments placed before the generated input/output paths.
    pub args: Vec<String>,
}

pub struct CodeModel {
    name: String,
    inputs: BTreeSet<String>,
    outputs: BTreeSet<String>,
    spec: ExecutableSpec,
    working_dir: OnceLock<PathBuf>,
}

impl CodeModel {
    pub fn new(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
        spec: ExecutableSpec,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            spec,
            working_dir: OnceLock::new(),
        }
    }
}

pub(crate) fn construct(blueprint: ModelBlueprint) -> Result<Arc<dyn Model>> {
    let ModelBlueprint {
        name,
        inputs,
        outputs,
        backend,
        ..
    } = blueprint;
    let Backend::Executable(spec) = backend else {
        return Err(EnsembleError::Configuration(format!(
            "code model `{name}` needs an executable backend"
        )));
    };
    Ok(Arc::new(CodeModel::new(name, inputs, outputs, spec)))
}

/// Prefixes contain the identifier separator; directories must not.
fn directory_tag(prefix: &str) -> String {
    prefix.replace(IDENTIFIER_SEPARATOR, "_")
}

#[async_trait]
impl Model for CodeModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> ModelVariant {
        ModelVariant::Code
    }

    fn declared_inputs(&self) -> BTreeSet<String> {
        self.inputs.clone()
    }

    fn declared_outputs(&self) -> BTreeSet<String> {
        self.outputs.clone()
    }

    fn dependent_modules(&self) -> Vec<String> {
        vec![self.spec.command.display().to_string()]
    }

    async fn initialize(
        &self,
        run_info: &RunInfo,
        _inputs: &[StepInput],
        _init: &InitContext,
    ) -> Result<()> {
        let on_disk = self.spec.command.is_absolute() && std::fs::metadata(&self.spec.command).is_ok();
        if !on_disk && which_on_path(&self.spec.command).is_none() {
            return Err(EnsembleError::Lifecycle {
                model: self.name.clone(),
                message: format!("executable `{}` not found", self.spec.command.display()),
            });
        }
        let dir = run_info.working_dir.join(&self.name);
        std::fs::create_dir_all(&dir).map_err(|err| EnsembleError::Lifecycle {
            model: self.name.clone(),
            message: format!("cannot create working directory `{}`: {err}", dir.display()),
        })?;
        let _ = self.working_dir.set(dir);
        Ok(())
    }

    fn create_new_input(
        &self,
        _my_input: &[StepInput],
        sampler_tag: &str,
        sample: &SampleDescription,
    ) -> Result<InputPacket> {
        let mut packet = InputPacket::new(&self.name, sample);
        packet.sampler_tag = sampler_tag.to_owned();
        Ok(packet)
    }

    async fn run(&self, packet: InputPacket, handler: &Arc<dyn JobHandler>) -> Result<()> {
        let identifier = packet.prefix.clone();
        let unique_handler = packet.unique_handler.clone();
        let metadata = JobMetadata {
            model: self.name.clone(),
            prefix: packet.prefix.clone(),
            sampler_tag: packet.sampler_tag.clone(),
        };
        let name = self.name.clone();
        let outputs = self.outputs.clone();
        let spec = self.spec.clone();
        let base_dir = self
            .working_dir
            .get()
            .cloned()
            .ok_or_else(|| EnsembleError::Lifecycle {
                model: name.clone(),
                message: "run before initialize".to_owned(),
            })?;
        let work = async move {
            let job_dir = base_dir.join(directory_tag(&packet.prefix));
            std::fs::create_dir_all(&job_dir)?;
            let input_path = job_dir.join("input.json");
            let output_path = job_dir.join("output.json");
            std::fs::write(&input_path, serde_json::to_vec_pretty(&packet.variables)?)?;

            let status = async_process::Command::new(&spec.command)
                .args(&spec.args)
                .arg(&input_path)
                .arg(&output_path)
                .current_dir(&job_dir)
                .status()
                .await?;
            if !status.success() {
                anyhow::bail!(
                    "`{}` exited with {} for job `{}`",
                    spec.command.display(),
                    status,
                    packet.prefix
                );
            }

            let raw = std::fs::read_to_string(&output_path)?;
            let parsed: BTreeMap<String, Value> = serde_json::from_str(&raw)?;
            let mut evaluation = Evaluation {
                inputs: packet.variables.clone(),
                ..Evaluation::default()
            };
            for key in &outputs {
                let value = parsed.get(key).ok_or_else(|| {
                    anyhow::anyhow!("output file is missing declared output `{key}`")
                })?;
                evaluation.outputs.insert(key.clone(), value.clone());
            }
            Ok(JobPayload::Evaluation(evaluation))
        }
        .boxed();
        handler.submit(work, &identifier, &unique_handler, metadata)
    }

    fn collect_output(&self, finished: &FinishedJob, sink: &mut dyn DataSink) -> Result<()> {
        collect_evaluation(&self.name, finished, sink)
    }
}

fn which_on_path(command: &std::path::Path) -> Option<PathBuf> {
    let name = command.to_str()?;
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| std::fs::metadata(candidate).is_ok())
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn shell_model(script: &str, outputs: &[&str]) -> CodeModel {
        CodeModel::new(
            "shell",
            ["x"],
            outputs.iter().copied(),
            ExecutableSpec {
                command: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_owned(), script.to_owned()],
            },
        )
    }

    async fn run_to_completion(model: &CodeModel, prefix: &str) -> FinishedJob {
        let tmp = tempfile::tempdir().unwrap();
        let run_info = RunInfo {
            working_dir: tmp.path().to_path_buf(),
        };
        model
            .initialize(&run_info, &[], &InitContext::default())
            .await
            .unwrap();
        let sample = SampleDescription {
            prefix: prefix.to_owned(),
            sampler_tag: "Grid".to_owned(),
            sampled_vars: BTreeMap::from([("x".to_owned(), Value::Scalar(3.0))]),
            sampled_vars_pb: BTreeMap::from([("x".to_owned(), 1.0)]),
            extra: BTreeMap::new(),
        };
        let packet = model.create_new_input(&[], "Grid", &sample).unwrap();
        let handler = crate::jobs::LocalJobHandler::new(1);
        let dyn_handler: Arc<dyn JobHandler> = handler.clone();
        model.run(packet, &dyn_handler).await.unwrap();
        while !handler.is_finished(prefix) {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        handler.take_finished(prefix, "any").unwrap()
    }

    #[tokio::test]
    async fn parses_the_output_file() {
        // $0 is the input path, $1 the output path.
        let model = shell_model(r#"echo '{"z": 7.5}' > "$1""#, &["z"]);
        let finished = run_to_completion(&model, "9").await;
        let payload = finished.evaluation().unwrap().as_evaluation().unwrap().clone();
        assert_eq!(Some(&Value::Scalar(7.5)), payload.outputs.get("z"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_evaluation() {
        let model = shell_model("exit 3", &["z"]);
        let finished = run_to_completion(&model, "10").await;
        assert!(matches!(
            finished.result,
            Err(EnsembleError::WorkUnitFailed { .. })
        ));
    }
}
