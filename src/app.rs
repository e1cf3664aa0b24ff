//! Application wiring: configuration in, one blocking engine run out.

use crate::checkpoint::{
    CheckpointPolicy, ErrorDumper, JsonStateSink, PeriodicCheckpointer, StateSink,
};
use crate::config::{Args, RunConfig};
use crate::engine::{Engine, IterationSnapshot};
use crate::io::setup_output;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use std::fs;
use std::path::Path;
use tracing::info;

pub struct NlcgApplication {
    args: Args,
    config: RunConfig,
}

impl NlcgApplication {
    pub fn from_cli() -> Result<Self> {
        let args = Args::parse();
        let config = load_config(&args)?;
        Ok(Self { args, config })
    }

    pub fn run(self) -> Result<()> {
        setup_output(self.args.output.as_ref());
        info!(
            "Launching NLCG run: input={}, backend config={}",
            self.args.input, self.args.sirius_config
        );

        let policy = CheckpointPolicy {
            interval: self.config.cg.callback_interval(),
            dump_on_error: self.args.dump_on_error,
        };
        info!(
            "Checkpoint every {} iterations, dump on error: {}",
            policy.interval, policy.dump_on_error
        );

        // Checkpoints land next to the run, as the engine's own outputs do.
        let sink = JsonStateSink::new(".");
        self.dispatch(policy, sink)
    }

    #[cfg(feature = "sirius")]
    fn dispatch(self, policy: CheckpointPolicy, sink: JsonStateSink) -> Result<()> {
        let mut engine = crate::engine::SiriusEngine::new();
        launch(
            &mut engine,
            &self.config,
            Path::new(&self.args.sirius_config),
            policy,
            sink,
        )
    }

    #[cfg(not(feature = "sirius"))]
    fn dispatch(self, _policy: CheckpointPolicy, _sink: JsonStateSink) -> Result<()> {
        color_eyre::eyre::bail!(
            "this build carries no engine backend; rebuild with `--features sirius`"
        )
    }
}

/// Load the YAML configuration and replace the `CG` section with its
/// validated, defaulted form. Any failure here is fatal and happens
/// before an engine is ever constructed.
pub fn load_config(args: &Args) -> Result<RunConfig> {
    let content = fs::read_to_string(&args.input)
        .wrap_err_with(|| format!("Unable to read configuration file: {}", args.input))?;

    let config = serde_yml::from_str::<RunConfig>(&content)
        .wrap_err("Failed to parse configuration file")?
        .validated()
        .wrap_err("CG section failed validation")?;

    Ok(config)
}

/// Hand the validated configuration and both callback hooks to the engine
/// and block until it returns or fails.
pub fn launch<E, S>(
    engine: &mut E,
    config: &RunConfig,
    backend_config: &Path,
    policy: CheckpointPolicy,
    sink: S,
) -> Result<()>
where
    E: Engine,
    S: StateSink + Clone + Send + 'static,
{
    let mut checkpointer = PeriodicCheckpointer::new(&policy, sink.clone());
    let mut dumper = ErrorDumper::new(&policy, sink);

    engine.run(
        config,
        backend_config,
        Box::new(move |snapshot: &IterationSnapshot<'_>| checkpointer.on_iteration(snapshot)),
        Box::new(move |snapshot: &IterationSnapshot<'_>| dumper.on_error(snapshot)),
    )?;

    info!("Engine run finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args_for(input: &str) -> Args {
        Args {
            sirius_config: "sirius.json".to_string(),
            input: input.to_string(),
            dump_on_error: false,
            output: None,
        }
    }

    #[test]
    fn load_config_applies_defaults_to_cg_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CG:\n  callback_interval: 10").unwrap();
        let config = load_config(&args_for(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.cg.callback_interval(), 10);
        assert_eq!(config.cg.maxiter(), 300);
    }

    #[test]
    fn load_config_fails_on_missing_file() {
        let result = load_config(&args_for("does-not-exist.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_config_fails_on_invalid_cg_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "CG:\n  callback_interval: 0").unwrap();
        assert!(load_config(&args_for(file.path().to_str().unwrap())).is_err());
    }
}
