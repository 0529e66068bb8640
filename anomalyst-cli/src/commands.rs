//! Subcommand handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anomalyst_core::persistence::{atomic_write_json, atomic_write_yaml};
use anomalyst_core::{CallbackSpec, RunConfig, RunLayout, apply_layout, build_callbacks, load_config};
use anomalyst_ml::{
    AnomalyModule, FolderDataModule, ReverseDistillation, Trainer, TrainingBackend,
    instantiate_callbacks, merge_callback_specs,
};
use anyhow::Context;
use burn::tensor::backend::Backend;
use tracing::{info, warn};

use crate::{Commands, ConfigAction};

type Model = ReverseDistillation<TrainingBackend>;

pub const METRICS_FILE: &str = "metrics.json";
pub const PREDICTIONS_FILE: &str = "predictions.json";
pub const RESOLVED_CONFIG_FILE: &str = "config.yaml";

/// Global flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub overrides: Vec<String>,
    pub openvino: bool,
    pub nncf: Option<PathBuf>,
}

/// A stage to run against the model.
#[derive(Debug, Clone)]
enum Job {
    Fit,
    Validate,
    Test,
    Predict { input: PathBuf, output: Option<PathBuf> },
}

pub async fn handle_command(command: Commands, options: RunOptions) -> anyhow::Result<()> {
    let job = match command {
        Commands::Config {
            action: ConfigAction::Show { format },
        } => {
            let config = load_run_config(&options)?;
            println!("{}", render_config(&config, &format)?);
            return Ok(());
        }
        Commands::Fit => Job::Fit,
        Commands::Validate => Job::Validate,
        Commands::Test => Job::Test,
        Commands::Predict { input, output } => Job::Predict { input, output },
    };
    run(job, options).await
}

/// Merge config file, environment, overrides and export flags, then validate.
fn load_run_config(options: &RunOptions) -> anyhow::Result<RunConfig> {
    let mut config = load_config(options.config.as_deref(), &options.overrides)
        .context("Failed to load configuration")?;
    if options.openvino {
        config.openvino = true;
    }
    if let Some(nncf) = options.nncf.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        config.nncf = Some(nncf.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn render_config(config: &RunConfig, format: &str) -> anyhow::Result<String> {
    match format {
        "yaml" | "yml" => Ok(serde_yaml::to_string(config)?),
        "toml" => Ok(toml::to_string_pretty(config)?),
        other => anyhow::bail!("Unknown config format '{other}' (expected yaml or toml)"),
    }
}

async fn run(job: Job, options: RunOptions) -> anyhow::Result<()> {
    let mut config = load_run_config(&options)?;
    let layout = apply_layout(&mut config, chrono::Local::now());
    let specs = build_callbacks(&config).context("Failed to plan callbacks")?;
    info!(root = %layout.root().display(), job = ?job, "Starting run");

    let cancel = Arc::new(AtomicBool::new(false));
    let worker_cancel = Arc::clone(&cancel);
    let mut worker = tokio::task::spawn_blocking(move || {
        run_blocking(job, &config, &layout, specs, worker_cancel)
    });

    tokio::select! {
        result = &mut worker => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping after the current batch");
            cancel.store(true, Ordering::Relaxed);
            worker.await?
        }
    }
}

fn run_blocking(
    job: Job,
    config: &RunConfig,
    layout: &RunLayout,
    specs: Vec<CallbackSpec>,
    cancel: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    if let Some(seed) = config.seed {
        TrainingBackend::seed(seed);
    }
    let device = Default::default();
    let mut model = Model::new(&config.model, &device).context("Failed to build model")?;
    if !matches!(job, Job::Fit) && config.trainer.resume_from_checkpoint.is_none() {
        warn!("No checkpoint configured; running with untrained weights");
    }

    let specs = merge_callback_specs(specs, model.configure_callbacks());
    let callbacks = instantiate_callbacks::<TrainingBackend, Model>(specs)?;
    let datamodule = FolderDataModule::new(&config.data, config.seed);
    let mut trainer = Trainer::new(config, datamodule, callbacks, device)?.with_cancel_flag(cancel);

    atomic_write_yaml(&layout.root().join(RESOLVED_CONFIG_FILE), config)?;

    match job {
        Job::Fit => {
            trainer.fit(model)?;
            print_metrics(&trainer.state().metrics);
        }
        Job::Validate => print_metrics(&trainer.validate(&mut model)?),
        Job::Test => print_metrics(&trainer.test(&mut model)?),
        Job::Predict { input, output } => {
            let records = trainer.predict(&mut model, &input)?;
            let output = output.unwrap_or_else(|| layout.root().join(PREDICTIONS_FILE));
            atomic_write_json(&output, &records)?;
            let anomalous = records.iter().filter(|r| r.pred_label).count();
            println!(
                "{} images scored, {anomalous} anomalous; predictions written to {}",
                records.len(),
                output.display()
            );
        }
    }

    write_state(layout.root(), &trainer)?;
    Ok(())
}

fn write_state(root: &Path, trainer: &Trainer<TrainingBackend, Model>) -> anyhow::Result<()> {
    let path = root.join(METRICS_FILE);
    atomic_write_json(&path, trainer.state())
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn print_metrics(metrics: &std::collections::BTreeMap<String, f64>) {
    if metrics.is_empty() {
        println!("No metrics computed.");
        return;
    }
    let width = metrics.keys().map(String::len).max().unwrap_or(0);
    for (name, value) in metrics {
        println!("  {name:<width$}  {value:.4}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_flags_override_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "seed: 7\ntrainer:\n  max_epochs: 3\n").unwrap();
        let options = RunOptions {
            config: Some(path),
            overrides: vec!["trainer.max_epochs=9".into()],
            openvino: true,
            nncf: None,
        };
        let config = load_run_config(&options).unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.trainer.max_epochs, 9);
        assert!(config.openvino);
    }

    #[test]
    fn test_conflicting_export_flags_rejected() {
        let dir = TempDir::new().unwrap();
        let nncf = dir.path().join("nncf.yaml");
        std::fs::write(&nncf, "compression: {}\n").unwrap();
        let options = RunOptions {
            openvino: true,
            nncf: Some(nncf),
            ..Default::default()
        };
        assert!(load_run_config(&options).is_err());
    }

    #[test]
    fn test_empty_nncf_flag_is_ignored() {
        let options = RunOptions {
            openvino: true,
            nncf: Some(PathBuf::new()),
            ..Default::default()
        };
        let config = load_run_config(&options).unwrap();
        assert!(config.openvino);
        assert_eq!(config.nncf, None);
    }

    #[test]
    fn test_render_config_formats() {
        let config = RunConfig::default();
        let yaml = render_config(&config, "yaml").unwrap();
        assert!(yaml.contains("reverse_distillation"));
        assert!(render_config(&config, "toml").is_ok());
        assert!(render_config(&config, "xml").is_err());
    }

    #[tokio::test]
    async fn test_config_show() {
        let command = Commands::Config {
            action: ConfigAction::Show {
                format: "yaml".into(),
            },
        };
        assert!(handle_command(command, RunOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_dataset_fails_before_training() {
        let dir = TempDir::new().unwrap();
        let options = RunOptions {
            overrides: vec![
                format!("data.root={}", dir.path().join("missing").display()),
                format!("trainer.default_root_dir={}", dir.path().join("results").display()),
            ],
            ..Default::default()
        };
        let result = handle_command(Commands::Fit, options).await;
        assert!(result.is_err());
    }
}
