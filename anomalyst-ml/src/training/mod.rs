//! Trainer orchestration: callbacks, metrics, normalization, checkpoints and export.

pub mod callbacks;
pub mod checkpoint;
pub mod export;
pub mod metrics;
pub mod normalization;
pub mod outputs;
pub mod state;
pub mod trainer;
pub mod visualizer;

pub use callbacks::{
    CallbackAction, EarlyStopping, Timer, TilerConfiguration, TrainingCallback,
    instantiate_callbacks, merge_callback_specs,
};
pub use checkpoint::{CheckpointMeta, LoadModelCallback, ModelCheckpoint, save_checkpoint};
pub use export::{ExportCallback, ExportFormat, ExportMetadata};
pub use metrics::{
    EXACT_SCORE_LIMIT, HISTOGRAM_BINS, MetricCollection, MetricKind, ScoreHistogram,
    adaptive_threshold, auroc, f1_score,
};
pub use normalization::{CdfNormalizationCallback, MinMaxNormalizationCallback};
pub use outputs::{PredictionRecord, StepOutputs};
pub use state::{CdfStats, MinMaxStats, Stage, Thresholds, TrainerState};
pub use trainer::Trainer;
pub use visualizer::VisualizerCallback;
