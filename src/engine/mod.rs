pub mod config;
pub mod correction;
pub mod embedding;
pub mod features;
pub mod likelihood;
pub mod optimizer;
pub mod orchestrator;
pub mod parameters;
pub mod predictor;
pub mod trainer;
pub mod types;

pub use config::EngineConfig;
pub use orchestrator::{EngineError, PredictionDetail, PredictionEngine, TaskCompletion};
pub use types::*;
