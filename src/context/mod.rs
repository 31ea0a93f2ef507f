pub mod predictor;
pub mod tasks;

pub use predictor::{CancelVerdict, ContextPredictor, TimingPrediction};
pub use tasks::ContextTaskStore;
