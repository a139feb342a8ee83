pub mod config;
pub mod engine;
pub mod errors;
pub mod eval;
pub mod fingerprint;
pub mod linking;
pub mod model;
pub mod prompts;
pub mod providers;
pub mod retrieval;
pub mod schema;
pub mod sql;
pub mod storage;

pub use config::RunConfig;
pub use engine::orchestrator::Orchestrator;
pub use model::{Candidate, PredictionRecord, Question, Selection};
