pub mod embedder;
pub mod factory;
pub mod llm;
