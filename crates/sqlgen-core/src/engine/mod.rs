pub mod checkpoint;
pub mod generator;
pub mod orchestrator;
pub mod refiner;
pub mod selector;
