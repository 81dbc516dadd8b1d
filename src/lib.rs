pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod generator;
pub mod llm;
pub mod memory;
pub mod search;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::ResearchError;
pub use generator::context::ResearchContext;
pub use generator::research::{ResearchReport, RunRequest, Supervisor};
pub use generator::workflow::{launch, launch_with_context};
