//! 研究阶段：监督者调度研究员任务，研究结果经压缩器进入语料

pub mod compressor;
pub mod researcher;
pub mod supervisor;

pub use compressor::Compressor;
pub use researcher::{Investigator, ResearchOutcome, ResearchStep, Researcher, StopReason};
pub use supervisor::{
    CoverageDecision, CoveragePolicy, ModelCoveragePolicy, ResearchReport, RunRequest, Supervisor,
};
