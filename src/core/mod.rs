pub mod agents;
pub mod artifacts;
pub mod broker;
pub mod diagram;
pub mod error;
pub mod llm;
pub mod markdown;
pub mod memory;
pub mod message;
pub mod pipeline;
pub mod plan;
pub mod recorder;
pub mod stages;
pub mod status;
pub mod storage;
pub mod telemetry;
pub mod worker;
