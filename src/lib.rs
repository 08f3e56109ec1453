pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod postprocess;
pub mod report;
pub mod retry;
pub mod summarize;
pub mod supervisor;
pub mod util;
pub mod worker;
