//! Offering memorandum harvesting with an LLM-driven browser agent.
//!
//! A target URL is scouted in a throwaway browser context, a strategy is
//! picked from the scouted document count, and the [`driver::AgentDriver`]
//! steps a planner against a fresh context until the
//! [`detector::CompletionDetector`] reports that the expected artifacts have
//! landed in the [`sink::DownloadSink`].

pub mod brain;
pub mod capability;
pub mod capture;
pub mod cli;
pub mod config;
pub mod detector;
pub mod dom;
pub mod driver;
pub mod error;
pub mod face;
pub mod hands;
pub mod history;
pub mod orchestrator;
pub mod report;
pub mod scout;
pub mod sink;
pub mod store;
pub mod strategy;
pub mod types;
pub mod usage;
