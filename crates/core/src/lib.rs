//! # ThinkTank Core
//!
//! Stage pipeline orchestrator for the ThinkTank planning assistant: takes a
//! project goal and produces requirements, a task plan, market research, a
//! product requirements document, tool recommendations and an evaluation.
//!
//! ## Architecture
//!
//! - `capabilities/` - Role-addressed text generation (provider trait, OpenAI-compatible adapter, prompt templates, intake)
//! - `models` - Provider and model configuration
//! - `pipeline/` - Intent gate, output parser, stage plan and orchestrator
//! - `state/` - SQLite database, append-only run store and recorder
//! - `error` - Pipeline error taxonomy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use thinktank_core::capabilities::{OpenAiProvider, PromptLibrary};
//! use thinktank_core::models::ModelConfig;
//! use thinktank_core::pipeline::{Orchestrator, PipelineConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let provider = Arc::new(OpenAiProvider::new(ModelConfig::new("gpt-4o-mini"))?);
//! let orchestrator = Orchestrator::new(PipelineConfig::default(), provider, PromptLibrary::defaults());
//! let bundle = orchestrator
//!     .handle_message("开发一个在线教育平台", &CancellationToken::new())
//!     .await;
//! ```

pub mod capabilities;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod state;

pub use error::PipelineError;
pub use pipeline::{Orchestrator, PipelineConfig, ResultBundle};
