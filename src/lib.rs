//! Staged document tailoring: gap analysis, candidate interrogation,
//! differentiation, tailoring, ATS optimization, a truth audit with bounded
//! self-correction, and an executive summary, with two human review gates.
//!
//! [`engine::WorkflowEngine`] is the entry point. It drives [`pipeline::Job`]
//! records held in a [`store::JobStore`] and reports progress through
//! [`events::ProgressPublisher`].

pub mod anthropic;
pub mod audit;
pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hitl;
pub mod invoker;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod ui;
