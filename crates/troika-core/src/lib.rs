//! # troika-core
//!
//! Foundation types for the Troika agent-orchestration core.
//!
//! This crate provides the shared vocabulary that all other Troika crates
//! depend on:
//!
//! - **Ids**: [`ids`] — short-hex id constructors for turns, flows, streams,
//!   inbox items, and knowledge items
//! - **Messages**: [`messages::ChatMessage`] and [`messages::ToolCall`] in
//!   chat-completion wire shape
//! - **Turn ledger model**: [`turn::Turn`] with nested LLM and tool
//!   interaction records forming the causal DAG
//! - **Inbox model**: [`inbox::InboxItem`] typed events with consumption
//!   policies and priorities
//! - **Team state**: [`team::TeamState`] — the shared, serializable ledger
//!   (work modules, turns, dispatch history)
//! - **Tool contract**: [`tools::ToolSpec`] and the [`tools::ToolResponse`]
//!   envelope every tool returns
//! - **Events**: [`events::RunEvent`] emitted to downstream consumers
//! - **Expressions**: [`expr`] — the small condition language evaluated over
//!   [`paths::ContextPaths`] lookups (no dynamic eval)
//! - **Retry**: [`retry::RetryConfig`] and backoff calculation
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other troika crates.

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod expr;
pub mod ids;
pub mod inbox;
pub mod messages;
pub mod paths;
pub mod retry;
pub mod team;
pub mod tools;
pub mod turn;
