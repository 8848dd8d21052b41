//! Core traits and types for the agent relay.
//!
//! This crate defines the abstractions shared between the relay server and its backends:
//! - `MetadataClient`: Agent and project metadata lookups by agent token
//! - `TreeFetcher`: Ref polling and repository tree walks at a revision
//! - `FetchVisitor`: Per-entry and per-chunk decisions during a tree walk

mod api;
mod fetch;
mod metadata;

pub use api::{AgentInfo, AgentToken, GitalyInfo, PollInfo, ProjectInfo, Repository};
pub use fetch::{EntryDecision, FetchError, FetchVisitor, TreeFetcher};
pub use metadata::{MetadataClient, MetadataError};
