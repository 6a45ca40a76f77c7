//! Common utilities and types shared across Outbox modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! most importantly the `PendingAction` record that every other layer moves around.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ActionId, ActionKind, PendingAction};
