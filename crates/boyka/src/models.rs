//! The data model shared by the conversation store, the backends and the tools.
//!
//! Backends speak two different wire shapes for the same ideas. Everything is
//! converted into these structs at the edge, so the loop never looks at raw
//! JSON except for tool arguments.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
