//! Domain model module declarations.

pub mod conversation;
pub mod event;
