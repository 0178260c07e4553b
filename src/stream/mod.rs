//! Stream-window aggregation.
//!
//! Streamed session updates are small deltas. The [`buffer`] groups them into
//! one open window per kind and conversation, and the [`translator`] decides
//! which windows to close as updates arrive, so that consumers see coherent
//! units in arrival order.

pub mod buffer;
pub mod translator;
pub mod window;

pub use buffer::StreamWindowBuffer;
pub use translator::translate;
pub use window::{ChatGeneration, OutputUnit, StreamWindow, WindowKind};
