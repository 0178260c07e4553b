//! Agent Client Protocol (ACP) plumbing.
//!
//! Bidirectional NDJSON JSON-RPC over an agent's stdio. Leaf-first:
//!
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based line framing.
//! - `message`: envelope decoding and encoding.
//! - `reader` / `writer`: the transport's two worker loops.
//! - `transport`: lifecycle state machine owning both workers.
//! - `protocol`: request correlation and inbound routing.
//! - `client`: handshake, sessions, and prompt turns.
//! - `update`: typed `session/update` payloads.
//! - `operations` / `permission`: agent-initiated requests.
//! - `spawner`: agent process launch.

pub mod client;
pub mod codec;
pub mod message;
pub mod operations;
pub mod permission;
pub mod protocol;
pub mod reader;
pub mod spawner;
pub mod transport;
pub mod update;
pub mod writer;
