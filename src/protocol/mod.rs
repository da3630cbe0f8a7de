//! Wire protocol support for the graph back end
//!
//! The graph protocol server speaks RESP (Redis Serialization Protocol) with
//! `GRAPH.*` commands. Only the client side is implemented here.

pub mod resp;

pub use resp::{FrameScanner, RespError, RespResult, RespValue};
