//! Types a session publishes to its host.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them over whatever event bus it uses.

pub mod events;
