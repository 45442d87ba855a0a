//! Storage record models matching table schemas.
//!
//! Each struct here corresponds directly to a table row and derives
//! `sqlx::FromRow` so the Postgres adapter can map query results; the
//! in-memory adapter stores the same structs verbatim. `*Create` structs
//! carry the caller-supplied fields for inserts, with ids and timestamps
//! stamped by the adapter.

pub mod job;
pub mod model;
pub mod prediction;
pub mod transaction;
pub mod user;
