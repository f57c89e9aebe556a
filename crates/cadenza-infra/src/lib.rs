//! Infrastructure layer for Cadenza.
//!
//! Contains the durable implementation of the store contract defined in
//! `cadenza-core`: SQLite persistence via sqlx with split read/write pools
//! and embedded migrations.

pub mod sqlite;
