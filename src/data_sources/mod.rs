//! Remote stores Barnwatch can read room data from.
//!
//! - [`postgrest`]: Supabase/PostgREST REST endpoint hosting the barn tables
//!
//! The embedded SQLite store lives in [`crate::storage`].

pub mod postgrest;

pub use postgrest::PostgrestClient;
