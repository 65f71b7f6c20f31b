//! Client-side synchronization of the community feed.
//!
//! [`client::SyncClient`] ties together the [`cache::QueryCache`] holding
//! fetched posts, optimistic [`mutation`]s and [`realtime`] reconciliation
//! with changes made elsewhere.

pub mod cache;
pub mod client;
pub mod mutation;
pub mod realtime;
pub mod session;
