//! Vector-store mirroring.
//!
//! Every stored observation, summary, and user prompt is mirrored into a
//! per-project collection of an external embedding store, reached over a
//! length-framed JSON RPC (subprocess pipe in local mode, TCP in remote
//! mode). Sync operations are fire-and-forget: a vector-store outage never
//! blocks or fails the write path.

pub mod client;
pub mod sync;
pub mod types;

pub use client::{VectorClient, VectorEndpoint};
pub use sync::VectorSync;
pub use types::{DocMetadata, DocType, QueryMatch, VectorDoc};
