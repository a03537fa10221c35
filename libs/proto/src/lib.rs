//! # lagoon-proto
//!
//! Wire types for lagoon's two proto surfaces:
//!
//! - [`reporter`]: the inventory report agents post to the controller, a
//!   unary RPC carried as a prost-encoded body over HTTP/2.
//! - [`cri`]: the subset of the container runtime's `runtime.v1`
//!   `ImageService` that the agent consumes (`PullImage`, `ImageStatus`,
//!   `ListImages`), with a unary tonic client.
//!
//! The messages are hand-maintained rather than emitted by a build script so
//! the workspace builds without `protoc`; field numbers match the upstream
//! schemas for every field we consume, and unknown fields are skipped by
//! prost on decode.

pub mod cri;
pub mod reporter;
