//! UnixFS DAG decode support.
//!
//! This crate knows how to turn a raw dag-pb block into its links and, for file/raw nodes, the
//! bytes or chunk tree underneath. It does not know anything about how the block got here —
//! fetch-core's IPFS retrieval engine is the only caller and owns peer selection, Bitswap
//! requests, and per-CID aggregation.

pub mod file;
pub mod pb;

pub use file::{FileError, FileReadFailed};
