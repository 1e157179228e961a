//! tern-core: plumbing shared by every tern layer.
//!
//! - [`codec`]: varint and fixed-width integer encoding
//! - [`region`]: key ranges and server identities
//! - [`env`]: the filesystem capability set consumed by the storage engine
//! - [`filename`]: on-disk naming of logs, manifests and tables

pub mod codec;
pub mod env;
pub mod error;
pub mod filename;
pub mod region;

pub use env::{DiskEnv, Env, WritableFile};
pub use error::{CodecError, Result};
pub use region::{Region, ServerName};
