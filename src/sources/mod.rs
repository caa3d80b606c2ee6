//! Package sources.
//!
//! The index answers "which versions of this package exist"; the fetcher
//! and cache turn a chosen version's artifact into a verified local tree.

pub mod archive;
pub mod cache;
pub mod fetch;
pub mod git;
pub mod index;

pub use cache::{ArtifactCache, CacheEntry, CacheError};
pub use archive::ArchiveFormat;
pub use fetch::{Fetcher, UrlFetcher};
pub use git::GitMirror;
pub use index::{DirectoryIndex, MemoryIndex, PackageIndex};
