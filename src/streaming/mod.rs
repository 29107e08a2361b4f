//! Content classification and playlist rewriting for relayed resources.

pub mod classify;
pub mod rewrite;

pub use classify::{ContentKind, SubtitleFormat};
pub use rewrite::{RewriteContext, rewrite_manifest};
