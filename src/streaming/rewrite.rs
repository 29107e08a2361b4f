//! Playlist rewriting.
//!
//! Rewrites an HLS playlist so every URI line points back at the relay,
//! letting nested fetches (variant playlists, segments, keys served as
//! URI lines) recurse through the same pipeline. Directive and comment
//! lines pass through byte-for-byte; a URI line that cannot be resolved is
//! kept unmodified rather than failing the whole playlist.

use thiserror::Error;
use tracing::warn;
use url::Url;

/// Everything the rewriter needs to resolve and re-wrap one playlist.
#[derive(Debug, Clone)]
pub struct RewriteContext<'a> {
    /// The upstream playlist URL the relative references resolve against.
    pub target: &'a Url,
    /// Public base URL of this relay, no trailing slash required.
    pub public_base: &'a str,
    /// Route the relay endpoint is mounted on, e.g. `/stream-proxy`.
    pub relay_path: &'a str,
    /// Source label echoed into every rewritten URL.
    pub source: Option<&'a str>,
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("unresolvable reference: {0}")]
    Unresolvable(String),
}

/// Rewrite a playlist line by line.
///
/// Blank lines and `#`-prefixed lines are preserved verbatim. Every other
/// line is treated as a URI reference, resolved to an absolute target, and
/// wrapped as a relay URL carrying the resolved target in its `url`
/// parameter.
pub fn rewrite_manifest(text: &str, ctx: &RewriteContext<'_>) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            match resolve_reference(ctx.target, trimmed) {
                Ok(absolute) => out.push_str(&relay_url(&absolute, ctx)),
                Err(e) => {
                    warn!(reference = trimmed, error = %e, "keeping unresolvable playlist line");
                    out.push_str(line);
                }
            }
        }
        out.push('\n');
    }
    out
}

/// Resolve a playlist reference against the playlist's own URL.
///
/// Exactly one of three rules applies, in order:
/// 1. already absolute: used as-is,
/// 2. root-relative (`/`-prefixed): prefixed with the playlist's
///    scheme and authority,
/// 3. otherwise: prefixed with the playlist URL truncated at its last `/`
///    (query and fragment stripped first).
pub fn resolve_reference(base: &Url, reference: &str) -> Result<String, RewriteError> {
    let candidate = if reference.starts_with("http://") || reference.starts_with("https://") {
        reference.to_string()
    } else if reference.starts_with('/') {
        format!("{}{}", base.origin().ascii_serialization(), reference)
    } else {
        let base_str = crate::streaming::classify::strip_query_and_fragment(base.as_str());
        let cut = base_str
            .rfind('/')
            .ok_or_else(|| RewriteError::Unresolvable(reference.to_string()))?;
        format!("{}{}", &base_str[..=cut], reference)
    };

    // Resolution can still produce garbage (a reference with an invalid
    // host, say); validate so the caller can fall back to the raw line.
    Url::parse(&candidate).map_err(|_| RewriteError::Unresolvable(reference.to_string()))?;
    Ok(candidate)
}

fn relay_url(absolute_target: &str, ctx: &RewriteContext<'_>) -> String {
    let mut wrapped = format!(
        "{}{}?url={}",
        ctx.public_base.trim_end_matches('/'),
        ctx.relay_path,
        urlencoding::encode(absolute_target)
    );
    if let Some(source) = ctx.source {
        wrapped.push_str("&source=");
        wrapped.push_str(&urlencoding::encode(source));
    }
    wrapped
}
