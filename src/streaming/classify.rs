//! Classification of upstream resources.
//!
//! The relay only distinguishes three kinds of content: playlists (which
//! get rewritten), subtitles (which get a corrected Content-Type), and
//! everything else (which streams through untouched). Classification uses
//! the URL suffix first and falls back to the upstream Content-Type, since
//! many CDNs serve playlists as `application/octet-stream`.

/// How the relay should treat a fetched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// An HLS playlist. Buffered and rewritten.
    Manifest,
    /// A subtitle file. Buffered, emitted with a corrected Content-Type.
    Subtitle(SubtitleFormat),
    /// Segments, containers, everything else. Streamed through.
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleFormat {
    WebVtt,
    SubRip,
}

impl ContentKind {
    /// Classify by URL suffix and/or upstream Content-Type.
    pub fn classify(url: &str, content_type: Option<&str>) -> Self {
        let path = strip_query_and_fragment(url).to_ascii_lowercase();
        let content_type = content_type.map(|ct| ct.to_ascii_lowercase());
        let ct = content_type.as_deref().unwrap_or("");

        if path.ends_with(".m3u8") || path.ends_with(".m3u") || ct.contains("mpegurl") {
            return ContentKind::Manifest;
        }
        if path.ends_with(".vtt") || ct.starts_with("text/vtt") {
            return ContentKind::Subtitle(SubtitleFormat::WebVtt);
        }
        if path.ends_with(".srt") || ct.starts_with("text/plain") {
            return ContentKind::Subtitle(SubtitleFormat::SubRip);
        }
        ContentKind::Opaque
    }
}

impl SubtitleFormat {
    /// The Content-Type the relay emits for this format.
    pub fn content_type(self) -> &'static str {
        match self {
            SubtitleFormat::WebVtt => "text/vtt; charset=utf-8",
            SubtitleFormat::SubRip => "text/plain; charset=utf-8",
        }
    }
}

/// Accept header value implied by the URL suffix, used to replace a
/// strategy's wildcard Accept. `None` when the suffix says nothing.
pub fn inferred_accept(url: &str) -> Option<&'static str> {
    let path = strip_query_and_fragment(url).to_ascii_lowercase();
    if path.ends_with(".m3u8") || path.ends_with(".m3u") {
        Some("application/vnd.apple.mpegurl")
    } else if path.ends_with(".ts") {
        Some("video/mp2t")
    } else if path.ends_with(".mp4") || path.ends_with(".m4s") || path.ends_with(".m4a") {
        Some("video/mp4")
    } else if path.ends_with(".vtt") {
        Some("text/vtt")
    } else if path.ends_with(".srt") {
        Some("text/plain")
    } else {
        None
    }
}

pub fn strip_query_and_fragment(url: &str) -> &str {
    match url.find(['?', '#']) {
        Some(pos) => &url[..pos],
        None => url,
    }
}
