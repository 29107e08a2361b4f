//! Header strategy catalog.
//!
//! Video CDNs gate their playlists and segments on request headers, and
//! they disagree about what a "real" request looks like: some reject
//! anything without a spoofed Origin/Referer pair, others reject requests
//! that carry one. The catalog answers with an ordered ladder per upstream
//! family, from header-rich down to completely bare, which the fetcher
//! walks until one rung is accepted.
//!
//! Lookup is pure: the same `(url, source)` pair always yields the same
//! ladder, and the ladder is never regenerated mid-request.

use url::Url;

use crate::streaming::classify;

/// A fixed browser identity presented by the header-rich rungs.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// One rung of the ladder: a named, ordered set of request headers.
#[derive(Debug, Clone)]
pub struct HeaderStrategy {
    pub name: &'static str,
    pub headers: Vec<(&'static str, String)>,
    /// When true the inbound client User-Agent is forwarded instead of a
    /// spoofed one. Rungs that set their own User-Agent leave this false.
    pub use_client_user_agent: bool,
}

impl HeaderStrategy {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A known upstream family and the identity it expects to be visited from.
struct UpstreamFamily {
    name: &'static str,
    /// Substrings matched against the source label or the target URL.
    tokens: &'static [&'static str],
    origin: &'static str,
    referer: &'static str,
}

const FAMILIES: &[UpstreamFamily] = &[
    UpstreamFamily {
        name: "embed.su",
        tokens: &["embed.su", "embedsu"],
        origin: "https://embed.su",
        referer: "https://embed.su/",
    },
    UpstreamFamily {
        name: "vidsrc",
        tokens: &["vidsrc"],
        origin: "https://vidsrc.xyz",
        referer: "https://vidsrc.xyz/",
    },
    UpstreamFamily {
        name: "vidlink",
        tokens: &["vidlink"],
        origin: "https://vidlink.pro",
        referer: "https://vidlink.pro/",
    },
    UpstreamFamily {
        name: "megacloud",
        tokens: &["megacloud", "rabbitstream"],
        origin: "https://megacloud.tv",
        referer: "https://megacloud.tv/",
    },
];

/// Produce the ordered header ladder for one target.
///
/// The family is picked by matching the source label first, then the URL
/// itself. Unknown targets get a default ladder that presents the target's
/// own origin, which satisfies same-origin referer checks on most CDNs.
pub fn strategies(url: &str, source: Option<&str>) -> Vec<HeaderStrategy> {
    // A wildcard Accept is replaced by whatever the URL suffix implies, so
    // a playlist request does not advertise itself as accepting anything.
    let accept = classify::inferred_accept(url).unwrap_or("*/*").to_string();

    match match_family(url, source) {
        Some(family) => ladder(family.origin, family.referer, &accept),
        None => {
            let (origin, referer) = self_origin(url);
            ladder(&origin, &referer, &accept)
        }
    }
}

fn match_family(url: &str, source: Option<&str>) -> Option<&'static UpstreamFamily> {
    let url = url.to_ascii_lowercase();
    let source = source.map(|s| s.to_ascii_lowercase());

    FAMILIES.iter().find(|family| {
        family.tokens.iter().any(|token| {
            source.as_deref().is_some_and(|s| s.contains(token)) || url.contains(token)
        })
    })
}

fn self_origin(url: &str) -> (String, String) {
    match Url::parse(url) {
        Ok(parsed) => {
            let origin = parsed.origin().ascii_serialization();
            let referer = format!("{origin}/");
            (origin, referer)
        }
        Err(_) => (String::new(), String::new()),
    }
}

fn ladder(origin: &str, referer: &str, accept: &str) -> Vec<HeaderStrategy> {
    vec![
        HeaderStrategy {
            name: "browser-full",
            headers: vec![
                ("User-Agent", BROWSER_USER_AGENT.to_string()),
                ("Accept", accept.to_string()),
                ("Accept-Language", "en-US,en;q=0.9".to_string()),
                ("Origin", origin.to_string()),
                ("Referer", referer.to_string()),
                ("Sec-Fetch-Dest", "empty".to_string()),
                ("Sec-Fetch-Mode", "cors".to_string()),
                ("Sec-Fetch-Site", "cross-site".to_string()),
                ("Connection", "keep-alive".to_string()),
            ],
            use_client_user_agent: false,
        },
        HeaderStrategy {
            name: "origin-referer",
            headers: vec![
                ("User-Agent", BROWSER_USER_AGENT.to_string()),
                ("Accept", accept.to_string()),
                ("Origin", origin.to_string()),
                ("Referer", referer.to_string()),
            ],
            use_client_user_agent: false,
        },
        HeaderStrategy {
            name: "referer-only",
            headers: vec![
                ("User-Agent", BROWSER_USER_AGENT.to_string()),
                ("Accept", accept.to_string()),
                ("Referer", referer.to_string()),
            ],
            use_client_user_agent: false,
        },
        HeaderStrategy {
            name: "minimal",
            headers: vec![("Accept", accept.to_string())],
            use_client_user_agent: true,
        },
        HeaderStrategy {
            name: "bare",
            headers: Vec::new(),
            use_client_user_agent: false,
        },
    ]
}
