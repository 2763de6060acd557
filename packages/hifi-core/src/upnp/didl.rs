//! DIDL-Lite track metadata parsing.
//!
//! Renderers report the current item as a DIDL-Lite document embedded
//! (entity-escaped) in `TrackMetaData` or OpenHome's `Metadata` field.

use serde::Serialize;

use super::xml::{extract_non_empty, extract_xml_attr};
use crate::utils::parse_hms;

/// Track fields the core displays.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Absolute artwork URL, if the renderer published one.
    pub album_art_uri: Option<String>,
    /// Seconds, from the `res@duration` attribute.
    pub duration: Option<f64>,
}

impl TrackMetadata {
    /// True when nothing displayable was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.artist.is_none() && self.album.is_none()
    }
}

/// Parses an (already unescaped) DIDL-Lite document.
///
/// Returns `None` for empty input and for the literal `NOT_IMPLEMENTED`
/// some renderers send. Artist falls back from `upnp:artist` to
/// `dc:creator`.
#[must_use]
pub fn parse_didl(didl: &str) -> Option<TrackMetadata> {
    let didl = didl.trim();
    if didl.is_empty() || didl.eq_ignore_ascii_case("NOT_IMPLEMENTED") {
        return None;
    }

    let metadata = TrackMetadata {
        title: extract_non_empty(didl, "title"),
        artist: extract_non_empty(didl, "artist").or_else(|| extract_non_empty(didl, "creator")),
        album: extract_non_empty(didl, "album"),
        album_art_uri: extract_non_empty(didl, "albumArtURI")
            .filter(|u| u.starts_with("http://") || u.starts_with("https://")),
        duration: extract_xml_attr(didl, "res", b"duration").and_then(|d| parse_hms(&d)),
    };

    if metadata.is_empty() && metadata.album_art_uri.is_none() {
        return None;
    }
    Some(metadata)
}
