// Best-effort tag extraction from the uploaded bytes.
//
// This stage can never fail a request: malformed files, unsupported
// containers and tagless uploads all resolve to the same all-None structure.
// Only three fields are read; multi-value tags resolve to their first value
// (lofty's accessors already do this).

use lofty::prelude::*;
use lofty::probe::Probe;
use std::io::Cursor;

/// The three tag fields surfaced in the response. `None` means the tag was
/// absent or unreadable, and serializes as JSON null.
#[derive(Debug, Clone, Default)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub genre: Option<String>,
}

/// Extract title/artist/genre from raw audio bytes. Never fails — any
/// parsing problem degrades to an empty `TrackTags` with a warning log.
pub fn extract_tags(bytes: &[u8]) -> TrackTags {
    match try_extract(bytes) {
        Ok(tags) => tags,
        Err(e) => {
            tracing::warn!("Metadata extraction failed: {}", e);
            TrackTags::default()
        }
    }
}

fn try_extract(bytes: &[u8]) -> Result<TrackTags, lofty::error::LoftyError> {
    let tagged_file = Probe::new(Cursor::new(bytes)).guess_file_type()?.read()?;

    // Try primary tag first, then fall back to first available
    let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());

    Ok(match tag {
        Some(tag) => TrackTags {
            title: tag.title().as_deref().map(|s| s.to_string()),
            artist: tag.artist().as_deref().map(|s| s.to_string()),
            genre: tag.genre().as_deref().map(|s| s.to_string()),
        },
        None => TrackTags::default(),
    })
}
