//! Metadata provider boundary (§2.A, §4.D item "Match").
//!
//! Real providers (LastFM, Spotify, ...) are out of scope (§1); this trait
//! exists so the detection loop's concurrent, 10s-bounded metadata fetch
//! (§4.D, mirroring the original's `asyncio.gather(get_last_fm_track(...),
//! get_last_fm_artist(...), _get_album())`) has three independent facets to
//! call concurrently and something to stub in tests.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::TunerResult;

/// Track-facet enrichment (LastFM "track.getInfo" equivalent).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TrackFacet {
    pub title: String,
    pub duration_seconds: Option<f64>,
}

/// Artist-facet enrichment (LastFM "artist.getInfo" equivalent).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ArtistFacet {
    pub name: String,
}

/// Album-facet enrichment (LastFM "album.getInfo" equivalent); only fetched
/// when the raw match carries an album hint.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AlbumFacet {
    pub title: String,
}

/// The three facets fetched concurrently for a single match.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TrackMetadata {
    pub track: Option<TrackFacet>,
    pub artist: Option<ArtistFacet>,
    pub album: Option<AlbumFacet>,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Fetches track-level enrichment given the fingerprint's own title guess.
    async fn fetch_track(&self, title_hint: &str) -> TunerResult<Option<TrackFacet>>;
    /// Fetches artist-level enrichment.
    async fn fetch_artist(&self, artist_hint: &str) -> TunerResult<Option<ArtistFacet>>;
    /// Fetches album-level enrichment; `album_hint` is `None` when the raw
    /// match didn't carry an album name (the original skips this fetch
    /// entirely in that case, via `_get_album()`'s own `if` guard).
    async fn fetch_album(&self, artist_hint: &str, album_hint: Option<&str>) -> TunerResult<Option<AlbumFacet>>;

    /// Fetches all three facets concurrently, folding individual fetch
    /// errors into `None` rather than failing the whole enrichment — a
    /// missing artist bio shouldn't block a found track title.
    async fn fetch_all(&self, title_hint: &str, artist_hint: &str, album_hint: Option<&str>) -> TrackMetadata {
        let (track, artist, album) = tokio::join!(
            self.fetch_track(title_hint),
            self.fetch_artist(artist_hint),
            self.fetch_album(artist_hint, album_hint),
        );
        TrackMetadata {
            track: track.ok().flatten(),
            artist: artist.ok().flatten(),
            album: album.ok().flatten(),
        }
    }
}

/// A provider with no backing data source; used where metadata is genuinely
/// optional (the scheduler tolerates an empty metadata fetch, §4.D).
pub struct NullMetadataProvider;

#[async_trait]
impl MetadataProvider for NullMetadataProvider {
    async fn fetch_track(&self, _title_hint: &str) -> TunerResult<Option<TrackFacet>> {
        Ok(None)
    }

    async fn fetch_artist(&self, _artist_hint: &str) -> TunerResult<Option<ArtistFacet>> {
        Ok(None)
    }

    async fn fetch_album(&self, _artist_hint: &str, _album_hint: Option<&str>) -> TunerResult<Option<AlbumFacet>> {
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) struct StubMetadataProvider {
    pub track: Option<TrackFacet>,
    pub artist: Option<ArtistFacet>,
    pub album: Option<AlbumFacet>,
}

#[cfg(test)]
#[async_trait]
impl MetadataProvider for StubMetadataProvider {
    async fn fetch_track(&self, _title_hint: &str) -> TunerResult<Option<TrackFacet>> {
        Ok(self.track.clone())
    }

    async fn fetch_artist(&self, _artist_hint: &str) -> TunerResult<Option<ArtistFacet>> {
        Ok(self.artist.clone())
    }

    async fn fetch_album(&self, _artist_hint: &str, _album_hint: Option<&str>) -> TunerResult<Option<AlbumFacet>> {
        Ok(self.album.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_provider_returns_no_facets() {
        let provider = NullMetadataProvider;
        let result = provider.fetch_all("title", "artist", Some("album")).await;
        assert_eq!(result, TrackMetadata::default());
    }

    #[tokio::test]
    async fn fetch_all_joins_all_three_facets_concurrently() {
        let provider = StubMetadataProvider {
            track: Some(TrackFacet { title: "Song".into(), duration_seconds: Some(180.0) }),
            artist: Some(ArtistFacet { name: "Artist".into() }),
            album: None,
        };
        let result = provider.fetch_all("title", "artist", None).await;
        assert_eq!(result.track.unwrap().title, "Song");
        assert_eq!(result.artist.unwrap().name, "Artist");
        assert!(result.album.is_none());
    }
}
