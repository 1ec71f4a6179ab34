//! Resolución de consultas: de texto libre o URL a una lista de pistas.

pub mod spotify;
pub mod youtube;

pub use spotify::SpotifyClient;
pub use youtube::YouTubeClient;

use std::sync::Arc;
use tracing::{debug, info};

use crate::audio::track::Track;
use crate::config::Config;
use crate::error::MusicError;
use crate::sources::spotify::SpotifyResource;

/// Despacha cada consulta al cliente adecuado.
///
/// Orden: URL de Spotify (catálogo cruzado) → URL de medios (playlist o
/// video) → búsqueda de texto con un solo resultado. Nunca reintenta; los
/// fallos suben tipados.
pub struct Resolver {
    youtube: Arc<YouTubeClient>,
    spotify: Option<SpotifyClient>,
}

impl Resolver {
    pub fn new(youtube: Arc<YouTubeClient>, spotify: Option<SpotifyClient>) -> Self {
        Self { youtube, spotify }
    }

    /// Construye el resolver con el cliente de Spotify solo si hay
    /// credenciales configuradas.
    pub fn from_config(config: &Config, youtube: Arc<YouTubeClient>) -> Self {
        let spotify = match (&config.spotify_client_id, &config.spotify_client_secret) {
            (Some(id), Some(secret)) => Some(SpotifyClient::new(id.clone(), secret.clone())),
            _ => None,
        };
        Self::new(youtube, spotify)
    }

    /// Resuelve una consulta a pistas. `requested_by` lo estampa el caller.
    pub async fn resolve(&self, query: &str) -> Result<Vec<Track>, MusicError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MusicError::user("la consulta está vacía"));
        }

        if spotify::is_spotify_url(query) {
            return self.resolve_spotify(query).await;
        }

        if youtube::is_youtube_url(query) {
            if youtube::is_playlist_url(query) {
                return self.youtube.playlist_info(query).await;
            }
            return Ok(vec![self.youtube.video_info(query).await?]);
        }

        self.youtube.search(query).await
    }

    /// Catálogo cruzado: trae los metadatos de Spotify y busca cada entrada
    /// en el catálogo de medios. Las entradas sin correspondencia se
    /// omiten sin que sea fatal.
    async fn resolve_spotify(&self, url: &str) -> Result<Vec<Track>, MusicError> {
        let client = self.spotify.as_ref().ok_or_else(|| {
            MusicError::user("la integración con Spotify no está configurada")
        })?;

        let (kind, id) = spotify::parse_spotify_url(url)?;
        let entries = match kind {
            SpotifyResource::Track => vec![client.track(&id).await?],
            SpotifyResource::Playlist => client.playlist_tracks(&id).await?,
            SpotifyResource::Album => client.album_tracks(&id).await?,
            SpotifyResource::Artist => client.artist_top_tracks(&id).await?,
        };

        let mut tracks = Vec::new();
        for entry in &entries {
            let search = format!("{} {}", entry.artist, entry.title);
            match self.youtube.search(&search).await {
                Ok(mut found) if !found.is_empty() => tracks.push(found.remove(0)),
                _ => debug!("🫥 Sin correspondencia en medios: {}", search),
            }
        }

        if tracks.is_empty() {
            return Err(MusicError::NotFound {
                query: url.to_string(),
            });
        }

        info!(
            "🔁 Catálogo cruzado: {}/{} pistas con correspondencia",
            tracks.len(),
            entries.len()
        );
        Ok(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consulta_vacia_es_error_de_usuario() {
        let resolver = Resolver::new(Arc::new(YouTubeClient::new()), None);
        assert!(matches!(
            resolver.resolve("   ").await,
            Err(MusicError::User(_))
        ));
    }

    #[tokio::test]
    async fn spotify_sin_credenciales_es_error_de_usuario() {
        let resolver = Resolver::new(Arc::new(YouTubeClient::new()), None);
        let result = resolver
            .resolve("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC")
            .await;
        assert!(matches!(result, Err(MusicError::User(_))));
    }
}
