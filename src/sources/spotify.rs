//! Cliente mínimo de la Web API de Spotify.
//!
//! Solo lectura de metadatos: el motor no reproduce desde Spotify, sino que
//! traduce cada entrada del catálogo a una búsqueda en el catálogo de
//! medios. Token client-credentials cacheado en proceso.

use parking_lot::Mutex;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::MusicError;

const API_BASE: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const PLAYLIST_PAGE_SIZE: usize = 100;

/// Entrada del catálogo cruzado: lo justo para buscarla en medios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogTrack {
    pub title: String,
    pub artist: String,
}

/// Tipo de recurso dentro de una URL de Spotify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotifyResource {
    Track,
    Playlist,
    Album,
    Artist,
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct SpotifyClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyClient {
    pub fn new(client_id: String, client_secret: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("cliente HTTP");

        Self {
            http,
            client_id,
            client_secret,
            token: Mutex::new(None),
        }
    }

    /// Token de acceso vigente, renovándolo si caducó.
    async fn token(&self) -> Result<String, MusicError> {
        if let Some(cached) = self.token.lock().clone() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value);
            }
        }

        debug!("🔑 Renovando token de Spotify");
        let response = self
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(map_http_err)?;

        if !response.status().is_success() {
            return Err(MusicError::transient(format!(
                "Spotify rechazó las credenciales: {}",
                response.status()
            )));
        }

        let body: Value = response.json().await.map_err(map_http_err)?;
        let value = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| MusicError::Internal("respuesta de token sin access_token".into()))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(3600);

        // Margen de 30 s para no usar un token al borde de caducar
        let cached = CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(30)),
        };
        *self.token.lock() = Some(cached);

        Ok(value)
    }

    async fn api_get(&self, url: &str) -> Result<Value, MusicError> {
        let token = self.token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_http_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(MusicError::NotFound {
                query: url.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(MusicError::transient(format!(
                "Spotify respondió {}",
                response.status()
            )));
        }

        response.json().await.map_err(map_http_err)
    }

    /// Metadatos de una pista.
    pub async fn track(&self, id: &str) -> Result<CatalogTrack, MusicError> {
        let body = self.api_get(&format!("{API_BASE}/tracks/{id}")).await?;
        parse_track(&body).ok_or_else(|| MusicError::NotFound {
            query: id.to_string(),
        })
    }

    /// Todas las pistas de una playlist, paginando de a 100.
    pub async fn playlist_tracks(&self, id: &str) -> Result<Vec<CatalogTrack>, MusicError> {
        let mut tracks = Vec::new();
        let mut offset = 0;

        loop {
            let body = self
                .api_get(&format!(
                    "{API_BASE}/playlists/{id}/tracks?limit={PLAYLIST_PAGE_SIZE}&offset={offset}"
                ))
                .await?;

            let items = body
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for item in &items {
                // Los huecos (pistas retiradas) vienen con track nulo
                if let Some(track) = item.get("track").and_then(parse_track_opt) {
                    tracks.push(track);
                }
            }

            if items.len() < PLAYLIST_PAGE_SIZE {
                break;
            }
            offset += PLAYLIST_PAGE_SIZE;
        }

        Ok(tracks)
    }

    /// Todas las pistas de un álbum.
    pub async fn album_tracks(&self, id: &str) -> Result<Vec<CatalogTrack>, MusicError> {
        let body = self.api_get(&format!("{API_BASE}/albums/{id}")).await?;

        let items = body
            .pointer("/tracks/items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(items.iter().filter_map(parse_track).collect())
    }

    /// Las pistas más escuchadas de un artista.
    pub async fn artist_top_tracks(&self, id: &str) -> Result<Vec<CatalogTrack>, MusicError> {
        let body = self
            .api_get(&format!("{API_BASE}/artists/{id}/top-tracks?market=US"))
            .await?;

        let items = body
            .get("tracks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(items.iter().filter_map(parse_track).collect())
    }

}

fn map_http_err(err: reqwest::Error) -> MusicError {
    if err.is_timeout() {
        MusicError::Timeout {
            operation: "catálogo",
            seconds: HTTP_TIMEOUT.as_secs(),
        }
    } else {
        MusicError::transient(err.to_string())
    }
}

fn parse_track(value: &Value) -> Option<CatalogTrack> {
    let title = value.get("name")?.as_str()?.to_string();
    let artist = value
        .get("artists")
        .and_then(Value::as_array)
        .map(|artists| {
            artists
                .iter()
                .filter_map(|a| a.get("name").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    Some(CatalogTrack { title, artist })
}

fn parse_track_opt(value: &Value) -> Option<CatalogTrack> {
    if value.is_null() {
        return None;
    }
    parse_track(value)
}

/// URL del catálogo cruzado.
pub fn is_spotify_url(url: &str) -> bool {
    url.contains("spotify.com") || url.starts_with("spotify:")
}

/// Descompone `https://open.spotify.com/{tipo}/{id}` en tipo e id.
pub fn parse_spotify_url(url: &str) -> Result<(SpotifyResource, String), MusicError> {
    let parts: Vec<&str> = url.split('/').collect();
    if parts.len() < 5 {
        return Err(MusicError::user("URL de Spotify inválida"));
    }

    let resource = match parts[3] {
        "track" => SpotifyResource::Track,
        "playlist" => SpotifyResource::Playlist,
        "album" => SpotifyResource::Album,
        "artist" => SpotifyResource::Artist,
        other => {
            return Err(MusicError::user(format!(
                "tipo de recurso de Spotify no soportado: {other}"
            )))
        }
    };

    let id = parts[4]
        .split('?')
        .next()
        .unwrap_or_default()
        .to_string();
    if id.is_empty() {
        return Err(MusicError::user("URL de Spotify inválida"));
    }

    Ok((resource, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descompone_urls_de_spotify() {
        let (kind, id) =
            parse_spotify_url("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC").unwrap();
        assert_eq!(kind, SpotifyResource::Track);
        assert_eq!(id, "4uLU6hMCjMI75M1A2tKUQC");

        let (kind, id) =
            parse_spotify_url("https://open.spotify.com/playlist/37i9dQZF1DX?si=abc123").unwrap();
        assert_eq!(kind, SpotifyResource::Playlist);
        assert_eq!(id, "37i9dQZF1DX");

        assert!(parse_spotify_url("https://open.spotify.com/show/xyz").is_err());
        assert!(parse_spotify_url("https://open.spotify.com").is_err());
    }

    #[test]
    fn reconoce_urls_de_spotify() {
        assert!(is_spotify_url("https://open.spotify.com/track/x"));
        assert!(is_spotify_url("spotify:track:x"));
        assert!(!is_spotify_url("https://www.youtube.com/watch?v=x"));
    }

    #[test]
    fn une_los_artistas_con_coma() {
        let value = json!({
            "name": "Canción",
            "artists": [{"name": "Uno"}, {"name": "Dos"}]
        });
        let track = parse_track(&value).unwrap();
        assert_eq!(track.title, "Canción");
        assert_eq!(track.artist, "Uno, Dos");
    }

    #[test]
    fn una_pista_nula_en_playlist_se_omite() {
        assert!(parse_track_opt(&Value::Null).is_none());
    }
}
