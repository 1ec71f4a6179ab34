use parking_lot::RwLock;
use std::path::PathBuf;
use std::time::Duration;

use crate::UserId;

/// Fuente de la que proviene una pista.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    YouTube,
    Spotify,
    Direct,
}

impl TrackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackSource::YouTube => "youtube",
            TrackSource::Spotify => "spotify",
            TrackSource::Direct => "direct",
        }
    }
}

/// Descriptor de una pista resuelta.
///
/// Los metadatos son inmutables tras la construcción. Solo dos campos se
/// rellenan después: `stream_url` (URL directa con caducidad de minutos) y
/// `local_path` (copia completa en el caché). Cola y encoder comparten la
/// pista vía `Arc`.
#[derive(Debug)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    /// URL canónica de la pista en su fuente; base de la clave de caché.
    pub url: String,
    /// Cero cuando la duración es desconocida; sin sentido si `is_live`.
    pub duration: Duration,
    pub source: TrackSource,
    pub thumbnail: String,
    pub requested_by: UserId,
    pub is_live: bool,

    stream_url: RwLock<Option<String>>,
    local_path: RwLock<Option<PathBuf>>,
}

impl Track {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        title: String,
        artist: String,
        url: String,
        duration: Duration,
        source: TrackSource,
        thumbnail: String,
        is_live: bool,
    ) -> Self {
        Self {
            id,
            title,
            artist,
            url,
            duration,
            source,
            thumbnail,
            requested_by: UserId::default(),
            is_live,
            stream_url: RwLock::new(None),
            local_path: RwLock::new(None),
        }
    }

    pub fn stream_url(&self) -> Option<String> {
        self.stream_url.read().clone()
    }

    pub fn set_stream_url(&self, url: String) {
        *self.stream_url.write() = Some(url);
    }

    /// Fuerza una consulta fresca en el siguiente intento de reproducción.
    pub fn clear_stream_url(&self) {
        *self.stream_url.write() = None;
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.local_path.read().clone()
    }

    pub fn set_local_path(&self, path: PathBuf) {
        *self.local_path.write() = Some(path);
    }

    pub fn clear_local_path(&self) {
        *self.local_path.write() = None;
    }
}

/// Convierte los segundos en coma flotante del extractor a `Duration`,
/// truncando al milisegundo.
pub fn duration_from_secs(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis((secs * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duracion_trunca_en_vez_de_redondear() {
        assert_eq!(duration_from_secs(30.9996), Duration::from_millis(30_999));
        assert_eq!(duration_from_secs(0.0), Duration::ZERO);
        assert_eq!(duration_from_secs(-5.0), Duration::ZERO);
        assert_eq!(duration_from_secs(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn stream_url_se_puede_limpiar() {
        let track = Track::new(
            "abc".into(),
            "Canción".into(),
            "Artista".into(),
            "https://example.com/watch?v=abc".into(),
            Duration::from_secs(30),
            TrackSource::YouTube,
            String::new(),
            false,
        );

        assert!(track.stream_url().is_none());
        track.set_stream_url("https://cdn.example/audio".into());
        assert!(track.stream_url().is_some());
        track.clear_stream_url();
        assert!(track.stream_url().is_none());
    }
}
