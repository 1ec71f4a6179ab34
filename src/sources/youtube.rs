//! Cliente del extractor de medios (`yt-dlp`, como subproceso).
//!
//! Cada operación corre con su propio plazo y sin reintentos internos; la
//! política de reintento vive en el scheduler.

use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audio::track::{duration_from_secs, Track, TrackSource};
use crate::error::MusicError;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const INFO_TIMEOUT: Duration = Duration::from_secs(30);
const PLAYLIST_TIMEOUT: Duration = Duration::from_secs(60);
const PREFETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Cuántas pistas de una playlist precargan su URL de stream en paralelo.
const PREFETCH_COUNT: usize = 3;

/// Cliente de yt-dlp.
pub struct YouTubeClient;

/// Objeto JSON que emite el extractor por video.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    formats: Vec<Format>,
}

#[derive(Debug, Deserialize)]
struct Format {
    #[serde(default)]
    url: String,
    #[serde(default)]
    acodec: Option<String>,
    #[serde(default)]
    vcodec: Option<String>,
    #[serde(default)]
    abr: Option<f64>,
}

impl Format {
    fn has_audio(&self) -> bool {
        matches!(self.acodec.as_deref(), Some(codec) if codec != "none") && !self.url.is_empty()
    }

    fn has_video(&self) -> bool {
        matches!(self.vcodec.as_deref(), Some(codec) if codec != "none")
    }
}

impl YouTubeClient {
    pub fn new() -> Self {
        Self
    }

    /// Comprueba que los binarios auxiliares existen antes de arrancar.
    pub async fn verify_dependencies(&self) -> Result<(), MusicError> {
        let ytdlp = Command::new("yt-dlp").arg("--version").output().await;
        match ytdlp {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
            }
            _ => {
                return Err(MusicError::Resource(std::io::Error::other(
                    "yt-dlp no disponible",
                )))
            }
        }

        let ffmpeg = Command::new("ffmpeg").arg("-version").output().await;
        match ffmpeg {
            Ok(output) if output.status.success() => info!("✅ ffmpeg disponible"),
            _ => {
                return Err(MusicError::Resource(std::io::Error::other(
                    "ffmpeg no disponible",
                )))
            }
        }

        Ok(())
    }

    /// Búsqueda de un solo resultado; las consultas que no son URL pasan
    /// por `ytsearch1`.
    pub async fn search(&self, query: &str) -> Result<Vec<Track>, MusicError> {
        let output = run_ytdlp(
            &[
                "--dump-json",
                "--no-playlist",
                "--no-warnings",
                "--default-search",
                "ytsearch1",
                query,
            ],
            SEARCH_TIMEOUT,
            "búsqueda",
        )
        .await?;

        let info = parse_single(&output, query)?;
        debug!(
            "🔍 Búsqueda completada: {} (stream precargado: {})",
            query,
            info.formats.iter().any(Format::has_audio)
        );
        Ok(vec![to_track(info)])
    }

    /// Información completa de un solo video.
    pub async fn video_info(&self, url: &str) -> Result<Track, MusicError> {
        let output = run_ytdlp(
            &["--dump-json", "--no-playlist", "--no-warnings", url],
            INFO_TIMEOUT,
            "info de video",
        )
        .await?;

        let info = parse_single(&output, url)?;
        Ok(to_track(info))
    }

    /// Listado plano de una playlist, con precarga en paralelo de las URLs
    /// de stream de las primeras pistas.
    pub async fn playlist_info(&self, url: &str) -> Result<Vec<Track>, MusicError> {
        let output = run_ytdlp(
            &["--dump-json", "--flat-playlist", "--no-warnings", url],
            PLAYLIST_TIMEOUT,
            "playlist",
        )
        .await?;

        if !output.status.success() {
            return Err(MusicError::transient(stderr_excerpt(&output)));
        }

        // Un objeto JSON por línea; las líneas malformadas se omiten
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut tracks: Vec<Track> = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(parse_playlist_line)
            .collect();

        if tracks.is_empty() {
            return Err(MusicError::NotFound {
                query: url.to_string(),
            });
        }

        info!("🎵 Playlist con {} pistas", tracks.len());
        self.prefetch_stream_urls(&mut tracks, PREFETCH_COUNT).await;
        Ok(tracks)
    }

    /// Precarga oportunista: reduce la latencia del primer play pero su
    /// ausencia nunca impide reproducir. Fallos por pista en silencio.
    async fn prefetch_stream_urls(&self, tracks: &mut [Track], count: usize) {
        let count = count.min(tracks.len());
        let mut lookups = JoinSet::new();

        for (index, track) in tracks.iter().enumerate().take(count) {
            if track.stream_url().is_some() || track.is_live || track.url.is_empty() {
                continue;
            }
            let url = track.url.clone();
            lookups.spawn(async move {
                let output = run_ytdlp(
                    &["--dump-json", "--no-playlist", "--no-warnings", url.as_str()],
                    PREFETCH_TIMEOUT,
                    "prefetch",
                )
                .await
                .ok()?;
                if !output.status.success() {
                    return None;
                }
                let info: VideoInfo = serde_json::from_slice(&output.stdout).ok()?;
                Some((index, info))
            });
        }

        let mut fetched = 0;
        while let Some(joined) = lookups.join_next().await {
            let Ok(Some((index, info))) = joined else {
                continue;
            };
            let track = &mut tracks[index];

            if let Some(stream) = select_best_audio(&info.formats) {
                track.set_stream_url(stream);
                fetched += 1;
            }
            // El listado plano a veces viene sin metadatos
            if track.title.is_empty() && !info.title.is_empty() {
                track.title = info.title;
            }
            if track.artist.is_empty() {
                if let Some(uploader) = info.uploader {
                    track.artist = uploader;
                }
            }
        }

        debug!("⚡ Precarga de playlist: {}/{} URLs", fetched, count);
    }

    /// Descarga el contenedor de audio a `path` (para el caché).
    pub async fn download(&self, url: &str, path: &Path) -> Result<(), MusicError> {
        let dest = path.display().to_string();
        let output = run_ytdlp(
            &[
                "-f",
                "bestaudio[ext=webm]/bestaudio",
                "--no-post-overwrites",
                "--no-warnings",
                "-o",
                dest.as_str(),
                url,
            ],
            DOWNLOAD_TIMEOUT,
            "descarga",
        )
        .await?;

        if !output.status.success() {
            return Err(MusicError::transient(stderr_excerpt(&output)));
        }
        Ok(())
    }

    /// URL directa del mejor audio (`-g`), para el streaming inmediato.
    pub async fn get_stream_url(&self, url: &str) -> Result<String, MusicError> {
        let output = run_ytdlp(
            &["-f", "bestaudio", "-g", "--no-warnings", url],
            INFO_TIMEOUT,
            "stream-url",
        )
        .await?;

        if !output.status.success() {
            return Err(MusicError::transient(stderr_excerpt(&output)));
        }

        let stream = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        if stream.is_empty() {
            return Err(MusicError::transient("el extractor no devolvió una URL"));
        }
        Ok(stream)
    }
}

impl Default for YouTubeClient {
    fn default() -> Self {
        Self::new()
    }
}

/// URL del catálogo de medios.
pub fn is_youtube_url(url: &str) -> bool {
    url.contains("youtube.com") || url.contains("youtu.be")
}

/// URL de playlist del catálogo de medios.
pub fn is_playlist_url(url: &str) -> bool {
    url.contains("playlist") || url.contains("list=")
}

/// Ejecuta yt-dlp con un plazo; al expirar, el subproceso se mata.
async fn run_ytdlp(
    args: &[&str],
    timeout: Duration,
    operation: &'static str,
) -> Result<std::process::Output, MusicError> {
    let mut cmd = Command::new("yt-dlp");
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            warn!("⏰ yt-dlp superó el plazo de {}s en {}", timeout.as_secs(), operation);
            Err(MusicError::Timeout {
                operation,
                seconds: timeout.as_secs(),
            })
        }
        Ok(Err(err)) => Err(MusicError::Resource(err)),
        Ok(Ok(output)) => Ok(output),
    }
}

/// Interpreta la salida de una operación de un solo objeto JSON.
fn parse_single(output: &std::process::Output, query: &str) -> Result<VideoInfo, MusicError> {
    if !output.status.success() {
        return Err(MusicError::transient(stderr_excerpt(output)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(MusicError::NotFound {
            query: query.to_string(),
        });
    }

    serde_json::from_str(trimmed)
        .map_err(|err| MusicError::Internal(format!("JSON inválido del extractor: {err}")))
}

fn parse_playlist_line(line: &str) -> Option<Track> {
    let info: VideoInfo = serde_json::from_str(line).ok()?;
    Some(to_track(info))
}

/// Construye la pista a partir del objeto del extractor. La URL canónica se
/// reconstruye desde el id cuando el listado plano no la trae.
fn to_track(info: VideoInfo) -> Track {
    let url = match info.webpage_url {
        Some(url) if !url.is_empty() => url,
        _ if !info.id.is_empty() => format!("https://www.youtube.com/watch?v={}", info.id),
        _ => String::new(),
    };

    let track = Track::new(
        info.id,
        info.title,
        info.uploader.unwrap_or_default(),
        url,
        duration_from_secs(info.duration.unwrap_or(0.0)),
        TrackSource::YouTube,
        info.thumbnail.unwrap_or_default(),
        info.is_live.unwrap_or(false),
    );

    if let Some(stream) = select_best_audio(&info.formats) {
        track.set_stream_url(stream);
    }
    track
}

/// Entre los formatos con audio, prefiere solo-audio con mayor bitrate;
/// si no hay ninguno, cae a cualquier formato con audio.
fn select_best_audio(formats: &[Format]) -> Option<String> {
    let mut best: Option<&Format> = None;

    for format in formats {
        if !format.has_audio() || format.has_video() {
            continue;
        }
        let abr = format.abr.unwrap_or(0.0);
        if best.map_or(true, |b| abr > b.abr.unwrap_or(0.0)) {
            best = Some(format);
        }
    }

    if let Some(format) = best {
        return Some(format.url.clone());
    }

    formats
        .iter()
        .find(|f| f.has_audio())
        .map(|f| f.url.clone())
}

fn stderr_excerpt(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let excerpt: String = stderr.trim().chars().take(300).collect();
    if excerpt.is_empty() {
        "el extractor terminó con error".to_string()
    } else {
        excerpt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(url: &str, acodec: Option<&str>, vcodec: Option<&str>, abr: Option<f64>) -> Format {
        Format {
            url: url.to_string(),
            acodec: acodec.map(str::to_string),
            vcodec: vcodec.map(str::to_string),
            abr,
        }
    }

    #[test]
    fn prefiere_solo_audio_con_mayor_bitrate() {
        let formats = vec![
            format("https://a/low", Some("opus"), Some("none"), Some(64.0)),
            format("https://a/high", Some("opus"), Some("none"), Some(160.0)),
            format("https://a/video", Some("aac"), Some("h264"), Some(320.0)),
        ];
        assert_eq!(select_best_audio(&formats).as_deref(), Some("https://a/high"));
    }

    #[test]
    fn sin_solo_audio_cae_a_cualquier_formato_con_audio() {
        let formats = vec![
            format("https://a/mudo", Some("none"), Some("h264"), None),
            format("https://a/mixto", Some("aac"), Some("h264"), Some(128.0)),
        ];
        assert_eq!(
            select_best_audio(&formats).as_deref(),
            Some("https://a/mixto")
        );
    }

    #[test]
    fn sin_audio_no_hay_seleccion() {
        let formats = vec![
            format("https://a/mudo", Some("none"), Some("h264"), None),
            format("", Some("opus"), Some("none"), Some(160.0)),
        ];
        assert_eq!(select_best_audio(&formats), None);
        assert_eq!(select_best_audio(&[]), None);
    }

    #[test]
    fn clasifica_urls_del_catalogo() {
        assert!(is_youtube_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_youtube_url("https://youtu.be/abc"));
        assert!(!is_youtube_url("https://open.spotify.com/track/x"));

        assert!(is_playlist_url("https://www.youtube.com/playlist?list=PL123"));
        assert!(is_playlist_url("https://www.youtube.com/watch?v=abc&list=PL123"));
        assert!(!is_playlist_url("https://www.youtube.com/watch?v=abc"));
    }

    #[test]
    fn una_linea_de_playlist_plana_se_convierte_en_pista() {
        let line = r#"{"id":"abc123","title":"Canción","uploader":"Artista","duration":215.5}"#;
        let track = parse_playlist_line(line).expect("pista");

        assert_eq!(track.id, "abc123");
        assert_eq!(track.title, "Canción");
        assert_eq!(track.url, "https://www.youtube.com/watch?v=abc123");
        assert_eq!(track.duration, Duration::from_millis(215_500));
        assert!(track.stream_url().is_none());
    }

    #[test]
    fn lineas_malformadas_se_omiten() {
        assert!(parse_playlist_line("no es json").is_none());
    }

    #[test]
    fn el_objeto_completo_trae_stream_url_y_live() {
        let json = r#"{
            "id": "xyz",
            "title": "Directo",
            "webpage_url": "https://www.youtube.com/watch?v=xyz",
            "is_live": true,
            "formats": [
                {"url": "https://cdn/a", "acodec": "opus", "vcodec": "none", "abr": 128.0}
            ]
        }"#;
        let info: VideoInfo = serde_json::from_str(json).unwrap();
        let track = to_track(info);

        assert!(track.is_live);
        assert_eq!(track.stream_url().as_deref(), Some("https://cdn/a"));
        assert_eq!(track.duration, Duration::ZERO);
    }
}
