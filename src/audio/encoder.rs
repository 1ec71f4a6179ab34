//! Pipeline de transcodificación: un subproceso ffmpeg emite PCM s16le por
//! stdout, un worker lo trocea en frames de 20 ms, aplica el volumen y lo
//! comprime a opus hacia un canal acotado.
//!
//! `EncoderHandle::cleanup` es la primitiva universal de cancelación: stop,
//! skip, seek y disconnect pasan todos por ella.

use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::MusicError;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
/// 20 ms a 48 kHz.
pub const FRAME_SAMPLES: usize = 960;
pub const OPUS_BITRATE: i32 = 128_000;

/// ≈ 6 segundos de audio; desacopla las ráfagas de ffmpeg de la cadencia
/// estricta de la bomba y aplica contrapresión cuando ésta se detiene.
const FRAME_CHANNEL_CAPACITY: usize = 300;
const MAX_OPUS_PACKET: usize = 4000;

/// Origen del transcoder.
pub enum EncoderSource {
    /// Archivo completo en el caché local.
    File(PathBuf),
    /// URL directa de medios, con reconexión ante cortes.
    Url(String),
}

/// Secuencia perezosa y finita de frames opus de tamaño fijo.
pub struct Encoder {
    frames: mpsc::Receiver<Vec<u8>>,
    handle: EncoderHandle,
}

/// Handle clonable para cancelar el encoder desde cualquier tarea.
#[derive(Clone)]
pub struct EncoderHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl Encoder {
    /// Lanza ffmpeg sobre `source` y arranca el worker de codificación.
    ///
    /// `start_at` se traduce a `-ss` para reconstrucciones tras un seek.
    /// `volume` (0–100) se lee en vivo en cada frame.
    pub fn new(
        source: EncoderSource,
        start_at: Duration,
        volume: Arc<AtomicU8>,
    ) -> Result<Self, MusicError> {
        let mut cmd = Command::new("ffmpeg");

        let input = match &source {
            EncoderSource::File(path) => path.display().to_string(),
            EncoderSource::Url(url) => {
                cmd.args([
                    "-reconnect",
                    "1",
                    "-reconnect_streamed",
                    "1",
                    "-reconnect_delay_max",
                    "5",
                ]);
                url.clone()
            }
        };

        if !start_at.is_zero() {
            let offset = format!("{:.3}", start_at.as_secs_f64());
            cmd.args(["-ss", offset.as_str()]);
        }

        let sample_rate = SAMPLE_RATE.to_string();
        let channels = CHANNELS.to_string();
        cmd.args([
            "-i",
            input.as_str(),
            "-f",
            "s16le",
            "-ar",
            sample_rate.as_str(),
            "-ac",
            channels.as_str(),
            "-loglevel",
            "error",
            "pipe:1",
        ]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MusicError::Internal("ffmpeg sin stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MusicError::Internal("ffmpeg sin stderr".into()))?;

        let opus = OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
            .and_then(|mut enc| {
                enc.set_bitrate(Bitrate::BitsPerSecond(OPUS_BITRATE))?;
                Ok(enc)
            })
            .map_err(|err| MusicError::fatal(format!("no se pudo crear el encoder opus: {err}")))?;

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(drain_stderr(stderr));
        tokio::spawn(encode_loop(
            child,
            stdout,
            opus,
            volume,
            frame_tx,
            cancel.clone(),
            done_tx,
        ));

        Ok(Self {
            frames: frame_rx,
            handle: EncoderHandle {
                cancel,
                done: done_rx,
            },
        })
    }

    /// Siguiente frame opus; `None` es fin de stream (fuente agotada o
    /// limpieza solicitada).
    pub async fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.recv().await
    }

    pub fn handle(&self) -> EncoderHandle {
        self.handle.clone()
    }

    /// Construye un encoder ya agotado que sirve los frames dados, para
    /// ejercitar la bomba sin subprocesos.
    #[cfg(test)]
    pub(crate) fn from_frames(frames: Vec<Vec<u8>>) -> Self {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY.max(frames.len() + 1));
        for frame in frames {
            tx.try_send(frame).expect("capacidad suficiente");
        }
        drop(tx);

        let (done_tx, done_rx) = watch::channel(true);
        drop(done_tx);

        Self {
            frames: rx,
            handle: EncoderHandle {
                cancel: CancellationToken::new(),
                done: done_rx,
            },
        }
    }
}

impl EncoderHandle {
    /// Detiene el worker, mata y recoge el subproceso y cierra el canal.
    /// Idempotente y segura desde cualquier tarea, incluso con un
    /// `next_frame` bloqueado.
    pub async fn cleanup(&self) {
        self.cancel.cancel();
        let mut done = self.done.clone();
        // Si el worker ya terminó y soltó el emisor, wait_for devuelve Err:
        // también cuenta como terminado.
        let _ = done.wait_for(|finished| *finished).await;
    }
}

/// Registra los errores que ffmpeg escriba por stderr.
async fn drain_stderr(stderr: ChildStderr) {
    let mut stderr = stderr;
    let mut buf = vec![0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                let text = text.trim();
                if !text.is_empty() {
                    error!("❌ ffmpeg: {}", text);
                }
            }
        }
    }
}

/// Worker: lee frames exactos de PCM, aplica volumen, comprime y ofrece al
/// canal. Al salir por cualquier vía mata y recoge el subproceso.
async fn encode_loop(
    mut child: Child,
    mut stdout: ChildStdout,
    mut opus: OpusEncoder,
    volume: Arc<AtomicU8>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
) {
    let mut pcm_bytes = vec![0u8; FRAME_SAMPLES * CHANNELS * 2];
    let mut samples = vec![0i16; FRAME_SAMPLES * CHANNELS];
    let mut frame_count: u64 = 0;

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("🛑 Worker de codificación detenido: {} frames", frame_count);
                break;
            }
            read = stdout.read_exact(&mut pcm_bytes) => read,
        };

        match read {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Fin normal; un frame parcial final se descarta en silencio
                info!("🏁 Stream terminado: {} frames codificados", frame_count);
                break;
            }
            Err(err) => {
                error!("❌ Error leyendo PCM de ffmpeg: {}", err);
                break;
            }
        }

        pcm_to_samples(&pcm_bytes, &mut samples);
        apply_volume(&mut samples, volume.load(Ordering::Relaxed));

        let mut packet = vec![0u8; MAX_OPUS_PACKET];
        let written = match opus.encode(&samples, &mut packet) {
            Ok(n) => n,
            Err(err) => {
                error!("❌ Error de codificación opus: {}", err);
                break;
            }
        };
        packet.truncate(written);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("🛑 Worker detenido mientras ofrecía un frame");
                break;
            }
            sent = frame_tx.send(packet) => {
                if sent.is_err() {
                    break;
                }
                frame_count += 1;
                if frame_count % 500 == 0 {
                    debug!("🎼 Progreso de codificación: {} frames", frame_count);
                }
            }
        }
    }

    // Nunca dejar un hijo sin recoger
    if let Err(err) = child.kill().await {
        debug!("ffmpeg ya había salido: {}", err);
    }
    let _ = done_tx.send(true);
}

/// Bytes little-endian intercalados → muestras i16.
fn pcm_to_samples(bytes: &[u8], samples: &mut [i16]) {
    for (sample, chunk) in samples.iter_mut().zip(bytes.chunks_exact(2)) {
        *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
    }
}

/// Escala las muestras al volumen dado (0–100); 100 es el nivel nominal.
fn apply_volume(samples: &mut [i16], volume: u8) {
    if volume >= 100 {
        return;
    }
    let gain = i32::from(volume);
    for sample in samples.iter_mut() {
        *sample = ((i32::from(*sample) * gain) / 100) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volumen_cero_produce_silencio() {
        let mut samples = vec![1000, -1000, i16::MAX, i16::MIN];
        apply_volume(&mut samples, 0);
        assert_eq!(samples, vec![0, 0, 0, 0]);
    }

    #[test]
    fn volumen_nominal_no_altera_las_muestras() {
        let original = vec![1000, -1000, i16::MAX, i16::MIN];
        let mut samples = original.clone();
        apply_volume(&mut samples, 100);
        assert_eq!(samples, original);
    }

    #[test]
    fn volumen_medio_escala_hacia_cero() {
        let mut samples = vec![1000, -1000, 7];
        apply_volume(&mut samples, 50);
        assert_eq!(samples[0], 500);
        assert_eq!(samples[1], -500);
        // La división entera trunca hacia cero
        assert_eq!(samples[2], 3);
    }

    #[test]
    fn pcm_le_se_convierte_a_i16() {
        let bytes = [0x00, 0x00, 0xff, 0x7f, 0x00, 0x80];
        let mut samples = [0i16; 3];
        pcm_to_samples(&bytes, &mut samples);
        assert_eq!(samples, [0, i16::MAX, i16::MIN]);
    }

    #[tokio::test]
    async fn encoder_de_prueba_entrega_en_orden_y_termina() {
        let mut enc = Encoder::from_frames(vec![vec![1], vec![2], vec![3]]);
        assert_eq!(enc.next_frame().await, Some(vec![1]));
        assert_eq!(enc.next_frame().await, Some(vec![2]));
        assert_eq!(enc.next_frame().await, Some(vec![3]));
        assert_eq!(enc.next_frame().await, None);
        assert_eq!(enc.next_frame().await, None);
    }

    #[tokio::test]
    async fn cleanup_es_idempotente() {
        let enc = Encoder::from_frames(vec![]);
        let handle = enc.handle();
        handle.cleanup().await;
        handle.cleanup().await;
    }
}
