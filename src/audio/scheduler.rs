//! Bucle de reproducción por guild.
//!
//! Una tarea por guild recorre la cola hasta agotarla: consulta el caché,
//! lanza descargas en segundo plano, aplica la política de un solo
//! reintento y desconecta al terminar.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audio::player::{GuildPlayer, PumpExit};
use crate::audio::track::Track;
use crate::audio::PlayerEvent;
use crate::cache::{self, AudioCache};
use crate::sources::youtube::YouTubeClient;

/// Bucle principal: corre hasta que la cola se agota o se pierde la voz.
/// `loop_running` en el player garantiza una sola instancia por guild.
pub(crate) async fn play_loop(
    player: Arc<GuildPlayer>,
    audio_cache: Arc<AudioCache>,
    youtube: Arc<YouTubeClient>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    wait_after_queue_empty: Duration,
) {
    let guild_id = player.guild_id;
    debug!("🔄 Bucle de reproducción iniciado en guild {}", guild_id);

    loop {
        let track = match player.queue.current() {
            Some(track) => track,
            None => match player.queue.advance() {
                Some(track) => track,
                None => {
                    // Cola vacía: la gracia configurada da una ventana a
                    // nuevos enqueues antes de soltar el socket de voz.
                    if player.is_connected()
                        && wait_for_new_tracks(&player, wait_after_queue_empty).await
                    {
                        continue;
                    }
                    finish(&player, &events).await;
                    return;
                }
            },
        };

        info!("🎵 Procesando pista: {}", track.title);
        consult_cache(&audio_cache, &youtube, &track);

        // Un único reintento para fallos transitorios: la URL de stream se
        // limpia entre intentos para forzar una consulta fresca al extractor.
        if let Err(first) = player.play().await {
            warn!(
                "⚠️ Primer intento fallido para {}: {}",
                track.title, first
            );

            let failure = if first.is_transient() {
                track.clear_stream_url();
                match player.play().await {
                    Ok(()) => None,
                    Err(second) => Some(second),
                }
            } else {
                Some(first)
            };

            if let Some(err) = failure {
                error!("❌ Pista fallida tras reintento: {}: {}", track.title, err);
                let _ = events.send(PlayerEvent::TrackFailed {
                    guild_id,
                    title: track.title.clone(),
                    reason: err.user_message(),
                });
                // Pasar de la pista fallida aunque la repetición esté
                // activa; advance() la re-seleccionaría sin fin. Si era la
                // última, el cursor en −1 no debe re-recorrer la cola.
                if player.queue.force_advance().is_none() {
                    info!("📭 Cola terminada tras una pista fallida en guild {}", guild_id);
                    finish(&player, &events).await;
                    return;
                }
                continue;
            }
        }

        debug!("⏳ Esperando a que la pista termine");
        let completion = player.wait_for_completion().await;

        // Un seek reconstruye el encoder sobre la misma pista
        if let Some(position) = player.take_pending_seek() {
            player.set_start_position(position);
            continue;
        }

        // El loop de pista solo aplica a una finalización natural; un skip
        // con loop activo debe avanzar igualmente
        if completion == PumpExit::Eos && player.queue.is_loop() {
            if player.is_connected() {
                info!("🔂 Repitiendo pista: {}", track.title);
                continue;
            }
            warn!("⚠️ Conexión de voz perdida durante el loop en guild {}", guild_id);
            player.queue.clear_all();
            player.set_loop_running(false);
            return;
        }

        if player.queue.peek().is_none() {
            if player.is_connected() && wait_for_new_tracks(&player, wait_after_queue_empty).await {
                player.queue.force_advance();
                continue;
            }
            info!("📭 Cola terminada en guild {}", guild_id);
            finish(&player, &events).await;
            return;
        }

        // Solo la finalización natural (rama de arriba) repite con loop;
        // llegar aquí tras un skip debe pasar a la siguiente pista
        player.queue.force_advance();
    }
}

/// Marca la pista con su copia local si está cacheada; si no, dispara una
/// descarga en segundo plano que nunca bloquea la reproducción.
fn consult_cache(audio_cache: &Arc<AudioCache>, youtube: &Arc<YouTubeClient>, track: &Arc<Track>) {
    let key = cache::generate_key(&track.url);

    if let Some(path) = audio_cache.get(&key) {
        track.set_local_path(path);
        return;
    }

    track.clear_local_path();

    // Los streams en vivo no tienen un contenedor finito que descargar
    if track.is_live {
        return;
    }

    let cache = audio_cache.clone();
    let youtube = youtube.clone();
    let url = track.url.clone();
    let title = track.title.clone();
    tokio::spawn(async move {
        debug!("⬇️ Descargando en segundo plano: {}", title);
        let download = cache
            .get_or_create(&key, |path| {
                let youtube = youtube.clone();
                let url = url.clone();
                async move { youtube.download(&url, &path).await }
            })
            .await;

        match download {
            Ok(_) => info!("✅ Descarga en segundo plano completada: {}", title),
            Err(err) => warn!("⚠️ Descarga en segundo plano fallida: {}: {}", title, err),
        }
    });
}

/// Espera la gracia configurada por si llegan pistas nuevas. Devuelve
/// `true` si la cola volvió a tener contenido.
async fn wait_for_new_tracks(player: &Arc<GuildPlayer>, grace: Duration) -> bool {
    if grace.is_zero() {
        return false;
    }

    debug!(
        "⏲️ Esperando {}s por nuevas pistas en guild {}",
        grace.as_secs(),
        player.guild_id
    );
    tokio::select! {
        // Un enqueue pudo colarse antes de registrar la espera; el
        // re-chequeo tras la gracia lo recoge igualmente
        _ = tokio::time::sleep(grace) => has_tracks(player),
        _ = player.wait_enqueue() => has_tracks(player),
    }
}

// Solo cuenta lo que haya después del cursor: la pista recién terminada
// sigue en la cola y no debe disparar una re-reproducción.
fn has_tracks(player: &Arc<GuildPlayer>) -> bool {
    player.queue.peek().is_some()
}

/// Teardown final: cola limpia, flag de bucle abajo, voz desconectada.
async fn finish(player: &Arc<GuildPlayer>, events: &mpsc::UnboundedSender<PlayerEvent>) {
    player.queue.clear_all();
    player.set_loop_running(false);
    player.disconnect().await;
    let _ = events.send(PlayerEvent::QueueFinished {
        guild_id: player.guild_id,
    });
    debug!("🔚 Bucle de reproducción terminado en guild {}", player.guild_id);
}
