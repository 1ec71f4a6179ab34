use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::audio::encoder::{Encoder, EncoderHandle, EncoderSource};
use crate::audio::queue::Queue;
use crate::audio::track::Track;
use crate::audio::PlayerEvent;
use crate::cache::AudioCache;
use crate::config::Config;
use crate::error::MusicError;
use crate::sources::youtube::YouTubeClient;
use crate::sources::Resolver;
use crate::voice::VoiceTransport;
use crate::{GuildId, UserId};

/// Cota de seguridad para esperas de finalización de pista.
const MAX_TRACK_WAIT: Duration = Duration::from_secs(3 * 60 * 60);

/// Cómo terminó la bomba de frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpExit {
    /// La fuente se agotó; la pista se considera completada.
    Eos,
    /// Una señal de stop (skip, seek, stop, disconnect) cortó el envío.
    Stopped,
}

/// Estado mutable por guild, bajo un único lock de lectura/escritura.
/// El lock nunca se sostiene a través de un `.await`.
struct PlayState {
    playing: bool,
    paused: bool,
    loop_running: bool,
    voice: Option<Arc<dyn VoiceTransport>>,
    encoder: Option<EncoderHandle>,
    // Se incrementa en cada interrupción; un arranque en curso que vea el
    // valor cambiar aborta en vez de reproducir una pista ya saltada.
    interrupt_epoch: u64,
    position_base: Duration,
    position_since: Option<Instant>,
    pending_seek: Option<Duration>,
    reduce_on_voice: bool,
    reduce_on_voice_target: u8,
    original_volume: u8,
}

/// Player de una guild: cola, conexión de voz, encoder actual y señales.
pub struct GuildPlayer {
    pub guild_id: GuildId,
    pub queue: Queue,
    state: RwLock<PlayState>,
    volume: Arc<AtomicU8>,
    stop_tx: mpsc::Sender<()>,
    stop_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    done_tx: mpsc::Sender<PumpExit>,
    done_rx: tokio::sync::Mutex<mpsc::Receiver<PumpExit>>,
    enqueue_notify: Notify,
    youtube: Arc<YouTubeClient>,
}

impl GuildPlayer {
    pub fn new(guild_id: GuildId, config: &Config, youtube: Arc<YouTubeClient>) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);

        Self {
            guild_id,
            queue: Queue::new(),
            state: RwLock::new(PlayState {
                playing: false,
                paused: false,
                loop_running: false,
                voice: None,
                encoder: None,
                interrupt_epoch: 0,
                position_base: Duration::ZERO,
                position_since: None,
                pending_seek: None,
                reduce_on_voice: config.reduce_on_voice,
                reduce_on_voice_target: config.reduce_on_voice_target,
                original_volume: config.default_volume,
            }),
            volume: Arc::new(AtomicU8::new(config.default_volume)),
            stop_tx,
            stop_rx: tokio::sync::Mutex::new(stop_rx),
            done_tx,
            done_rx: tokio::sync::Mutex::new(done_rx),
            enqueue_notify: Notify::new(),
            youtube,
        }
    }

    /// Instala el transporte de voz entregado por la capa de comandos.
    pub fn connect(&self, transport: Arc<dyn VoiceTransport>) {
        self.state.write().voice = Some(transport);
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().voice.is_some()
    }

    /// Arranca la reproducción de la pista actual (o la siguiente si no hay
    /// actual). Si estaba en pausa, simplemente reanuda.
    ///
    /// La construcción del encoder ocurre aquí, antes de lanzar la bomba,
    /// para que sus fallos lleguen al scheduler y su política de reintento.
    pub async fn play(self: &Arc<Self>) -> Result<(), MusicError> {
        let epoch = {
            let mut state = self.state.write();
            if state.voice.is_none() {
                return Err(MusicError::user("no hay conexión con el canal de voz"));
            }
            if state.paused {
                state.paused = false;
                state.playing = true;
                state.position_since = Some(Instant::now());
                return Ok(());
            }
            state.interrupt_epoch
        };

        let track = match self.queue.current() {
            Some(track) => track,
            None => self
                .queue
                .advance()
                .ok_or_else(|| MusicError::user("no hay pistas en la cola"))?,
        };

        let start_at = self.state.read().position_base;
        let source = self.resolve_source(&track).await?;
        let mut encoder = Encoder::new(source, start_at, self.volume.clone())?;

        // Verificación del primer frame: una URL caducada hace que ffmpeg
        // muera sin emitir nada, y eso debe contar como fallo y no como
        // pista completada. Tras un seek no aplica (buscar al final de la
        // pista produce EOS legítimo de inmediato).
        let pending_first = if start_at.is_zero() {
            match tokio::time::timeout(Duration::from_secs(10), encoder.next_frame()).await {
                Ok(Some(frame)) => Some(frame),
                Ok(None) => {
                    encoder.handle().cleanup().await;
                    return Err(MusicError::transient(
                        "el transcoder terminó sin producir audio",
                    ));
                }
                Err(_) => {
                    encoder.handle().cleanup().await;
                    return Err(MusicError::Timeout {
                        operation: "transcoder",
                        seconds: 10,
                    });
                }
            }
        } else {
            None
        };

        self.drain_signals().await;

        let voice = {
            let mut state = self.state.write();
            // Una interrupción durante la construcción del encoder (skip,
            // stop, seek, disconnect) pudo dejar su señal de stop drenada
            // arriba; el epoch la detecta igualmente.
            if state.interrupt_epoch != epoch {
                None
            } else {
                let voice = state.voice.clone();
                if voice.is_some() {
                    state.playing = true;
                    state.paused = false;
                    state.encoder = Some(encoder.handle());
                    state.position_since = Some(Instant::now());
                }
                voice
            }
        };

        let Some(voice) = voice else {
            encoder.handle().cleanup().await;
            let _ = self.done_tx.try_send(PumpExit::Stopped);
            debug!(
                "🛑 Arranque abortado por una orden concurrente en guild {}",
                self.guild_id
            );
            return Ok(());
        };

        info!("▶️ Iniciando reproducción de: {}", track.title);
        let player = self.clone();
        tokio::spawn(async move {
            player.pump(track, encoder, voice, pending_first).await;
        });

        Ok(())
    }

    /// Elige el origen del encoder: copia local del caché si existe, o la
    /// URL directa de stream (consultando el extractor si nadie la precargó).
    async fn resolve_source(&self, track: &Track) -> Result<EncoderSource, MusicError> {
        if let Some(path) = track.local_path() {
            info!("📦 Usando archivo cacheado: {}", path.display());
            return Ok(EncoderSource::File(path));
        }

        let stream = match track.stream_url() {
            Some(url) => url,
            None => {
                debug!("🔎 Sin stream URL precargada, consultando al extractor");
                let url = self.youtube.get_stream_url(&track.url).await?;
                track.set_stream_url(url.clone());
                url
            }
        };

        info!("📡 Streaming directo desde URL");
        Ok(EncoderSource::Url(stream))
    }

    /// Tarea de reproducción: asienta la voz, bombea frames y deja el
    /// estado limpio al salir por cualquier vía.
    async fn pump(
        self: Arc<Self>,
        track: Arc<Track>,
        mut encoder: Encoder,
        voice: Arc<dyn VoiceTransport>,
        pending_first: Option<Vec<u8>>,
    ) {
        // Da tiempo a que el handshake de voz se estabilice
        tokio::time::sleep(Duration::from_millis(500)).await;

        if let Err(err) = voice.set_speaking(true).await {
            warn!("⚠️ No se pudo señalar speaking=true: {}", err);
        }

        let exit = self
            .pump_frames(&mut encoder, voice.as_ref(), pending_first)
            .await;

        if let Err(err) = voice.set_speaking(false).await {
            debug!("No se pudo señalar speaking=false: {}", err);
        }
        encoder.handle().cleanup().await;

        {
            let mut state = self.state.write();
            state.playing = false;
            state.encoder = None;
            state.position_base = Duration::ZERO;
            state.position_since = None;
        }

        match exit {
            PumpExit::Eos => info!("✅ Pista completada: {}", track.title),
            PumpExit::Stopped => info!("⏹️ Reproducción interrumpida: {}", track.title),
        }
        let _ = self.done_tx.try_send(exit);
    }

    /// Bucle de la bomba: respeta pausa y stop, y entrega los frames al
    /// transporte en orden estricto de producción.
    async fn pump_frames(
        &self,
        encoder: &mut Encoder,
        voice: &dyn VoiceTransport,
        pending_first: Option<Vec<u8>>,
    ) -> PumpExit {
        let mut stop_rx = self.stop_rx.lock().await;
        let mut pending = pending_first;
        let mut frame_count: u64 = 0;

        loop {
            let paused = self.state.read().paused;
            if paused {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            if stop_rx.try_recv().is_ok() {
                return PumpExit::Stopped;
            }

            let frame = match pending.take() {
                Some(frame) => frame,
                None => match encoder.next_frame().await {
                    Some(frame) => frame,
                    None => return PumpExit::Eos,
                },
            };

            // Si el envío y un stop compiten, gana el stop
            tokio::select! {
                biased;
                _ = stop_rx.recv() => {
                    return PumpExit::Stopped;
                }
                sent = voice.send_frame(frame) => {
                    if let Err(err) = sent {
                        warn!("⚠️ Error enviando frame al transporte: {}", err);
                        return PumpExit::Stopped;
                    }
                    frame_count += 1;
                    if frame_count % 1000 == 0 {
                        debug!("🎶 {} frames enviados", frame_count);
                    }
                }
            }
        }
    }

    /// Pausa la reproducción; la bomba se detiene y el encoder acumula
    /// contrapresión en el canal.
    pub fn pause(&self) {
        let mut state = self.state.write();
        if state.playing {
            if let Some(since) = state.position_since.take() {
                state.position_base += since.elapsed();
            }
        }
        state.paused = true;
        state.playing = false;
        info!("⏸️ Reproducción pausada en guild {}", self.guild_id);
    }

    /// Reanuda tras una pausa.
    pub fn resume(&self) {
        let mut state = self.state.write();
        if state.paused {
            state.paused = false;
            state.playing = true;
            state.position_since = Some(Instant::now());
            info!("▶️ Reproducción reanudada en guild {}", self.guild_id);
        }
    }

    /// Comando stop: corta el audio, vacía la cola y desconecta.
    pub async fn stop(&self) {
        self.reset_position();
        self.interrupt_playback().await;
        self.queue.clear_all();
        let _ = self.disconnect_voice().await;
        info!("⏹️ Stop en guild {}", self.guild_id);
    }

    /// Salta la pista actual; devuelve la que sonará después, si la hay.
    pub async fn skip(&self) -> Option<Arc<Track>> {
        let next = self.queue.peek();
        self.reset_position();
        self.interrupt_playback().await;
        info!("⏭️ Skip en guild {}", self.guild_id);
        next
    }

    /// Salta a una posición de la pista actual. Inválido para streams en
    /// vivo y posiciones fuera del rango.
    pub async fn seek(&self, position: Duration) -> Result<(), MusicError> {
        let track = self
            .queue
            .current()
            .ok_or_else(|| MusicError::user("no hay ninguna pista reproduciéndose"))?;

        if track.is_live {
            return Err(MusicError::user(
                "no se puede hacer seek en un stream en vivo",
            ));
        }
        if !track.duration.is_zero() && position > track.duration {
            return Err(MusicError::user("posición fuera del rango de la pista"));
        }

        self.state.write().pending_seek = Some(position);
        self.interrupt_playback().await;
        info!(
            "⏩ Seek a {}s en guild {}",
            position.as_secs(),
            self.guild_id
        );
        Ok(())
    }

    /// Desconecta del canal de voz, deteniendo lo que suene.
    pub async fn disconnect(&self) {
        self.reset_position();
        self.interrupt_playback().await;
        let _ = self.disconnect_voice().await;
    }

    /// Elimina la pista en `index`. Si era la actual, la reproducción se
    /// corta y el scheduler avanza a la siguiente.
    pub async fn remove_track(&self, index: usize) -> Result<Arc<Track>, MusicError> {
        let was_current = self.queue.cursor_position() == Some(index);
        let removed = self
            .queue
            .remove(index)
            .ok_or_else(|| MusicError::user("posición inválida"))?;

        if was_current {
            self.reset_position();
            self.interrupt_playback().await;
        }
        Ok(removed)
    }

    /// Reubica una pista dentro de la cola.
    pub fn move_track(&self, from: usize, to: usize) -> Result<(), MusicError> {
        if self.queue.move_track(from, to) {
            Ok(())
        } else {
            Err(MusicError::user("posiciones inválidas"))
        }
    }

    /// Baraja lo que queda por sonar.
    pub fn shuffle(&self) -> Result<(), MusicError> {
        if self.queue.is_empty() {
            return Err(MusicError::user("la cola está vacía"));
        }
        self.queue.shuffle_upcoming();
        Ok(())
    }

    /// Fija el volumen (0–100); 0 es silencio legal.
    pub fn set_volume(&self, volume: u8) -> Result<(), MusicError> {
        if volume > 100 {
            return Err(MusicError::user("el volumen debe estar entre 0 y 100"));
        }
        self.volume.store(volume, Ordering::Relaxed);
        info!("🔊 Volumen a {}% en guild {}", volume, self.guild_id);
        Ok(())
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    /// Reduce el volumen cuando alguien habla en el canal. Solo actúa si la
    /// reducción está habilitada y hay reproducción en curso.
    pub fn reduce_volume(&self) {
        let mut state = self.state.write();
        if !state.reduce_on_voice || !state.playing {
            return;
        }
        state.original_volume = self.volume.load(Ordering::Relaxed);
        self.volume
            .store(state.reduce_on_voice_target, Ordering::Relaxed);
    }

    /// Restaura el volumen guardado cuando deja de hablar.
    pub fn restore_volume(&self) {
        let state = self.state.read();
        if !state.reduce_on_voice || !state.playing {
            return;
        }
        self.volume.store(state.original_volume, Ordering::Relaxed);
    }

    pub fn set_reduce_on_voice(&self, enabled: bool) {
        self.state.write().reduce_on_voice = enabled;
    }

    pub fn set_reduce_on_voice_target(&self, target: u8) -> Result<(), MusicError> {
        if target > 100 {
            return Err(MusicError::user("el objetivo debe estar entre 0 y 100"));
        }
        self.state.write().reduce_on_voice_target = target;
        Ok(())
    }

    pub fn reduce_on_voice(&self) -> (bool, u8) {
        let state = self.state.read();
        (state.reduce_on_voice, state.reduce_on_voice_target)
    }

    /// Posición estimada dentro de la pista actual (reloj de pared).
    pub fn current_position(&self) -> Duration {
        let state = self.state.read();
        match state.position_since {
            Some(since) => state.position_base + since.elapsed(),
            None => state.position_base,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state.read().playing
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().paused
    }

    pub fn is_loop_running(&self) -> bool {
        self.state.read().loop_running
    }

    pub(crate) fn set_loop_running(&self, running: bool) {
        self.state.write().loop_running = running;
    }

    /// Despierta al scheduler si espera la gracia tras agotar la cola.
    pub(crate) fn notify_enqueue(&self) {
        self.enqueue_notify.notify_waiters();
    }

    pub(crate) async fn wait_enqueue(&self) {
        self.enqueue_notify.notified().await;
    }

    /// Espera a que la bomba actual termine y devuelve cómo terminó.
    pub(crate) async fn wait_for_completion(&self) -> PumpExit {
        let mut done = self.done_rx.lock().await;
        match tokio::time::timeout(MAX_TRACK_WAIT, done.recv()).await {
            Ok(Some(exit)) => exit,
            Ok(None) => PumpExit::Stopped,
            Err(_) => {
                warn!(
                    "⚠️ Tiempo máximo de pista alcanzado en guild {}",
                    self.guild_id
                );
                PumpExit::Stopped
            }
        }
    }

    pub(crate) fn take_pending_seek(&self) -> Option<Duration> {
        self.state.write().pending_seek.take()
    }

    /// Fija el punto de arranque del próximo encoder (tras un seek).
    pub(crate) fn set_start_position(&self, position: Duration) {
        let mut state = self.state.write();
        state.position_base = position;
        state.position_since = None;
    }

    fn reset_position(&self) {
        let mut state = self.state.write();
        state.position_base = Duration::ZERO;
        state.position_since = None;
    }

    /// Corta la reproducción en curso sin tocar la cola: señal de stop más
    /// limpieza del encoder, que desbloquea a la bomba esté donde esté.
    /// El epoch hace que un arranque aún en construcción aborte también.
    async fn interrupt_playback(&self) {
        let encoder = {
            let mut state = self.state.write();
            state.playing = false;
            state.paused = false;
            state.interrupt_epoch += 1;
            state.encoder.take()
        };

        let _ = self.stop_tx.try_send(());
        if let Some(handle) = encoder {
            handle.cleanup().await;
        }
    }

    async fn disconnect_voice(&self) -> Result<(), MusicError> {
        let voice = self.state.write().voice.take();
        match voice {
            Some(voice) => {
                info!("👋 Desconectado del canal de voz en guild {}", self.guild_id);
                voice.disconnect().await
            }
            None => Ok(()),
        }
    }

    /// Vacía señales viejas de stop/done antes de reutilizar los canales.
    async fn drain_signals(&self) {
        let mut stop = self.stop_rx.lock().await;
        while stop.try_recv().is_ok() {}
        drop(stop);

        let mut done = self.done_rx.lock().await;
        while done.try_recv().is_ok() {}
    }
}

/// Registro global de players, uno por guild, creados perezosamente.
pub struct PlayerManager {
    players: DashMap<GuildId, Arc<GuildPlayer>>,
    config: Arc<Config>,
    cache: Arc<AudioCache>,
    resolver: Arc<Resolver>,
    youtube: Arc<YouTubeClient>,
    events: mpsc::UnboundedSender<PlayerEvent>,
}

impl PlayerManager {
    /// Crea el manager y devuelve el receptor de eventos que la capa de
    /// comandos debe drenar.
    pub fn new(
        config: Arc<Config>,
        cache: Arc<AudioCache>,
        resolver: Arc<Resolver>,
        youtube: Arc<YouTubeClient>,
    ) -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                players: DashMap::new(),
                config,
                cache,
                resolver,
                youtube,
                events,
            },
            events_rx,
        )
    }

    /// Obtiene (o crea) el player de una guild.
    pub fn player(&self, guild_id: GuildId) -> Arc<GuildPlayer> {
        self.players
            .entry(guild_id)
            .or_insert_with(|| {
                Arc::new(GuildPlayer::new(
                    guild_id,
                    &self.config,
                    self.youtube.clone(),
                ))
            })
            .clone()
    }

    /// Player existente, sin crear uno nuevo.
    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildPlayer>> {
        self.players.get(&guild_id).map(|p| p.value().clone())
    }

    /// Resuelve la consulta, agrega las pistas a la cola y arranca el bucle
    /// de reproducción si no estaba en marcha. Devuelve lo agregado.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        query: &str,
        requested_by: UserId,
    ) -> Result<Vec<Arc<Track>>, MusicError> {
        let player = self.player(guild_id);

        let resolved = self.resolver.resolve(query).await?;
        if resolved.is_empty() {
            return Err(MusicError::NotFound {
                query: query.to_string(),
            });
        }

        let tracks: Vec<Arc<Track>> = resolved
            .into_iter()
            .map(|mut track| {
                track.requested_by = requested_by;
                Arc::new(track)
            })
            .collect();

        for track in &tracks {
            player.queue.add(track.clone());
        }
        player.notify_enqueue();

        if !player.is_loop_running() {
            player.set_loop_running(true);
            tokio::spawn(crate::audio::scheduler::play_loop(
                player.clone(),
                self.cache.clone(),
                self.youtube.clone(),
                self.events.clone(),
                self.config.wait_after_queue_empty,
            ));
        }

        Ok(tracks)
    }

    /// Detiene y descarta el player de una guild.
    pub async fn remove(&self, guild_id: GuildId) {
        if let Some((_, player)) = self.players.remove(&guild_id) {
            player.stop().await;
        }
    }

    /// Apagado del proceso: detiene todos los players.
    pub async fn shutdown(&self) {
        let players: Vec<Arc<GuildPlayer>> =
            self.players.iter().map(|entry| entry.value().clone()).collect();
        for player in players {
            player.stop().await;
        }
        self.players.clear();
        info!("🛑 Todos los players detenidos");
    }
}
