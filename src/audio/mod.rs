//! Núcleo de reproducción: pista, cola, encoder, bomba de frames y
//! scheduler por guild.

pub mod encoder;
pub mod player;
pub mod queue;
pub mod scheduler;
pub mod track;

pub use player::{GuildPlayer, PlayerManager};
pub use queue::Queue;
pub use track::{Track, TrackSource};

use crate::GuildId;

/// Notificaciones fuera de banda hacia la capa de comandos.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// Una pista falló tras agotar el reintento; la cola ya avanzó.
    TrackFailed {
        guild_id: GuildId,
        title: String,
        reason: String,
    },
    /// La cola se agotó y el player se desconectó.
    QueueFinished { guild_id: GuildId },
}
