//! Motor de reproducción de audio por guild.
//!
//! Cada guild posee su propia cola, su bucle de reproducción y su pipeline
//! de transcodificación; el caché de audio y los clientes de catálogo se
//! comparten a nivel de proceso. El transporte de voz y la capa de comandos
//! son colaboradores externos: ver [`voice::VoiceTransport`] y
//! [`audio::PlayerEvent`].

use std::fmt;

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod util;
pub mod voice;

pub use audio::{GuildPlayer, PlayerEvent, PlayerManager};
pub use cache::AudioCache;
pub use config::Config;
pub use error::MusicError;
pub use sources::Resolver;

/// Identificador de guild (snowflake de la plataforma de chat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuildId(pub u64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identificador de usuario que solicitó una pista.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Inicializa el subscriber de tracing para binarios que embeben el motor.
pub fn init_logging(debug: bool) {
    let directive = if debug { "bardo=debug" } else { "bardo=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("directiva de log válida")),
        )
        .init();
}
