//! Interfaz con el transporte de voz externo.

use async_trait::async_trait;

use crate::error::MusicError;

/// Conexión de voz cifrada hacia la plataforma de chat.
///
/// El motor no implementa el socket: recibe un handle opaco de la capa de
/// comandos. El transporte consume un frame cada 20 ms; `send_frame` aplica
/// contrapresión bloqueando hasta que haya sitio.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Encola un frame opus en el socket de voz.
    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), MusicError>;

    /// Señala el estado "hablando" antes y después de transmitir.
    async fn set_speaking(&self, speaking: bool) -> Result<(), MusicError>;

    /// Cierra la conexión de voz.
    async fn disconnect(&self) -> Result<(), MusicError>;
}
