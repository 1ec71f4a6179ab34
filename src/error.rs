//! Taxonomía de errores del motor.
//!
//! La capa de comandos decide cómo presentar cada variante: los errores de
//! usuario se devuelven tal cual, los transitorios habilitan el reintento
//! del scheduler y los fatales generan el aviso "track failed".

use thiserror::Error;

/// Error tipado del motor de reproducción.
#[derive(Debug, Error)]
pub enum MusicError {
    /// Precondición que el usuario puede corregir (volumen fuera de rango,
    /// posición inválida, consulta vacía).
    #[error("{0}")]
    User(String),

    /// La búsqueda o el catálogo no devolvieron resultados.
    #[error("no se encontraron pistas para: {query}")]
    NotFound { query: String },

    /// Fallo de medios que un reintento puede resolver (URL de stream
    /// caducada, corte de red).
    #[error("fallo transitorio de medios: {reason}")]
    TransientMedia { reason: String },

    /// La pista no es reproducible, incluso tras reintentar.
    #[error("pista no reproducible: {reason}")]
    FatalMedia { reason: String },

    /// E/S de disco o fallo al lanzar un subproceso.
    #[error("error de recursos: {0}")]
    Resource(#[from] std::io::Error),

    /// Un plazo expiró.
    #[error("tiempo agotado tras {seconds}s en {operation}")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    /// Invariante violado; se registra y se muestra como fallo genérico.
    #[error("error interno: {0}")]
    Internal(String),
}

impl MusicError {
    pub fn user(msg: impl Into<String>) -> Self {
        Self::User(msg.into())
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientMedia {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalMedia {
            reason: reason.into(),
        }
    }

    /// Indica si el scheduler puede consumir su único reintento con esto.
    /// Los timeouts de red son transitorios; el arranque del transcoder no.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientMedia { .. } => true,
            Self::Timeout { operation, .. } => *operation != "transcoder",
            _ => false,
        }
    }

    /// Mensaje apto para mostrar al usuario sin detalles internos.
    pub fn user_message(&self) -> String {
        match self {
            Self::User(msg) => msg.clone(),
            Self::NotFound { query } => format!("no se encontró nada para `{query}`"),
            Self::Internal(_) => "algo salió mal, intenta de nuevo".to_string(),
            other => other.to_string(),
        }
    }
}
