use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Configuración del proceso, cargada desde variables de entorno.
#[derive(Debug, Clone)]
pub struct Config {
    // Caché
    pub cache_dir: PathBuf,
    pub cache_limit: u64, // en bytes

    // Reproducción
    pub default_volume: u8,
    pub reduce_on_voice: bool,
    pub reduce_on_voice_target: u8,

    // Comportamiento del bot
    pub register_globally: bool,
    pub wait_after_queue_empty: Duration,

    // Credenciales del catálogo cruzado (opcionales)
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,

    // Debug
    pub debug: bool,
}

impl Config {
    /// Carga la configuración desde el entorno (con soporte .env).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            cache_dir: get_env_or_default("CACHE_DIR", "./cache").into(),
            cache_limit: parse_cache_limit(&get_env_or_default("CACHE_LIMIT", "2GB")),

            default_volume: get_env_int("DEFAULT_VOLUME", 100) as u8,
            reduce_on_voice: get_env_bool("REDUCE_VOL_WHEN_VOICE", false),
            reduce_on_voice_target: get_env_int("REDUCE_VOL_WHEN_VOICE_TARGET", 70) as u8,

            register_globally: get_env_bool("REGISTER_COMMANDS_ON_BOT", false),
            wait_after_queue_empty: Duration::from_secs(
                get_env_int("WAIT_AFTER_QUEUE_EMPTIES", 0) as u64
            ),

            spotify_client_id: std::env::var("SPOTIFY_CLIENT_ID")
                .ok()
                .filter(|s| !s.is_empty()),
            spotify_client_secret: std::env::var("SPOTIFY_CLIENT_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),

            debug: get_env_bool("DEBUG", false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Verifica rangos antes de arrancar el motor.
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 100 {
            anyhow::bail!(
                "DEFAULT_VOLUME debe estar entre 0 y 100, recibido: {}",
                self.default_volume
            );
        }

        if self.reduce_on_voice_target > 100 {
            anyhow::bail!(
                "REDUCE_VOL_WHEN_VOICE_TARGET debe estar entre 0 y 100, recibido: {}",
                self.reduce_on_voice_target
            );
        }

        if self.cache_limit == 0 {
            anyhow::bail!("CACHE_LIMIT debe ser mayor que 0");
        }

        Ok(())
    }

    /// Resumen apto para logs de arranque (sin credenciales).
    pub fn summary(&self) -> String {
        format!(
            "Config:\n  \
            Caché: {} (límite {} MB)\n  \
            Volumen: {}% (reducción por voz: {}, objetivo {}%)\n  \
            Comandos globales: {}, espera tras cola vacía: {}s\n  \
            Spotify: {}",
            self.cache_dir.display(),
            self.cache_limit / (1024 * 1024),
            self.default_volume,
            self.reduce_on_voice,
            self.reduce_on_voice_target,
            self.register_globally,
            self.wait_after_queue_empty.as_secs(),
            if self.spotify_client_id.is_some() {
                "configurado"
            } else {
                "no configurado"
            },
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: "./cache".into(),
            cache_limit: 2 * 1024 * 1024 * 1024,
            default_volume: 100,
            reduce_on_voice: false,
            reduce_on_voice_target: 70,
            register_globally: false,
            wait_after_queue_empty: Duration::ZERO,
            spotify_client_id: None,
            spotify_client_secret: None,
            debug: false,
        }
    }
}

fn get_env_or_default(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn get_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env_int(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Interpreta un límite como "500MB" o "2GB"; sin sufijo son bytes.
fn parse_cache_limit(limit: &str) -> u64 {
    const DEFAULT: u64 = 2 * 1024 * 1024 * 1024;

    let trimmed = limit.trim();
    if trimmed.is_empty() {
        return DEFAULT;
    }

    let upper = trimmed.to_ascii_uppercase();
    let (number, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else {
        (upper.as_str(), 1)
    };

    match number.trim().parse::<u64>() {
        Ok(n) => n * multiplier,
        Err(_) => DEFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_sufijos_de_limite() {
        assert_eq!(parse_cache_limit("2GB"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_cache_limit("500mb"), 500 * 1024 * 1024);
        assert_eq!(parse_cache_limit("64KB"), 64 * 1024);
        assert_eq!(parse_cache_limit("1024"), 1024);
    }

    #[test]
    fn limite_invalido_usa_el_default() {
        assert_eq!(parse_cache_limit("muchos"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_cache_limit(""), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn validacion_rechaza_volumen_fuera_de_rango() {
        let config = Config {
            default_volume: 150,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
