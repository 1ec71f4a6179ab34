//! Caché de audio en disco, direccionado por contenido.
//!
//! Una carpeta plana donde el nombre de archivo es la clave: el listado del
//! directorio *es* el índice. Las descargas caras se deduplican con
//! single-flight y el tamaño total se mantiene bajo el límite configurado
//! mediante desalojo LRU.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

use crate::error::MusicError;

/// Entrada registrada: un archivo en disco con su tamaño y último acceso.
#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size: u64,
    last_access: SystemTime,
}

/// Estadísticas del caché.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub count: usize,
    pub used_bytes: u64,
    pub max_bytes: u64,
}

/// Caché de contenedores de audio compartido entre todos los players.
pub struct AudioCache {
    dir: PathBuf,
    max_size: u64,
    entries: Mutex<HashMap<String, CacheEntry>>,
    // Una puerta por clave para que dos descargas del mismo contenido no
    // corran en paralelo.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AudioCache {
    /// Abre (o crea) el directorio de caché y registra lo que ya exista.
    pub fn new(dir: impl Into<PathBuf>, max_size: u64) -> Result<Self, MusicError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let cache = Self {
            dir,
            max_size,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        };
        cache.scan_existing()?;
        Ok(cache)
    }

    /// Reconstruye el índice desde el listado del directorio. Los archivos
    /// ilegibles se omiten.
    fn scan_existing(&self) -> Result<(), MusicError> {
        let mut entries = self.entries.lock();
        let mut total: u64 = 0;

        for item in std::fs::read_dir(&self.dir)? {
            let item = match item {
                Ok(i) => i,
                Err(_) => continue,
            };
            let meta = match item.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };

            let key = item.file_name().to_string_lossy().into_owned();

            // Restos provisionales de una ejecución interrumpida
            if key.ends_with(".part") {
                let _ = std::fs::remove_file(item.path());
                continue;
            }

            total += meta.len();
            entries.insert(
                key,
                CacheEntry {
                    path: item.path(),
                    size: meta.len(),
                    last_access: meta.modified().unwrap_or_else(|_| SystemTime::now()),
                },
            );
        }

        if total > self.max_size {
            let over = total - self.max_size;
            Self::evict_locked(&mut entries, over, None);
        }

        if !entries.is_empty() {
            info!("📦 Caché cargado: {} archivos", entries.len());
        }
        Ok(())
    }

    /// Devuelve la ruta cacheada si existe, tocando su último acceso.
    /// Si el archivo desapareció del disco, la entrada se descarta.
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;

        if !entry.path.exists() {
            debug!("🗑️ Entrada de caché sin archivo, descartada: {}", key);
            entries.remove(key);
            return None;
        }

        entry.last_access = SystemTime::now();
        Some(entry.path.clone())
    }

    /// Devuelve la ruta cacheada o ejecuta `producer` para crearla.
    ///
    /// El producer escribe en una ruta reservada temporal sin que se
    /// sostenga el lock; el registro posterior renombra al destino final.
    /// Llamadas solapadas sobre la misma clave comparten una sola descarga.
    pub async fn get_or_create<F, Fut>(&self, key: &str, producer: F) -> Result<PathBuf, MusicError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), MusicError>>,
    {
        if let Some(path) = self.get(key) {
            return Ok(path);
        }

        let gate = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // El ganador pudo registrar mientras esperábamos la puerta.
        if let Some(path) = self.get(key) {
            self.inflight.lock().remove(key);
            return Ok(path);
        }

        let dest = self.dir.join(key);
        let staging = self.dir.join(format!("{key}.part"));

        let produced = producer(staging.clone()).await;
        if let Err(err) = produced {
            let _ = tokio::fs::remove_file(&staging).await;
            self.inflight.lock().remove(key);
            return Err(err);
        }

        let size = match tokio::fs::metadata(&staging).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                let _ = tokio::fs::remove_file(&staging).await;
                self.inflight.lock().remove(key);
                return Err(err.into());
            }
        };

        if size > self.max_size {
            let _ = tokio::fs::remove_file(&staging).await;
            self.inflight.lock().remove(key);
            return Err(MusicError::Resource(std::io::Error::other(format!(
                "el archivo ({size} bytes) excede el límite del caché"
            ))));
        }

        let result = {
            let mut entries = self.entries.lock();

            if let Some(existing) = entries.get(key) {
                // Alguien más registró la clave: preferimos al ganador y
                // descartamos nuestro archivo provisional.
                let winner = existing.path.clone();
                drop(entries);
                let _ = std::fs::remove_file(&staging);
                winner
            } else {
                // Hacer sitio antes de registrar; la entrada entrante nunca
                // es candidata a desalojo.
                let used: u64 = entries.values().map(|e| e.size).sum();
                if used + size > self.max_size {
                    Self::evict_locked(&mut entries, used + size - self.max_size, Some(key));
                }

                if let Err(err) = std::fs::rename(&staging, &dest) {
                    drop(entries);
                    let _ = std::fs::remove_file(&staging);
                    self.inflight.lock().remove(key);
                    return Err(err.into());
                }
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        path: dest.clone(),
                        size,
                        last_access: SystemTime::now(),
                    },
                );
                dest
            }
        };

        self.inflight.lock().remove(key);
        Ok(result)
    }

    /// Desaloja entradas en orden LRU hasta liberar `needed` bytes.
    /// `protect` nunca se desaloja.
    fn evict_locked(entries: &mut HashMap<String, CacheEntry>, needed: u64, protect: Option<&str>) {
        let mut candidates: Vec<(String, SystemTime, u64)> = entries
            .iter()
            .filter(|(key, _)| protect != Some(key.as_str()))
            .map(|(key, entry)| (key.clone(), entry.last_access, entry.size))
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);

        let mut freed: u64 = 0;
        for (key, _, size) in candidates {
            if freed >= needed {
                break;
            }
            if let Some(entry) = entries.remove(&key) {
                let _ = std::fs::remove_file(&entry.path);
                freed += size;
                debug!("🗑️ Desalojado del caché: {}", key);
            }
        }
    }

    /// Elimina todas las entradas y sus archivos.
    pub fn clear(&self) -> Result<(), MusicError> {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            let _ = std::fs::remove_file(&entry.path);
        }
        info!("🗑️ Caché vaciado");
        Ok(())
    }

    /// Conteo, bytes usados y límite configurado.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            count: entries.len(),
            used_bytes: entries.values().map(|e| e.size).sum(),
            max_bytes: self.max_size,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Deriva la clave de caché de la URL canónica de una pista: los primeros
/// 16 bytes del SHA-256 en hex minúsculo, con la extensión del contenedor.
pub fn generate_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut hex = String::with_capacity(37);
    for byte in &digest[..16] {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{hex}.webm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn la_clave_es_estable_entre_procesos() {
        // Vector fijo: SHA-256("https://media.example/watch?v=abc")[..16]
        assert_eq!(
            generate_key("https://media.example/watch?v=abc"),
            "f200a7828c84b490dd6f672acc9a1890.webm"
        );
        assert_eq!(
            generate_key("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            "0424974c68530290458c8d58674e2637.webm"
        );
    }

    #[test]
    fn claves_distintas_para_urls_distintas() {
        assert_ne!(generate_key("a"), generate_key("b"));
        assert_eq!(generate_key("a"), generate_key("a"));
    }
}
