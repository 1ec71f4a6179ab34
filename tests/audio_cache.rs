//! Pruebas de integración del caché de audio en disco.

use bardo::cache::{generate_key, AudioCache};
use bardo::MusicError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn key(name: &str) -> String {
    generate_key(&format!("https://media.example/watch?v={name}"))
}

#[tokio::test]
async fn crea_y_reutiliza_una_entrada() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AudioCache::new(dir.path(), 1024 * 1024)?;
    let calls = Arc::new(AtomicUsize::new(0));

    let k = key("abc");
    let calls_a = calls.clone();
    let path = cache
        .get_or_create(&k, |path| async move {
            calls_a.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(&path, b"contenido".to_vec())
                .await
                .map_err(MusicError::Resource)
        })
        .await?;

    assert!(path.exists());
    assert_eq!(path.file_name().unwrap().to_string_lossy(), k);

    // Segunda llamada: hit, el producer no vuelve a correr
    let calls_b = calls.clone();
    let again = cache
        .get_or_create(&k, |path| async move {
            calls_b.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(&path, b"otro".to_vec())
                .await
                .map_err(MusicError::Resource)
        })
        .await?;

    assert_eq!(path, again);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().count, 1);
    Ok(())
}

#[tokio::test]
async fn llamadas_solapadas_comparten_una_sola_descarga() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = Arc::new(AudioCache::new(dir.path(), 1024 * 1024)?);
    let calls = Arc::new(AtomicUsize::new(0));

    let k = key("concurrente");
    let slow_producer = |calls: Arc<AtomicUsize>| {
        move |path: std::path::PathBuf| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(&path, vec![7u8; 64])
                .await
                .map_err(MusicError::Resource)
        }
    };

    let (a, b) = tokio::join!(
        cache.get_or_create(&k, slow_producer(calls.clone())),
        cache.get_or_create(&k, slow_producer(calls.clone())),
    );

    let path_a = a?;
    let path_b = b?;
    assert_eq!(path_a, path_b);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().count, 1);

    // Sin archivos huérfanos: solo la entrada registrada en el directorio
    let files: Vec<_> = std::fs::read_dir(dir.path())?.collect();
    assert_eq!(files.len(), 1);
    Ok(())
}

#[tokio::test]
async fn el_desalojo_lru_respeta_el_limite() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AudioCache::new(dir.path(), 25)?;

    let write10 = |path: std::path::PathBuf| async move {
        tokio::fs::write(&path, vec![1u8; 10])
            .await
            .map_err(MusicError::Resource)
    };

    let path_a = cache.get_or_create(&key("a"), write10).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let path_b = cache.get_or_create(&key("b"), write10).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Tocar "a" la vuelve la más reciente; "b" pasa a ser la víctima LRU
    assert!(cache.get(&key("a")).is_some());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let path_c = cache.get_or_create(&key("c"), write10).await?;

    let stats = cache.stats();
    assert!(stats.used_bytes <= stats.max_bytes);
    assert_eq!(stats.count, 2);
    assert!(path_a.exists());
    assert!(!path_b.exists());
    assert!(path_c.exists());
    Ok(())
}

#[tokio::test]
async fn un_archivo_borrado_a_mano_se_descarta_en_silencio() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AudioCache::new(dir.path(), 1024)?;

    let k = key("fragil");
    let path = cache
        .get_or_create(&k, |path| async move {
            tokio::fs::write(&path, b"x".to_vec())
                .await
                .map_err(MusicError::Resource)
        })
        .await?;

    std::fs::remove_file(&path)?;
    assert!(cache.get(&k).is_none());
    assert_eq!(cache.stats().count, 0);
    Ok(())
}

#[tokio::test]
async fn un_producer_fallido_no_deja_restos() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AudioCache::new(dir.path(), 1024)?;

    let k = key("roto");
    let result = cache
        .get_or_create(&k, |path| async move {
            // Escribe a medias y falla, como una descarga cortada
            tokio::fs::write(&path, b"parcial".to_vec())
                .await
                .map_err(MusicError::Resource)?;
            Err(MusicError::transient("descarga interrumpida"))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(cache.stats().count, 0);
    let files: Vec<_> = std::fs::read_dir(dir.path())?.collect();
    assert!(files.is_empty());

    // La clave queda libre para un intento posterior
    let path = cache
        .get_or_create(&k, |path| async move {
            tokio::fs::write(&path, b"completo".to_vec())
                .await
                .map_err(MusicError::Resource)
        })
        .await?;
    assert!(path.exists());
    Ok(())
}

#[tokio::test]
async fn el_escaneo_inicial_registra_lo_existente() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join(key("uno")), vec![0u8; 30])?;
    std::fs::write(dir.path().join(key("dos")), vec![0u8; 30])?;

    let cache = AudioCache::new(dir.path(), 1024)?;
    let stats = cache.stats();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.used_bytes, 60);
    assert!(cache.get(&key("uno")).is_some());
    Ok(())
}

#[tokio::test]
async fn clear_vacia_entradas_y_archivos() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = AudioCache::new(dir.path(), 1024)?;

    cache
        .get_or_create(&key("x"), |path| async move {
            tokio::fs::write(&path, b"x".to_vec())
                .await
                .map_err(MusicError::Resource)
        })
        .await?;

    cache.clear()?;
    assert_eq!(cache.stats().count, 0);
    let files: Vec<_> = std::fs::read_dir(dir.path())?.collect();
    assert!(files.is_empty());
    Ok(())
}
