use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;

use super::track::Track;

/// Cola ordenada de una guild, con cursor sobre la pista actual.
///
/// El cursor vale −1 cuando no hay pista actual; en cualquier otro caso es
/// un índice válido. `advance` con el flag de loop re-selecciona el cursor
/// en vez de moverlo.
pub struct Queue {
    inner: RwLock<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    tracks: Vec<Arc<Track>>,
    cursor: i64,
    loop_enabled: bool,
}

impl QueueInner {
    /// Un paso de cursor, sin mirar el flag de loop. Al agotarse vuelve a
    /// −1 para que nuevas pistas puedan retomarse.
    fn step(&mut self) -> Option<Arc<Track>> {
        if self.tracks.is_empty() {
            self.cursor = -1;
            return None;
        }

        self.cursor += 1;
        if self.cursor as usize >= self.tracks.len() {
            self.cursor = -1;
            return None;
        }

        Some(self.tracks[self.cursor as usize].clone())
    }
}

impl Queue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(QueueInner {
                tracks: Vec::new(),
                cursor: -1,
                loop_enabled: false,
            }),
        }
    }

    /// Agrega una pista al final.
    pub fn add(&self, track: Arc<Track>) {
        let mut inner = self.inner.write();
        debug!("➕ Agregada a la cola: {}", track.title);
        inner.tracks.push(track);
    }

    /// Avanza el cursor y devuelve la nueva pista actual.
    ///
    /// Con loop activo se queda en la pista actual.
    pub fn advance(&self) -> Option<Arc<Track>> {
        let mut inner = self.inner.write();

        if inner.loop_enabled && inner.cursor >= 0 && (inner.cursor as usize) < inner.tracks.len() {
            return Some(inner.tracks[inner.cursor as usize].clone());
        }

        inner.step()
    }

    /// Avanza ignorando el flag de loop: una pista fallida o saltada no
    /// debe re-seleccionarse aunque la repetición esté activa.
    pub fn force_advance(&self) -> Option<Arc<Track>> {
        self.inner.write().step()
    }

    /// Pista actual, o `None` si el cursor está en −1.
    pub fn current(&self) -> Option<Arc<Track>> {
        let inner = self.inner.read();
        if inner.cursor < 0 || inner.cursor as usize >= inner.tracks.len() {
            return None;
        }
        Some(inner.tracks[inner.cursor as usize].clone())
    }

    /// Siguiente pista sin avanzar el cursor.
    pub fn peek(&self) -> Option<Arc<Track>> {
        let inner = self.inner.read();
        let next = inner.cursor + 1;
        if next < 0 || next as usize >= inner.tracks.len() {
            return None;
        }
        Some(inner.tracks[next as usize].clone())
    }

    /// Conserva solo la pista actual; descarta lo próximo.
    pub fn clear_upcoming(&self) {
        let mut inner = self.inner.write();
        if inner.cursor >= 0 && (inner.cursor as usize) < inner.tracks.len() {
            let current = inner.tracks[inner.cursor as usize].clone();
            inner.tracks = vec![current];
            inner.cursor = 0;
        } else {
            inner.tracks.clear();
            inner.cursor = -1;
        }
    }

    /// Vacía la cola por completo, incluida la pista actual.
    pub fn clear_all(&self) {
        let mut inner = self.inner.write();
        inner.tracks.clear();
        inner.cursor = -1;
    }

    /// Elimina la pista en `index`, ajustando el cursor para que la pista
    /// actual conserve su identidad. Devuelve la pista eliminada.
    pub fn remove(&self, index: usize) -> Option<Arc<Track>> {
        let mut inner = self.inner.write();
        if index >= inner.tracks.len() {
            return None;
        }

        let removed = inner.tracks.remove(index);
        if inner.cursor >= index as i64 {
            inner.cursor -= 1;
        }
        Some(removed)
    }

    /// Mueve una pista de `from` a `to`; la pista actual sigue siendo la
    /// misma aunque sus índices cambien.
    pub fn move_track(&self, from: usize, to: usize) -> bool {
        let mut inner = self.inner.write();
        let len = inner.tracks.len();
        if from >= len || to >= len {
            return false;
        }
        if from == to {
            return true;
        }

        let track = inner.tracks.remove(from);
        inner.tracks.insert(to, track);

        let from = from as i64;
        let to = to as i64;
        if inner.cursor == from {
            inner.cursor = to;
        } else if from < inner.cursor && to >= inner.cursor {
            inner.cursor -= 1;
        } else if from > inner.cursor && to <= inner.cursor {
            inner.cursor += 1;
        }

        true
    }

    /// Baraja lo que viene después del cursor; la pista actual no se mueve.
    pub fn shuffle_upcoming(&self) {
        let mut inner = self.inner.write();
        let start = (inner.cursor + 1).max(0) as usize;
        if start < inner.tracks.len() {
            let mut rng = rand::thread_rng();
            inner.tracks[start..].shuffle(&mut rng);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().tracks.is_empty()
    }

    /// Índice de la pista actual, si existe.
    pub fn cursor_position(&self) -> Option<usize> {
        let inner = self.inner.read();
        if inner.cursor < 0 || inner.cursor as usize >= inner.tracks.len() {
            None
        } else {
            Some(inner.cursor as usize)
        }
    }

    /// Copia del contenido para mostrar la cola.
    pub fn snapshot(&self) -> Vec<Arc<Track>> {
        self.inner.read().tracks.clone()
    }

    pub fn is_loop(&self) -> bool {
        self.inner.read().loop_enabled
    }

    pub fn set_loop(&self, enabled: bool) {
        self.inner.write().loop_enabled = enabled;
    }

    pub fn toggle_loop(&self) -> bool {
        let mut inner = self.inner.write();
        inner.loop_enabled = !inner.loop_enabled;
        inner.loop_enabled
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::TrackSource;
    use std::time::Duration;

    fn track(title: &str) -> Arc<Track> {
        Arc::new(Track::new(
            title.to_lowercase(),
            title.to_string(),
            "Artista".into(),
            format!("https://media.example/watch?v={title}"),
            Duration::from_secs(180),
            TrackSource::YouTube,
            String::new(),
            false,
        ))
    }

    fn queue_of(titles: &[&str]) -> Queue {
        let q = Queue::new();
        for t in titles {
            q.add(track(t));
        }
        q
    }

    #[test]
    fn cola_vacia_no_tiene_actual() {
        let q = Queue::new();
        assert!(q.current().is_none());
        assert!(q.peek().is_none());
        assert!(q.advance().is_none());
        assert_eq!(q.cursor_position(), None);
    }

    #[test]
    fn advance_recorre_en_orden_y_reinicia() {
        let q = queue_of(&["A", "B"]);

        assert_eq!(q.advance().unwrap().title, "A");
        assert_eq!(q.current().unwrap().title, "A");
        assert_eq!(q.peek().unwrap().title, "B");

        assert_eq!(q.advance().unwrap().title, "B");
        assert!(q.advance().is_none());

        // Cursor de vuelta en −1: una nueva pista se puede retomar
        assert!(q.current().is_none());
        q.add(track("C"));
        assert_eq!(q.advance().unwrap().title, "C");
    }

    #[test]
    fn loop_reselecciona_la_pista_actual() {
        let q = queue_of(&["A", "B"]);
        q.set_loop(true);

        assert_eq!(q.advance().unwrap().title, "A");
        assert_eq!(q.advance().unwrap().title, "A");
        assert_eq!(q.advance().unwrap().title, "A");

        q.set_loop(false);
        assert_eq!(q.advance().unwrap().title, "B");
    }

    #[test]
    fn force_advance_ignora_el_loop() {
        let q = queue_of(&["A", "B"]);
        q.set_loop(true);

        assert_eq!(q.advance().unwrap().title, "A");
        assert_eq!(q.advance().unwrap().title, "A");

        // Una pista fallida o saltada no se re-selecciona
        assert_eq!(q.force_advance().unwrap().title, "B");
        assert!(q.force_advance().is_none());
        assert!(q.current().is_none());
    }

    #[test]
    fn remove_antes_del_cursor_lo_decrementa() {
        let q = queue_of(&["A", "B", "C"]);
        q.advance();
        q.advance(); // actual = B (índice 1)

        assert!(q.remove(0).is_some());
        assert_eq!(q.current().unwrap().title, "B");
        assert_eq!(q.cursor_position(), Some(0));
        assert_eq!(q.peek().unwrap().title, "C");
    }

    #[test]
    fn remove_de_la_actual_deja_la_siguiente_como_peek() {
        let q = queue_of(&["A", "B", "C"]);
        q.advance(); // actual = A

        assert_eq!(q.remove(0).unwrap().title, "A");
        // El cursor retrocede; advance retoma en la antigua siguiente
        assert_eq!(q.advance().unwrap().title, "B");
    }

    #[test]
    fn remove_fuera_de_rango_devuelve_none() {
        let q = queue_of(&["A"]);
        assert!(q.remove(5).is_none());
    }

    #[test]
    fn move_conserva_la_identidad_de_la_actual() {
        let q = queue_of(&["A", "B", "C", "D"]);
        q.advance();
        q.advance(); // actual = B

        // Mover la actual
        assert!(q.move_track(1, 3));
        assert_eq!(q.current().unwrap().title, "B");

        // Mover otra por encima del cursor
        assert!(q.move_track(0, 3));
        assert_eq!(q.current().unwrap().title, "B");

        // Mover de después a antes del cursor
        let pos = q.cursor_position().unwrap();
        assert!(q.move_track(pos + 1, 0));
        assert_eq!(q.current().unwrap().title, "B");
    }

    #[test]
    fn move_invalido_devuelve_false() {
        let q = queue_of(&["A", "B"]);
        assert!(!q.move_track(0, 7));
        assert!(!q.move_track(9, 0));
    }

    #[test]
    fn shuffle_no_mueve_la_actual_ni_lo_ya_sonado() {
        let q = queue_of(&["A", "B", "C", "D", "E"]);
        q.advance();
        q.advance(); // actual = B

        for _ in 0..20 {
            q.shuffle_upcoming();
            let snapshot = q.snapshot();
            assert_eq!(snapshot[0].title, "A");
            assert_eq!(q.current().unwrap().title, "B");
            assert_eq!(q.len(), 5);
        }
    }

    #[test]
    fn shuffle_con_una_pista_es_noop() {
        let q = queue_of(&["A"]);
        q.shuffle_upcoming();
        assert_eq!(q.snapshot()[0].title, "A");
    }

    #[test]
    fn clear_upcoming_conserva_solo_la_actual() {
        let q = queue_of(&["A", "B", "C"]);
        q.advance(); // actual = A

        q.clear_upcoming();
        assert_eq!(q.len(), 1);
        assert_eq!(q.current().unwrap().title, "A");
        assert!(q.peek().is_none());
    }

    #[test]
    fn clear_upcoming_sin_actual_vacia_todo() {
        let q = queue_of(&["A", "B"]);
        q.clear_upcoming();
        assert!(q.is_empty());
        assert_eq!(q.cursor_position(), None);
    }

    #[test]
    fn clear_all_reinicia_el_cursor() {
        let q = queue_of(&["A", "B"]);
        q.advance();

        q.clear_all();
        assert!(q.is_empty());
        assert!(q.current().is_none());
        assert_eq!(q.cursor_position(), None);
    }
}
