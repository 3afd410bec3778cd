use std::collections::VecDeque;
use tracing::{debug, info};

use crate::{error::PlaybackError, sources::Track};

/// Cola de tracks pendientes de una sala. No incluye el que está sonando.
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<Track>,
    max_size: usize,
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Agrega un track al final de la cola
    pub fn push_back(&mut self, track: Track) -> Result<(), PlaybackError> {
        self.ensure_room()?;
        info!("➕ Agregado a la cola: {}", track.title());
        self.items.push_back(track);
        Ok(())
    }

    /// Agrega un track para que suene a continuación
    pub fn push_front(&mut self, track: Track) -> Result<(), PlaybackError> {
        self.ensure_room()?;
        info!("⏭️ Agregado como siguiente: {}", track.title());
        self.items.push_front(track);
        Ok(())
    }

    /// Obtiene el siguiente track (FIFO)
    pub fn pop_front(&mut self) -> Option<Track> {
        let next = self.items.pop_front();
        match &next {
            Some(track) => info!("➡️ Siguiente en cola: {}", track.title()),
            None => debug!("📭 Cola vacía, no hay siguiente track"),
        }
        next
    }

    /// Vista ordenada de los próximos `limit` tracks.
    pub fn snapshot(&self, limit: usize) -> Vec<Track> {
        self.items.iter().take(limit).cloned().collect()
    }

    /// Limpia la cola
    pub fn clear(&mut self) -> usize {
        let removed = self.items.len();
        self.items.clear();
        if removed > 0 {
            info!("🗑️ Cola limpiada: {} canciones removidas", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn ensure_room(&self) -> Result<(), PlaybackError> {
        if self.items.len() >= self.max_size {
            return Err(PlaybackError::QueueFull(self.max_size));
        }
        Ok(())
    }
}
