use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

use crate::error::ResolutionError;

/// Búsqueda en curso compartida entre todos los que piden la misma clave.
pub type SharedLookup<V> = Shared<BoxFuture<'static, Result<V, ResolutionError>>>;

/// Una entrada es o una búsqueda pendiente o un valor con vencimiento, nunca ambos.
enum Slot<V> {
    Pending {
        generation: u64,
        lookup: SharedLookup<V>,
    },
    Resolved {
        value: V,
        expires_at: Instant,
    },
}

impl<V> Slot<V> {
    fn is_generation(&self, wanted: u64) -> bool {
        matches!(self, Slot::Pending { generation, .. } if *generation == wanted)
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Slot::Resolved { expires_at, .. } if now >= *expires_at)
    }
}

/// Resultado de [`TtlCache::get`].
pub enum CacheLookup<V> {
    Ready(V),
    Pending(SharedLookup<V>),
    Absent,
}

impl<V> std::fmt::Debug for CacheLookup<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheLookup::Ready(_) => f.write_str("Ready"),
            CacheLookup::Pending(_) => f.write_str("Pending"),
            CacheLookup::Absent => f.write_str("Absent"),
        }
    }
}

/// Cache con TTL y deduplicación de búsquedas en vuelo.
///
/// Los fallos nunca se guardan: la entrada se elimina y el siguiente
/// pedido vuelve a consultar la fuente.
pub struct TtlCache<V> {
    entries: Arc<DashMap<String, Slot<V>>>,
    generations: Arc<AtomicU64>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Consulta sin efectos salvo la eliminación perezosa de entradas vencidas.
    pub fn get(&self, key: &str) -> CacheLookup<V> {
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            None => return CacheLookup::Absent,
            Some(slot) => match &*slot {
                Slot::Pending { lookup, .. } => return CacheLookup::Pending(lookup.clone()),
                Slot::Resolved { value, expires_at } if now < *expires_at => {
                    return CacheLookup::Ready(value.clone())
                }
                Slot::Resolved { .. } => true,
            },
        };

        if expired {
            self.entries.remove_if(key, |_, slot| slot.is_expired(now));
            debug!("⏰ Entrada vencida removida: {}", key);
        }

        CacheLookup::Absent
    }

    /// Registra una búsqueda en vuelo. Quien la registra es responsable de
    /// llamar a [`set_resolved`](Self::set_resolved) o
    /// [`mark_failed`](Self::mark_failed) al terminar.
    pub fn set_pending<Fut>(&self, key: &str, lookup: Fut) -> SharedLookup<V>
    where
        Fut: Future<Output = Result<V, ResolutionError>> + Send + 'static,
    {
        let generation = self.next_generation();
        let lookup = lookup.boxed().shared();
        self.entries.insert(
            key.to_string(),
            Slot::Pending {
                generation,
                lookup: lookup.clone(),
            },
        );
        lookup
    }

    /// Reemplaza lo que haya bajo `key` por un valor que vence en `ttl`.
    pub fn set_resolved(&self, key: &str, value: V, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Slot::Resolved {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Elimina la entrada; el próximo pedido reintenta.
    pub fn mark_failed(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Devuelve el valor vigente, se une a la búsqueda en vuelo, o arranca
    /// una nueva con `fetch`. La búsqueda nueva corre en una tarea propia y
    /// actualiza la entrada al terminar, aunque todos los que esperaban se
    /// hayan cancelado.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<V, ResolutionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ResolutionError>> + Send + 'static,
    {
        let lookup = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let joined = match occupied.get() {
                    Slot::Resolved { value, expires_at } if Instant::now() < *expires_at => {
                        debug!("✅ Cache hit: {}", key);
                        return Ok(value.clone());
                    }
                    Slot::Pending { lookup, .. } => Some(lookup.clone()),
                    Slot::Resolved { .. } => None,
                };

                match joined {
                    Some(lookup) => {
                        debug!("🔗 Uniéndose a búsqueda en curso: {}", key);
                        lookup
                    }
                    None => {
                        debug!("⏰ Entrada vencida, buscando de nuevo: {}", key);
                        let (generation, lookup) = self.self_completing(key, ttl, fetch());
                        occupied.insert(Slot::Pending {
                            generation,
                            lookup: lookup.clone(),
                        });
                        lookup
                    }
                }
            }
            Entry::Vacant(vacant) => {
                debug!("❌ Cache miss: {}", key);
                let (generation, lookup) = self.self_completing(key, ttl, fetch());
                vacant.insert(Slot::Pending {
                    generation,
                    lookup: lookup.clone(),
                });
                lookup
            }
        };

        lookup.await
    }

    /// Elimina todas las entradas vencidas y retorna cuántas se removieron.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed)
    }

    fn self_completing<Fut>(&self, key: &str, ttl: Duration, fetch: Fut) -> (u64, SharedLookup<V>)
    where
        Fut: Future<Output = Result<V, ResolutionError>> + Send + 'static,
    {
        let generation = self.next_generation();
        let entries = Arc::clone(&self.entries);
        let key = key.to_string();

        // La búsqueda corre en su propia tarea: termina aunque nadie la espere
        let task = tokio::spawn(async move {
            let result = fetch.await;

            // Solo tocar la entrada si sigue siendo nuestra búsqueda
            match &result {
                Ok(value) => {
                    if let Some(mut slot) = entries.get_mut(&key) {
                        if slot.is_generation(generation) {
                            *slot = Slot::Resolved {
                                value: value.clone(),
                                expires_at: Instant::now() + ttl,
                            };
                        }
                    }
                }
                Err(e) => {
                    debug!("🚫 Búsqueda fallida para {}: {}", key, e);
                    entries.remove_if(&key, |_, slot| slot.is_generation(generation));
                }
            }

            result
        });

        let lookup = task
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(ResolutionError::Aborted(e.to_string())),
            })
            .boxed()
            .shared();

        (generation, lookup)
    }
}

impl<V> Default for TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            generations: self.generations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TTL: Duration = Duration::from_secs(60);

    fn counting_fetch(
        counter: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl Future<Output = Result<String, ResolutionError>> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(value.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_lookup_within_ttl_is_served_from_cache() {
        let cache = TtlCache::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_fetch("k", TTL, || counting_fetch(&calls, "v"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        let second = cache
            .get_or_fetch("k", TTL, || counting_fetch(&calls, "otro"))
            .await
            .unwrap();

        assert_eq!(first, "v");
        assert_eq!(second, "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_triggers_fresh_lookup() {
        let cache = TtlCache::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_fetch("k", TTL, || counting_fetch(&calls, "viejo"))
            .await
            .unwrap();
        tokio::time::advance(TTL + Duration::from_secs(1)).await;

        assert!(matches!(cache.get("k"), CacheLookup::Absent));
        assert_eq!(cache.len(), 0);

        let fresh = cache
            .get_or_fetch("k", TTL, || counting_fetch(&calls, "nuevo"))
            .await
            .unwrap();
        assert_eq!(fresh, "nuevo");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_lookups_share_one_fetch() {
        let cache = TtlCache::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.get_or_fetch("k", TTL, || counting_fetch(&calls, "uno")),
            cache.get_or_fetch("k", TTL, || counting_fetch(&calls, "dos")),
        );

        assert_eq!(a.unwrap(), "uno");
        assert_eq!(b.unwrap(), "uno");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let cache = TtlCache::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = {
            let calls = calls.clone();
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResolutionError::EmptyOutput {
                    tool: "yt-dlp".into(),
                })
            }
        };
        assert!(cache.get_or_fetch("k", TTL, failing).await.is_err());
        assert!(matches!(cache.get("k"), CacheLookup::Absent));

        let ok = cache
            .get_or_fetch("k", TTL, || counting_fetch(&calls, "v"))
            .await;
        assert_eq!(ok.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_completes_after_its_only_waiter_is_cancelled() {
        let cache = TtlCache::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            cache.get_or_fetch("k", TTL, || counting_fetch(&calls, "v")),
        )
        .await;
        assert!(waited.is_err());
        assert!(matches!(cache.get("k"), CacheLookup::Pending(_)));

        tokio::time::sleep(Duration::from_millis(500)).await;

        match cache.get("k") {
            CacheLookup::Ready(v) => assert_eq!(v, "v"),
            other => panic!("se esperaba Ready, se obtuvo {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_is_removed_without_waiters() {
        let cache = TtlCache::<String>::new();

        let failing = || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(ResolutionError::EmptyOutput {
                tool: "yt-dlp".into(),
            })
        };
        let waited =
            tokio::time::timeout(Duration::from_millis(20), cache.get_or_fetch("k", TTL, failing))
                .await;
        assert!(waited.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(cache.get("k"), CacheLookup::Absent));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_pending_then_resolved() {
        let cache = TtlCache::<String>::new();

        let shared = cache.set_pending("k", async { Ok("v".to_string()) });
        assert!(matches!(cache.get("k"), CacheLookup::Pending(_)));

        let value = shared.await.unwrap();
        cache.set_resolved("k", value, TTL);
        match cache.get("k") {
            CacheLookup::Ready(v) => assert_eq!(v, "v"),
            other => panic!("se esperaba Ready, se obtuvo {other:?}"),
        }

        cache.mark_failed("k");
        assert!(matches!(cache.get("k"), CacheLookup::Absent));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired_entries() {
        let cache = TtlCache::<String>::new();
        cache.set_resolved("corto", "a".into(), Duration::from_secs(1));
        cache.set_resolved("largo", "b".into(), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert!(matches!(cache.get("largo"), CacheLookup::Ready(_)));
    }
}
