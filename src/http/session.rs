//! Lifecycle of the shared transport handle.

use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::transport::{Transport, TransportFactory};
use crate::error::TransportError;

/// A transport plus the generation that identifies it.
#[derive(Clone)]
pub struct TransportHandle {
    pub transport: Arc<dyn Transport>,
    pub generation: u64,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Constructs the transport on first use and swaps it out atomically when
/// it turns out to be unusable. Only the session manager replaces it.
pub struct SessionManager {
    factory: Arc<dyn TransportFactory>,
    current: RwLock<Option<TransportHandle>>,
    generations: AtomicU64,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            current: RwLock::new(None),
            generations: AtomicU64::new(0),
        }
    }

    /// Returns the live handle, creating it if none exists yet.
    pub fn get_client(&self) -> Result<TransportHandle, TransportError> {
        if let Some(handle) = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(handle.clone());
        }

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = current.as_ref() {
            return Ok(handle.clone());
        }
        let handle = self.build()?;
        debug!("Created transport generation {}", handle.generation);
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Replaces `stale` with a fresh transport. If another caller already
    /// replaced it, the newer handle is returned instead of building again.
    pub fn replace(&self, stale: &TransportHandle) -> Result<TransportHandle, TransportError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = current.as_ref() {
            if handle.generation != stale.generation {
                debug!(
                    "Transport generation {} already replaced by {}",
                    stale.generation, handle.generation
                );
                return Ok(handle.clone());
            }
        }

        let handle = self.build()?;
        warn!(
            "Replaced torn-down transport generation {} with {}",
            stale.generation, handle.generation
        );
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Number of transports built so far.
    pub fn generation(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }

    fn build(&self) -> Result<TransportHandle, TransportError> {
        let transport = self.factory.create()?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TransportHandle {
            transport,
            generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transport::{MockTransport, MockTransportFactory};

    fn factory_expecting(times: usize) -> MockTransportFactory {
        let mut factory = MockTransportFactory::new();
        factory
            .expect_create()
            .times(times)
            .returning(|| Ok(Arc::new(MockTransport::new()) as Arc<dyn Transport>));
        factory
    }

    #[test]
    fn test_get_client_is_lazy_and_cached() {
        let session = SessionManager::new(Arc::new(factory_expecting(1)));
        assert_eq!(session.generation(), 0);

        let first = session.get_client().unwrap();
        let second = session.get_client().unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 1);
        assert!(Arc::ptr_eq(&first.transport, &second.transport));
    }

    #[test]
    fn test_replace_builds_new_handle() {
        let session = SessionManager::new(Arc::new(factory_expecting(2)));
        let stale = session.get_client().unwrap();
        let fresh = session.replace(&stale).unwrap();

        assert_eq!(fresh.generation, 2);
        assert_eq!(session.get_client().unwrap().generation, 2);
    }

    #[test]
    fn test_concurrent_replacements_of_same_handle_coalesce() {
        let session = SessionManager::new(Arc::new(factory_expecting(2)));
        let stale = session.get_client().unwrap();

        let a = session.replace(&stale).unwrap();
        let b = session.replace(&stale).unwrap();
        assert_eq!(a.generation, 2);
        assert_eq!(b.generation, 2);
    }

    #[test]
    fn test_factory_failure_leaves_no_half_built_handle() {
        let mut factory = MockTransportFactory::new();
        let mut calls = 0;
        factory.expect_create().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Err(TransportError::Other("tls init failed".into()))
            } else {
                Ok(Arc::new(MockTransport::new()) as Arc<dyn Transport>)
            }
        });
        let session = SessionManager::new(Arc::new(factory));

        assert!(session.get_client().is_err());
        assert_eq!(session.get_client().unwrap().generation, 1);
    }
}
