//! The process-wide shared transport.
//!
//! Every device session talks through one [`Link`]. The manager opens it on
//! the first [`TransportManager::acquire`] and closes it when the last
//! reference is released; the next acquire opens a fresh one.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::errors::Error;
use crate::link::Link;
use crate::runtime::{BoxFuture, Mutex};
use crate::udp::UdpLink;

type Result<T> = std::result::Result<T, Error>;

/// Opens a new link. Called at most once per open/close cycle.
pub type LinkOpener = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Link>>> + Send + Sync>;

/// A counted reference to the open shared link.
///
/// Cloning a handle does not add a reference; only
/// [`TransportManager::acquire`] does.
#[derive(Clone)]
pub struct TransportHandle {
    id: Uuid,
    link: Arc<dyn Link>,
}

impl TransportHandle {
    /// Identifies the open/close cycle this handle belongs to.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn link(&self) -> &dyn Link {
        self.link.as_ref()
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle").field("id", &self.id).finish()
    }
}

struct Slot {
    current: Option<TransportHandle>,
    ref_count: usize,
}

/// Reference-counted owner of the shared link.
///
/// Cheap to clone; clones manage the same link. Hold one per process.
#[derive(Clone)]
pub struct TransportManager {
    slot: Arc<Mutex<Slot>>,
    opener: LinkOpener,
}

impl TransportManager {
    pub fn new(opener: LinkOpener) -> Self {
        TransportManager {
            slot: Arc::new(Mutex::new(Slot {
                current: None,
                ref_count: 0,
            })),
            opener,
        }
    }

    /// A manager that opens a [`UdpLink`] with `settings`.
    pub fn udp(settings: &Settings) -> Self {
        let settings = settings.clone();
        TransportManager::new(Arc::new(move || -> BoxFuture<'static, Result<Arc<dyn Link>>> {
            let settings = settings.clone();
            Box::pin(async move {
                let link: Arc<dyn Link> = Arc::new(UdpLink::bind(&settings).await?);
                Ok(link)
            })
        }))
    }

    /// Take a reference to the shared link, opening it if needed.
    ///
    /// An open failure is returned to this caller only and leaves the count
    /// untouched; the next acquire tries again.
    pub async fn acquire(&self) -> Result<TransportHandle> {
        let mut slot = self.slot.lock().await;
        let handle = match slot.current.clone() {
            Some(handle) => handle,
            None => {
                let handle = TransportHandle {
                    id: Uuid::new_v4(),
                    link: (self.opener)().await?,
                };
                info!("opened shared transport {}", handle.id);
                slot.current = Some(handle.clone());
                handle
            }
        };
        slot.ref_count += 1;
        debug!("shared transport acquired, {} reference(s)", slot.ref_count);
        Ok(handle)
    }

    /// Give back a reference taken with [`acquire`](Self::acquire).
    ///
    /// Handles from an earlier open/close cycle are ignored, so surplus
    /// releases can neither drive the count below zero nor close a link
    /// twice.
    pub async fn release(&self, handle: &TransportHandle) {
        let mut slot = self.slot.lock().await;
        match &slot.current {
            Some(current) if current.id == handle.id => {}
            _ => {
                warn!("ignoring release of stale transport handle {}", handle.id);
                return;
            }
        }

        slot.ref_count = slot.ref_count.saturating_sub(1);
        debug!("shared transport released, {} reference(s)", slot.ref_count);
        if slot.ref_count == 0 {
            if let Some(closed) = slot.current.take() {
                closed.link.close();
                info!("closed shared transport {}", closed.id);
            }
        }
    }

    pub async fn ref_count(&self) -> usize {
        self.slot.lock().await.ref_count
    }

    pub async fn is_open(&self) -> bool {
        self.slot.lock().await.current.is_some()
    }
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn mock_manager(link: Arc<crate::mock::MockLink>) -> TransportManager {
    TransportManager::new(Arc::new(move || -> BoxFuture<'static, Result<Arc<dyn Link>>> {
        link.reopen();
        let link: Arc<dyn Link> = link.clone();
        Box::pin(async move { Ok(link) })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_manager() -> (TransportManager, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<Arc<MockLink>>>>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let links = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (o, l) = (opens.clone(), links.clone());
        let manager = TransportManager::new(Arc::new(move || -> BoxFuture<'static, Result<Arc<dyn Link>>> {
            o.fetch_add(1, Ordering::SeqCst);
            let link = MockLink::new();
            l.lock().unwrap().push(link.clone());
            let link: Arc<dyn Link> = link;
            Box::pin(async move { Ok(link) })
        }));
        (manager, opens, links)
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let (manager, opens, links) = counting_manager();

        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(manager.ref_count().await, 2);
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        manager.release(&first).await;
        assert!(manager.is_open().await);
        manager.release(&second).await;
        assert!(!manager.is_open().await);
        assert_eq!(manager.ref_count().await, 0);
        assert!(links.lock().unwrap()[0].is_closed());

        let third = manager.acquire().await.unwrap();
        assert_ne!(third.id(), first.id());
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(!links.lock().unwrap()[1].is_closed());
    }

    #[tokio::test]
    async fn test_surplus_release_is_clamped() {
        let (manager, _, links) = counting_manager();

        let handle = manager.acquire().await.unwrap();
        manager.release(&handle).await;
        manager.release(&handle).await;
        manager.release(&handle).await;
        assert_eq!(manager.ref_count().await, 0);

        // A stale handle must not touch the next cycle.
        let fresh = manager.acquire().await.unwrap();
        manager.release(&handle).await;
        assert_eq!(manager.ref_count().await, 1);
        assert!(manager.is_open().await);
        assert!(!links.lock().unwrap()[1].is_closed());
        manager.release(&fresh).await;
        assert!(!manager.is_open().await);
    }

    #[tokio::test]
    async fn test_open_failure_is_retried_lazily() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let manager = TransportManager::new(Arc::new(move || -> BoxFuture<'static, Result<Arc<dyn Link>>> {
            let attempt = a.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if attempt == 0 {
                    Err(Error::socket(
                        "bind",
                        std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
                    ))
                } else {
                    let link: Arc<dyn Link> = MockLink::new();
                    Ok(link)
                }
            })
        }));

        assert!(manager.acquire().await.is_err());
        assert_eq!(manager.ref_count().await, 0);
        assert!(!manager.is_open().await);

        manager.acquire().await.unwrap();
        assert_eq!(manager.ref_count().await, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_opens_once() {
        let (manager, opens, _) = counting_manager();

        let handles = futures::future::join_all((0..16).map(|_| manager.acquire())).await;
        let handles: Vec<TransportHandle> = handles.into_iter().map(Result::unwrap).collect();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.ref_count().await, 16);

        futures::future::join_all(handles.iter().map(|h| manager.release(h))).await;
        assert_eq!(manager.ref_count().await, 0);
        assert!(!manager.is_open().await);
    }
}
