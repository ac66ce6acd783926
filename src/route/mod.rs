pub mod slot;

pub use slot::{Slot, SlotInfo};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::backend::{BackendConn, BackendOptions, SharedBackendConn};
use crate::error::ProxyError;
use crate::protocol::command::{get_hash_key, hash_slot, MAX_SLOT_NUM};
use crate::request::Request;

use self::slot::Binding;

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub backend: BackendOptions,
    /// Timeout handed to `SLOTSMGRTTAGONE`, in milliseconds.
    pub migrate_timeout_ms: u64,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            backend: BackendOptions::default(),
            migrate_timeout_ms: 100,
        }
    }
}

struct Inner {
    pool: HashMap<String, SharedBackendConn>,
    closed: bool,
}

/// Owner of the slot table and the address-keyed backend pool.
///
/// The mutex guards the pool map and structural slot changes; the data
/// path reads only slot fields that are immutable between block points or
/// covered by the per-slot in-flight counter.
pub struct Router {
    slots: Vec<Slot>,
    inner: Mutex<Inner>,
    closed: AtomicBool,
    options: RouterOptions,
}

impl Router {
    pub fn new(options: RouterOptions) -> Self {
        let slots = (0..MAX_SLOT_NUM)
            .map(|id| Slot::new(id, options.migrate_timeout_ms))
            .collect();
        Self {
            slots,
            inner: Mutex::new(Inner {
                pool: HashMap::new(),
                closed: false,
            }),
            closed: AtomicBool::new(false),
            options,
        }
    }

    /// Route one request to the slot its key hashes to. Keyless commands
    /// hash the empty string; policy above decides whether they get here.
    pub async fn dispatch(&self, r: Request) -> Result<(), ProxyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::ClosedRouter);
        }
        let hkey = get_hash_key(r.multi(), r.op());
        let idx = hash_slot(hkey.as_deref().unwrap_or(b""));
        self.slots[idx].forward(r, hkey).await;
        Ok(())
    }

    /// Install slot ownership: the only mutator of slot membership.
    pub async fn fill_slot(
        &self,
        idx: usize,
        addr: Option<String>,
        from: Option<String>,
        locked: bool,
    ) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(ProxyError::ClosedRouter);
        }
        if idx >= self.slots.len() {
            return Err(ProxyError::InvalidSlotId);
        }

        let slot = &self.slots[idx];
        slot.block_and_wait().await;

        let mut binding = Binding::default();
        if let Some(addr) = addr.filter(|a| !a.is_empty()) {
            match addr.rsplit_once(':') {
                Some((host, port)) => {
                    binding.backend_host = Bytes::copy_from_slice(host.as_bytes());
                    binding.backend_port = Bytes::copy_from_slice(port.as_bytes());
                }
                None => warn!(addr = %addr, "split host-port failed"),
            }
            binding.backend = Some(get_backend_conn(&mut inner, &addr, &self.options));
            binding.backend_addr = Some(addr);
        }
        if let Some(from) = from.filter(|f| !f.is_empty()) {
            binding.migrate = Some(get_backend_conn(&mut inner, &from, &self.options));
            binding.migrate_from = Some(from);
        }

        if binding.migrate.is_some() {
            warn!(
                slot = idx,
                backend = binding.backend_addr.as_deref().unwrap_or(""),
                from = binding.migrate_from.as_deref().unwrap_or(""),
                locked,
                "fill slot"
            );
        } else {
            warn!(
                slot = idx,
                backend = binding.backend_addr.as_deref().unwrap_or(""),
                locked,
                "fill slot"
            );
        }

        let (old_backend, old_migrate) = slot.rebind(binding);
        put_backend_conn(&mut inner, old_backend);
        put_backend_conn(&mut inner, old_migrate);

        if !locked {
            slot.unblock().await;
        }
        Ok(())
    }

    /// Invite every pooled backend to ping itself when idle.
    pub async fn keep_alive(&self) -> Result<(), ProxyError> {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Err(ProxyError::ClosedRouter);
        }
        for shared in inner.pool.values() {
            shared.conn().keep_alive().await;
        }
        Ok(())
    }

    /// Snapshot of every slot for the control plane.
    pub fn get_slots(&self) -> Vec<SlotInfo> {
        self.slots.iter().map(Slot::info).collect()
    }

    /// Block and reset every slot, drop all pool references, and refuse
    /// further work.
    pub async fn close(&self) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        for slot in &self.slots {
            slot.block_and_wait().await;
            let (old_backend, old_migrate) = slot.rebind(Binding::default());
            put_backend_conn(&mut inner, old_backend);
            put_backend_conn(&mut inner, old_migrate);
            slot.unblock().await;
        }
        inner.closed = true;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn pool_refcnt(&self, addr: &str) -> Option<usize> {
        let inner = self.inner.lock().await;
        inner.pool.get(addr).map(SharedBackendConn::refcnt)
    }
}

fn get_backend_conn(inner: &mut Inner, addr: &str, options: &RouterOptions) -> Arc<BackendConn> {
    if let Some(shared) = inner.pool.get_mut(addr) {
        return shared.incr_refcnt();
    }
    let shared = SharedBackendConn::new(addr.to_string(), options.backend.clone());
    let conn = shared.conn().clone();
    inner.pool.insert(addr.to_string(), shared);
    conn
}

fn put_backend_conn(inner: &mut Inner, conn: Option<Arc<BackendConn>>) {
    let conn = match conn {
        Some(conn) => conn,
        None => return,
    };
    let addr = conn.addr().to_string();
    if let Some(shared) = inner.pool.get_mut(&addr) {
        if shared.release() {
            inner.pool.remove(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::resp::Resp;

    #[tokio::test]
    async fn pool_refcnt_tracks_slot_references() {
        let router = Router::new(RouterOptions::default());
        let addr = "127.0.0.1:16379".to_string();

        router
            .fill_slot(1, Some(addr.clone()), None, false)
            .await
            .unwrap();
        router
            .fill_slot(2, Some(addr.clone()), None, false)
            .await
            .unwrap();
        assert_eq!(router.pool_refcnt(&addr).await, Some(2));

        router
            .fill_slot(1, Some("127.0.0.1:16380".to_string()), None, false)
            .await
            .unwrap();
        assert_eq!(router.pool_refcnt(&addr).await, Some(1));

        router.fill_slot(2, None, None, false).await.unwrap();
        assert_eq!(router.pool_refcnt(&addr).await, None);

        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn migration_source_holds_a_reference() {
        let router = Router::new(RouterOptions::default());
        let owner = "127.0.0.1:16379".to_string();
        let source = "127.0.0.1:16380".to_string();

        router
            .fill_slot(9, Some(owner.clone()), Some(source.clone()), false)
            .await
            .unwrap();
        assert_eq!(router.pool_refcnt(&source).await, Some(1));

        let info = &router.get_slots()[9];
        assert_eq!(info.backend_addr.as_deref(), Some(owner.as_str()));
        assert_eq!(info.migrate_from.as_deref(), Some(source.as_str()));
        assert!(!info.locked);

        // migration finished: refill with the owner only
        router
            .fill_slot(9, Some(owner.clone()), None, false)
            .await
            .unwrap();
        assert_eq!(router.pool_refcnt(&source).await, None);
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_router_rejects_operations() {
        let router = Router::new(RouterOptions::default());
        router.close().await.unwrap();

        let r = Request::new(
            "GET".into(),
            vec![Resp::bulk(b"GET"), Resp::bulk(b"foo")],
        );
        assert_eq!(
            router.dispatch(r).await.unwrap_err(),
            ProxyError::ClosedRouter
        );
        assert_eq!(
            router.fill_slot(0, None, None, false).await.unwrap_err(),
            ProxyError::ClosedRouter
        );
        assert_eq!(
            router.keep_alive().await.unwrap_err(),
            ProxyError::ClosedRouter
        );
    }

    #[tokio::test]
    async fn invalid_slot_id_is_rejected() {
        let router = Router::new(RouterOptions::default());
        assert_eq!(
            router
                .fill_slot(MAX_SLOT_NUM, None, None, false)
                .await
                .unwrap_err(),
            ProxyError::InvalidSlotId
        );
        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn locked_fill_keeps_slot_frozen() {
        let router = Router::new(RouterOptions::default());
        let addr = "127.0.0.1:16379".to_string();
        router
            .fill_slot(4, Some(addr.clone()), None, true)
            .await
            .unwrap();
        assert!(router.get_slots()[4].locked);

        // a later unlocked fill releases the latch
        router
            .fill_slot(4, Some(addr), None, false)
            .await
            .unwrap();
        assert!(!router.get_slots()[4].locked);
        router.close().await.unwrap();
    }
}
