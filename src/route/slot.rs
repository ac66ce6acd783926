use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::backend::BackendConn;
use crate::error::ProxyError;
use crate::protocol::resp::Resp;
use crate::request::{Request, WaitGroup};

/// Where a slot currently sends traffic. Mutated only by fill/reset while
/// the slot is frozen and drained; the forward path takes short read locks
/// and clones the `Arc` out before awaiting anything.
#[derive(Debug, Default)]
pub(crate) struct Binding {
    pub backend_addr: Option<String>,
    pub backend_host: Bytes,
    pub backend_port: Bytes,
    pub backend: Option<Arc<BackendConn>>,
    pub migrate_from: Option<String>,
    pub migrate: Option<Arc<BackendConn>>,
}

/// Public snapshot of one slot, as reported to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: usize,
    pub backend_addr: Option<String>,
    pub migrate_from: Option<String>,
    pub locked: bool,
}

/// One keyspace partition.
///
/// The latch has two faces: `blocked` suspends new forwards at their single
/// suspension point, and `hold` parks forwards that were already granted
/// when the freeze began. `wait` counts dispatched requests; membership
/// changes only happen after it drains to zero.
#[derive(Debug)]
pub struct Slot {
    id: usize,
    binding: RwLock<Binding>,
    hold: AtomicBool,
    blocked: watch::Sender<bool>,
    pending: Mutex<VecDeque<Request>>,
    wait: Arc<WaitGroup>,
    migrate_timeout_ms: u64,
}

impl Slot {
    pub(crate) fn new(id: usize, migrate_timeout_ms: u64) -> Self {
        Self {
            id,
            binding: RwLock::new(Binding::default()),
            hold: AtomicBool::new(false),
            blocked: watch::channel(false).0,
            pending: Mutex::new(VecDeque::new()),
            wait: Arc::new(WaitGroup::new()),
            migrate_timeout_ms,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn info(&self) -> SlotInfo {
        let binding = self.binding.read();
        SlotInfo {
            id: self.id,
            backend_addr: binding.backend_addr.clone(),
            migrate_from: binding.migrate_from.clone(),
            locked: self.hold.load(Ordering::SeqCst),
        }
    }

    /// Route one request through this slot.
    ///
    /// Always completes the request one way or another; errors that concern
    /// only this request become its response instead of propagating.
    pub async fn forward(&self, r: Request, hkey: Option<Bytes>) {
        self.wait_unblocked().await;

        self.wait.add(1);
        r.attach_slot(self.wait.clone());

        if let Err(err) = self.migrate_key(hkey).await {
            r.finish(Err(err));
            return;
        }

        if self.hold.load(Ordering::SeqCst) {
            // granted before the freeze finished: park, and surrender the
            // in-flight count so the drain can complete. The batch hold
            // keeps the session writer waiting until the queue flushes.
            if let Some(guard) = r.take_slot() {
                guard.done();
            }
            r.batch().add(1);
            self.pending.lock().push_back(r);
            return;
        }

        let backend = self.binding.read().backend.clone();
        match backend {
            Some(bc) => bc.push_back(r).await,
            None => r.finish(Err(ProxyError::SlotNotReady)),
        }
    }

    /// Migrate the key out of the source backend before serving it, when
    /// this slot is mid-migration and the command carries a key.
    async fn migrate_key(&self, hkey: Option<Bytes>) -> Result<(), ProxyError> {
        let key = match hkey {
            Some(key) if !key.is_empty() => key,
            _ => return Ok(()),
        };
        let (migrate, host, port) = {
            let binding = self.binding.read();
            match &binding.migrate {
                Some(bc) => (
                    bc.clone(),
                    binding.backend_host.clone(),
                    binding.backend_port.clone(),
                ),
                None => return Ok(()),
            }
        };

        let multi = vec![
            Resp::bulk(b"SLOTSMGRTTAGONE"),
            Resp::BulkBytes(host),
            Resp::BulkBytes(port),
            Resp::bulk(self.migrate_timeout_ms.to_string().as_bytes()),
            Resp::BulkBytes(key.clone()),
        ];
        let m = Request::new("SLOTSMGRTTAGONE".into(), multi);
        migrate.push_back(m.clone()).await;
        m.wait_batch().await;

        match m.take_response() {
            Ok(Resp::Error(message)) => Err(ProxyError::MigrateFailed(
                String::from_utf8_lossy(&message).into_owned(),
            )),
            Ok(_) => {
                debug!(slot = self.id, key = ?key, "migrated key from source");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn wait_unblocked(&self) {
        if !*self.blocked.borrow() {
            return;
        }
        let mut rx = self.blocked.subscribe();
        let _ = rx.wait_for(|blocked| !blocked).await;
    }

    /// Freeze the slot and wait for every dispatched request to drain.
    /// Must not be called from a forward of this same slot.
    pub(crate) async fn block_and_wait(&self) {
        self.hold.store(true, Ordering::SeqCst);
        self.blocked.send_replace(true);
        self.wait.wait().await;
    }

    /// Release the latch: re-dispatch parked requests in FIFO order onto
    /// the (possibly new) backend, then let suspended forwards through.
    pub(crate) async fn unblock(&self) {
        loop {
            let r = match self.pending.lock().pop_front() {
                Some(r) => r,
                None => break,
            };
            self.wait.add(1);
            r.attach_slot(self.wait.clone());
            let backend = self.binding.read().backend.clone();
            match backend {
                Some(bc) => {
                    bc.push_back(r.clone()).await;
                    // drop the parking hold now that dispatch carries one
                    r.batch().done();
                }
                // finish() releases the parking hold itself
                None => r.finish(Err(ProxyError::SlotNotReady)),
            }
        }
        self.hold.store(false, Ordering::SeqCst);
        self.blocked.send_replace(false);
    }

    /// Swap in a new binding. Only called between `block_and_wait` and
    /// `unblock`; returns the connections whose references are being
    /// dropped so the router can release them under its own lock.
    pub(crate) fn rebind(&self, binding: Binding) -> (Option<Arc<BackendConn>>, Option<Arc<BackendConn>>) {
        let mut current = self.binding.write();
        let old = std::mem::replace(&mut *current, binding);
        (old.backend, old.migrate)
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.hold.load(Ordering::SeqCst)
    }
}
