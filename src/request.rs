use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::ProxyError;
use crate::protocol::resp::Resp;

/// Counter with an awaitable zero crossing.
///
/// Serves both as the per-request batch counter (one increment per
/// dispatch target) and as the per-slot in-flight counter.
#[derive(Debug)]
pub struct WaitGroup {
    count: watch::Sender<usize>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            count: watch::channel(0).0,
        }
    }

    pub fn add(&self, n: usize) {
        self.count.send_modify(|c| *c += n);
    }

    pub fn done(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }

    pub fn pending(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until the counter reaches zero. Returns immediately when it
    /// already is.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // the sender lives in self, so wait_for cannot fail
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge strategy for composite commands that fan out one sub-request per
/// key. Held by the parent request; applied once the shared batch drains.
#[derive(Debug)]
pub enum Coalesce {
    /// MGET: one-element array per sub-reply, concatenated.
    MGet(Vec<Request>),
    /// MSET: every sub-reply must be `+OK`; the last one is the answer.
    MSet(Vec<Request>),
    /// DEL: integer sub-replies, summed.
    Del(Vec<Request>),
}

impl Coalesce {
    pub fn merge(self) -> Result<Resp, ProxyError> {
        match self {
            Coalesce::MGet(subs) => {
                let mut array = Vec::with_capacity(subs.len());
                for sub in subs {
                    match sub.take_response()? {
                        Resp::Array(mut values) if values.len() == 1 => {
                            array.push(values.pop().expect("len checked"))
                        }
                        other => array.push(other),
                    }
                }
                Ok(Resp::Array(array))
            }
            Coalesce::MSet(subs) => {
                let mut last = Resp::ok();
                for sub in subs {
                    last = sub.take_response()?;
                }
                Ok(last)
            }
            Coalesce::Del(subs) => {
                let mut total = 0i64;
                for sub in subs {
                    match sub.take_response()? {
                        Resp::Integer(n) => total += n,
                        other => return Ok(other),
                    }
                }
                Ok(Resp::Integer(total))
            }
        }
    }
}

#[derive(Debug)]
struct RequestInner {
    op: String,
    multi: Vec<Resp>,
    start: Instant,
    batch: Arc<WaitGroup>,
    broken: Arc<AtomicBool>,
    slot: Mutex<Option<Arc<WaitGroup>>>,
    response: Mutex<Option<Result<Resp, ProxyError>>>,
    coalesce: Mutex<Option<Coalesce>>,
}

/// One client command in flight.
///
/// Cheap to clone; the session keeps one handle for the reply writer while
/// another travels through the router into a backend connection. After
/// dispatch the request is immutable except for the response cell, which
/// the backend reader writes exactly once.
///
/// The broken flag is scoped to one top-level request and its
/// sub-requests: a transport failure on one dispatch target short-circuits
/// the rest of that batch with `DiscardedRequest`, and the next command on
/// the same client starts clean.
#[derive(Debug, Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub fn new(op: String, multi: Vec<Resp>) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                op,
                multi,
                start: Instant::now(),
                batch: Arc::new(WaitGroup::new()),
                broken: Arc::new(AtomicBool::new(false)),
                slot: Mutex::new(None),
                response: Mutex::new(None),
                coalesce: Mutex::new(None),
            }),
        }
    }

    /// A sub-request sharing this request's batch and broken flag.
    pub fn sub_request(&self, multi: Vec<Resp>) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                op: self.inner.op.clone(),
                multi,
                start: self.inner.start,
                batch: self.inner.batch.clone(),
                broken: self.inner.broken.clone(),
                slot: Mutex::new(None),
                response: Mutex::new(None),
                coalesce: Mutex::new(None),
            }),
        }
    }

    pub fn op(&self) -> &str {
        &self.inner.op
    }

    pub fn multi(&self) -> &[Resp] {
        &self.inner.multi
    }

    pub fn start(&self) -> Instant {
        self.inner.start
    }

    pub fn batch(&self) -> &Arc<WaitGroup> {
        &self.inner.batch
    }

    /// Wait for every dispatch target of this request to complete.
    pub async fn wait_batch(&self) {
        self.inner.batch.wait().await;
    }

    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::SeqCst)
    }

    pub fn mark_broken(&self) {
        self.inner.broken.store(true, Ordering::SeqCst);
    }

    /// Install the owning slot's in-flight guard; released on completion.
    pub fn attach_slot(&self, guard: Arc<WaitGroup>) {
        *self.inner.slot.lock() = Some(guard);
    }

    /// Remove the in-flight guard without completing the request. Used when
    /// a forward parks on a frozen slot and its in-flight count must not
    /// keep the drain from finishing.
    pub fn take_slot(&self) -> Option<Arc<WaitGroup>> {
        self.inner.slot.lock().take()
    }

    pub fn set_coalesce(&self, coalesce: Coalesce) {
        *self.inner.coalesce.lock() = Some(coalesce);
    }

    pub fn take_coalesce(&self) -> Option<Coalesce> {
        self.inner.coalesce.lock().take()
    }

    /// Store a locally produced reply. Touches no counters; the batch was
    /// never incremented for a request that is not dispatched.
    pub fn set_reply(&self, resp: Resp) {
        *self.inner.response.lock() = Some(Ok(resp));
    }

    pub fn set_error(&self, err: ProxyError) {
        *self.inner.response.lock() = Some(Err(err));
    }

    /// Complete one dispatch target: store the outcome, flag the session
    /// broken on transport failure, release the slot guard, then the batch.
    /// Every dispatched request goes through here exactly once, whatever
    /// the outcome.
    pub fn finish(&self, result: Result<Resp, ProxyError>) {
        if result.is_err() {
            self.mark_broken();
        }
        {
            let mut response = self.inner.response.lock();
            debug_assert!(response.is_none(), "request completed twice");
            *response = Some(result);
        }
        if let Some(slot) = self.take_slot() {
            slot.done();
        }
        self.inner.batch.done();
    }

    /// The stored outcome. A request abandoned without completion reads as
    /// a reset connection.
    pub fn take_response(&self) -> Result<Resp, ProxyError> {
        self.inner
            .response
            .lock()
            .take()
            .unwrap_or(Err(ProxyError::ConnReset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_request() -> Request {
        Request::new("GET".into(), vec![Resp::bulk(b"GET"), Resp::bulk(b"foo")])
    }

    #[tokio::test]
    async fn batch_waits_for_every_target() {
        let r = get_request();
        r.batch().add(2);

        let waiter = {
            let r = r.clone();
            tokio::spawn(async move { r.wait_batch().await })
        };
        r.batch().done();
        assert!(!waiter.is_finished());
        r.batch().done();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn empty_batch_returns_immediately() {
        let r = get_request();
        r.set_reply(Resp::pong());
        r.wait_batch().await;
        assert_eq!(r.take_response().unwrap(), Resp::pong());
    }

    #[test]
    fn finish_releases_slot_and_marks_broken() {
        let r = get_request();
        let slot = Arc::new(WaitGroup::new());
        slot.add(1);
        r.attach_slot(slot.clone());
        r.batch().add(1);

        r.finish(Err(ProxyError::ConnReset));
        assert_eq!(slot.pending(), 0);
        assert_eq!(r.batch().pending(), 0);
        assert!(r.is_broken());

        let sub = r.sub_request(vec![Resp::bulk(b"GET"), Resp::bulk(b"bar")]);
        assert!(sub.is_broken());
    }

    #[test]
    fn coalesce_mget_concatenates() {
        let parent = get_request();
        let subs: Vec<Request> = (0..2)
            .map(|_| parent.sub_request(vec![Resp::bulk(b"MGET"), Resp::bulk(b"k")]))
            .collect();
        subs[0].set_reply(Resp::Array(vec![Resp::bulk(b"a")]));
        subs[1].set_reply(Resp::Array(vec![Resp::NullBulk]));
        let merged = Coalesce::MGet(subs).merge().unwrap();
        assert_eq!(
            merged,
            Resp::Array(vec![Resp::bulk(b"a"), Resp::NullBulk])
        );
    }

    #[test]
    fn coalesce_del_sums_integers() {
        let parent = get_request();
        let subs: Vec<Request> = (0..3)
            .map(|_| parent.sub_request(vec![Resp::bulk(b"DEL"), Resp::bulk(b"k")]))
            .collect();
        for sub in &subs {
            sub.set_reply(Resp::Integer(1));
        }
        assert_eq!(Coalesce::Del(subs).merge().unwrap(), Resp::Integer(3));
    }

    #[test]
    fn coalesce_propagates_sub_errors() {
        let parent = get_request();
        let sub = parent.sub_request(vec![Resp::bulk(b"MGET"), Resp::bulk(b"k")]);
        sub.set_error(ProxyError::ConnReset);
        assert_eq!(
            Coalesce::MGet(vec![sub]).merge().unwrap_err(),
            ProxyError::ConnReset
        );
    }
}
