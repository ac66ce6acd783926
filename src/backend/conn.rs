use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::metrics;
use crate::protocol::codec::{encode_multi_bulk, RespCodec};
use crate::protocol::resp::Resp;
use crate::request::Request;

/// Pending requests queued per backend connection.
const INPUT_CHANNEL_SIZE: usize = 1024;
/// Requests written but not yet answered, writer → reader.
const TASKS_CHANNEL_SIZE: usize = 4096;

/// Flush after this many unflushed commands.
const MAX_BUFFERED: usize = 256;
/// Flush when the last flush is older than this.
const MAX_FLUSH_INTERVAL: Duration = Duration::from_millis(300);

const DIAL_TIMEOUT: Duration = Duration::from_secs(1);
const IO_TIMEOUT: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub auth: Option<String>,
    pub recv_bufsize: usize,
    pub send_bufsize: usize,
}

impl BackendOptions {
    fn recv_capacity(&self) -> usize {
        if self.recv_bufsize == 0 {
            64 * 1024
        } else {
            self.recv_bufsize
        }
    }

    fn send_capacity(&self) -> usize {
        if self.send_bufsize == 0 {
            64 * 1024
        } else {
            self.send_bufsize
        }
    }
}

/// One pipelined connection to a backend server.
///
/// Requests flow through `input` into a writer loop that encodes them onto
/// the socket under a batched flush policy and hands each one, in send
/// order, to a reader task over the `tasks` channel. The reader decodes one
/// reply per task; that ordering is the only binding between a request and
/// its response. The connection dials lazily, and a supervisor re-enters
/// the writer loop after transport failures until `close` shuts the input.
#[derive(Debug)]
pub struct BackendConn {
    addr: String,
    input: Mutex<Option<mpsc::Sender<Request>>>,
}

impl BackendConn {
    pub fn new(addr: String, options: BackendOptions) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(INPUT_CHANNEL_SIZE);
        let conn = Arc::new(Self {
            addr: addr.clone(),
            input: Mutex::new(Some(tx)),
        });
        tokio::spawn(run(addr, options, rx));
        conn
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Queue a request. The batch counter is incremented here, before the
    /// request can complete, so a waiter always observes the target.
    pub async fn push_back(&self, r: Request) {
        r.batch().add(1);
        let sender = self.input.lock().clone();
        match sender {
            Some(tx) => {
                if tx.send(r.clone()).await.is_err() {
                    r.finish(Err(ProxyError::ConnReset));
                }
            }
            None => r.finish(Err(ProxyError::ConnReset)),
        }
    }

    /// Enqueue a PING iff the input queue is idle.
    pub async fn keep_alive(&self) -> bool {
        {
            let input = self.input.lock();
            match input.as_ref() {
                Some(tx) if tx.capacity() == tx.max_capacity() => {}
                _ => return false,
            }
        }
        let ping = Request::new("PING".into(), vec![Resp::bulk(b"PING")]);
        self.push_back(ping).await;
        true
    }

    /// Shut the input queue. The writer drains what is already queued and
    /// the supervisor exits; idempotent.
    pub fn close(&self) {
        self.input.lock().take();
    }
}

/// Refcount wrapper stored in the router pool. The count is only touched
/// under the router lock.
#[derive(Debug)]
pub struct SharedBackendConn {
    conn: Arc<BackendConn>,
    refcnt: usize,
}

impl SharedBackendConn {
    pub fn new(addr: String, options: BackendOptions) -> Self {
        Self {
            conn: BackendConn::new(addr, options),
            refcnt: 1,
        }
    }

    pub fn addr(&self) -> &str {
        self.conn.addr()
    }

    pub fn conn(&self) -> &Arc<BackendConn> {
        &self.conn
    }

    pub fn refcnt(&self) -> usize {
        self.refcnt
    }

    pub fn incr_refcnt(&mut self) -> Arc<BackendConn> {
        assert!(self.refcnt > 0, "shared backend conn has been closed");
        self.refcnt += 1;
        self.conn.clone()
    }

    /// Drop one reference; the last one closes the connection. Returns
    /// true when the pool entry should be removed.
    pub fn release(&mut self) -> bool {
        assert!(self.refcnt > 0, "shared backend conn released too many times");
        self.refcnt -= 1;
        if self.refcnt == 0 {
            self.conn.close();
            return true;
        }
        false
    }
}

/// Supervisor: re-enter the writer loop across transport failures until
/// the input channel closes.
async fn run(addr: String, options: BackendOptions, mut rx: mpsc::Receiver<Request>) {
    debug!(backend = %addr, "backend conn start");
    let mut round = 0usize;
    loop {
        round += 1;
        match writer_loop(&addr, &options, &mut rx).await {
            Ok(()) => break,
            Err(err) => {
                metrics::backend_error_incr(&addr);
                warn!(backend = %addr, round, error = %err, "backend writer exit");
                // everything already queued fails fast with the same error
                while let Ok(r) = rx.try_recv() {
                    r.finish(Err(err.clone()));
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!(backend = %addr, rounds = round, "backend conn stop");
}

/// One connection round: dial on the first request, then encode/flush/hand
/// off until the socket or the input gives out.
async fn writer_loop(
    addr: &str,
    options: &BackendOptions,
    rx: &mut mpsc::Receiver<Request>,
) -> Result<(), ProxyError> {
    let first = match rx.recv().await {
        Some(r) => r,
        None => return Ok(()),
    };

    let (write_half, frames) = match connect(addr, options).await {
        Ok(pair) => pair,
        Err(err) => {
            first.finish(Err(err.clone()));
            return Err(err);
        }
    };

    let (tasks_tx, tasks_rx) = mpsc::channel(TASKS_CHANNEL_SIZE);
    // the halves are split, so a dead reader cannot fail the writer through
    // the socket; it reports through this cell instead
    let reader_failure: Arc<Mutex<Option<ProxyError>>> = Arc::new(Mutex::new(None));
    tokio::spawn(reader_loop(
        addr.to_string(),
        frames,
        tasks_rx,
        reader_failure.clone(),
    ));

    let mut writer = BackendWriter::new(write_half, options.send_capacity());
    let mut next = Some(first);
    loop {
        let r = match next.take() {
            Some(r) => r,
            None => match rx.recv().await {
                Some(r) => r,
                None => {
                    // input closed by the router; push out what is buffered
                    writer.flush(true).await?;
                    return Ok(());
                }
            },
        };

        if let Some(err) = reader_failure.lock().clone() {
            r.finish(Err(err.clone()));
            return Err(err);
        }

        if r.is_broken() {
            if let Err(err) = writer.flush(rx.is_empty()).await {
                r.finish(Err(err.clone()));
                return Err(err);
            }
            r.finish(Err(ProxyError::DiscardedRequest));
            continue;
        }

        if let Err(err) = writer.encode(r.multi()) {
            r.finish(Err(err.clone()));
            return Err(err);
        }
        if let Err(err) = writer.flush(rx.is_empty()).await {
            r.finish(Err(err.clone()));
            return Err(err);
        }
        if tasks_tx.send(r.clone()).await.is_err() {
            let err = ProxyError::ConnReset;
            r.finish(Err(err.clone()));
            return Err(err);
        }
    }
}

async fn connect(
    addr: &str,
    options: &BackendOptions,
) -> Result<(OwnedWriteHalf, FramedRead<OwnedReadHalf, RespCodec>), ProxyError> {
    let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(ProxyError::DialTimeout(addr.to_string())),
    };
    if let Err(err) = stream.set_nodelay(true) {
        warn!(backend = %addr, error = %err, "set_nodelay failed");
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut frames =
        FramedRead::with_capacity(read_half, RespCodec::default(), options.recv_capacity());

    if let Some(password) = &options.auth {
        verify_auth(addr, password, &mut write_half, &mut frames).await?;
    }
    Ok((write_half, frames))
}

/// Synchronous AUTH exchange on a fresh connection; anything but a simple
/// string means the credentials were not accepted.
async fn verify_auth(
    addr: &str,
    password: &str,
    write_half: &mut OwnedWriteHalf,
    frames: &mut FramedRead<OwnedReadHalf, RespCodec>,
) -> Result<(), ProxyError> {
    let mut buf = BytesMut::new();
    encode_multi_bulk(&[Resp::bulk(b"AUTH"), Resp::bulk(password)], &mut buf);
    timeout(IO_TIMEOUT, write_half.write_all(&buf))
        .await
        .map_err(|_| ProxyError::WriteTimeout(addr.to_string()))??;

    match timeout(IO_TIMEOUT, frames.next()).await {
        Err(_) => Err(ProxyError::ReadTimeout(addr.to_string())),
        Ok(None) => Err(ProxyError::ConnReset),
        Ok(Some(Err(err))) => Err(err),
        Ok(Some(Ok(Resp::Simple(_)))) => Ok(()),
        Ok(Some(Ok(Resp::Error(message)))) => Err(ProxyError::AuthRejected(
            String::from_utf8_lossy(&message).into_owned(),
        )),
        Ok(Some(Ok(other))) => Err(ProxyError::AuthRejected(format!(
            "unexpected auth reply {:?}",
            other
        ))),
    }
}

/// Consume written requests in send order and complete each with the next
/// decoded reply. A failure completes the current request and everything
/// that keeps arriving until the writer drops its side of the channel.
async fn reader_loop(
    addr: String,
    mut frames: FramedRead<OwnedReadHalf, RespCodec>,
    mut tasks: mpsc::Receiver<Request>,
    reader_failure: Arc<Mutex<Option<ProxyError>>>,
) {
    let mut failure: Option<ProxyError> = None;
    while let Some(r) = tasks.recv().await {
        if let Some(err) = &failure {
            r.finish(Err(err.clone()));
            continue;
        }
        let outcome = match timeout(IO_TIMEOUT, frames.next()).await {
            Err(_) => Err(ProxyError::ReadTimeout(addr.clone())),
            Ok(None) => Err(ProxyError::ConnReset),
            Ok(Some(Err(err))) => Err(err),
            Ok(Some(Ok(resp))) => Ok(resp),
        };
        match outcome {
            Ok(resp) => {
                metrics::remote_observe(r.op(), r.start());
                r.finish(Ok(resp));
            }
            Err(err) => {
                warn!(backend = %addr, error = %err, "backend reader exit");
                *reader_failure.lock() = Some(err.clone());
                r.finish(Err(err.clone()));
                failure = Some(err);
            }
        }
    }
}

/// Buffered encoder with the batched flush policy. A transport failure is
/// sticky: every later call reports the stored error unchanged.
struct BackendWriter {
    io: OwnedWriteHalf,
    buf: BytesMut,
    nbuffered: usize,
    last_flush: Instant,
    err: Option<ProxyError>,
}

impl BackendWriter {
    fn new(io: OwnedWriteHalf, capacity: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(capacity),
            nbuffered: 0,
            last_flush: Instant::now(),
            err: None,
        }
    }

    fn encode(&mut self, multi: &[Resp]) -> Result<(), ProxyError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        encode_multi_bulk(multi, &mut self.buf);
        self.nbuffered += 1;
        Ok(())
    }

    fn need_flush(&self) -> bool {
        self.nbuffered != 0
            && (self.nbuffered > MAX_BUFFERED || self.last_flush.elapsed() > MAX_FLUSH_INTERVAL)
    }

    async fn flush(&mut self, force: bool) -> Result<(), ProxyError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if !(force || self.need_flush()) {
            return Ok(());
        }
        if !self.buf.is_empty() {
            let outcome = match timeout(IO_TIMEOUT, self.io.write_all(&self.buf)).await {
                Err(_) => Err(ProxyError::WriteTimeout(
                    self.io
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_default(),
                )),
                Ok(Err(err)) => Err(err.into()),
                Ok(Ok(())) => Ok(()),
            };
            if let Err(err) = outcome {
                self.err = Some(err.clone());
                return Err(err);
            }
            self.buf.clear();
        }
        self.nbuffered = 0;
        self.last_flush = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn fake_backend_once<F>(handler: F) -> std::io::Result<String>
    where
        F: FnOnce(TcpStream) -> futures::future::BoxFuture<'static, ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                handler(socket).await;
            }
        });
        Ok(addr)
    }

    fn new_request(op: &str, parts: &[&[u8]]) -> Request {
        Request::new(op.to_string(), parts.iter().map(Resp::bulk).collect())
    }

    #[tokio::test]
    async fn completes_request_with_backend_reply() {
        let addr = fake_backend_once(|mut socket| {
            Box::pin(async move {
                let mut buf = vec![0u8; 1024];
                let n = socket.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
                socket.write_all(b"$3\r\nbar\r\n").await.unwrap();
            })
        })
        .await
        .unwrap();

        let conn = BackendConn::new(addr, BackendOptions::default());
        let r = new_request("GET", &[&b"GET"[..], &b"foo"[..]]);
        conn.push_back(r.clone()).await;
        r.wait_batch().await;
        assert_eq!(r.take_response().unwrap(), Resp::bulk(b"bar"));
        conn.close();
    }

    #[tokio::test]
    async fn replies_follow_send_order() {
        let addr = fake_backend_once(|mut socket| {
            Box::pin(async move {
                let mut total = Vec::new();
                let mut buf = vec![0u8; 4096];
                while total.iter().filter(|&&b| b == b'*').count() < 3 {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    total.extend_from_slice(&buf[..n]);
                }
                socket
                    .write_all(b":1\r\n:2\r\n:3\r\n")
                    .await
                    .unwrap();
            })
        })
        .await
        .unwrap();

        let conn = BackendConn::new(addr, BackendOptions::default());
        let requests: Vec<Request> = (0..3)
            .map(|_| new_request("INCR", &[&b"INCR"[..], &b"c"[..]]))
            .collect();
        for r in &requests {
            conn.push_back(r.clone()).await;
        }
        for (i, r) in requests.iter().enumerate() {
            r.wait_batch().await;
            assert_eq!(r.take_response().unwrap(), Resp::Integer(i as i64 + 1));
        }
        conn.close();
    }

    #[tokio::test]
    async fn broken_requests_are_discarded_without_transmission() {
        let addr = fake_backend_once(|mut socket| {
            Box::pin(async move {
                let mut buf = vec![0u8; 1024];
                let n = socket.read(&mut buf).await.unwrap();
                // only the healthy request ever reaches the wire
                assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
                socket.write_all(b"+PONG\r\n").await.unwrap();
                // hold the socket open so the proxy side stays connected
                let _ = socket.read(&mut buf).await;
            })
        })
        .await
        .unwrap();

        let conn = BackendConn::new(addr, BackendOptions::default());
        let healthy = new_request("PING", &[&b"PING"[..]]);
        conn.push_back(healthy.clone()).await;
        healthy.wait_batch().await;
        assert_eq!(healthy.take_response().unwrap(), Resp::pong());

        let broken = new_request("SET", &[&b"SET"[..], &b"k"[..], &b"v"[..]]);
        broken.mark_broken();
        conn.push_back(broken.clone()).await;
        broken.wait_batch().await;
        assert_eq!(
            broken.take_response().unwrap_err(),
            ProxyError::DiscardedRequest
        );
        conn.close();
    }

    #[tokio::test]
    async fn wire_error_fails_request_and_later_attempt_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // first connection: read the command, then drop without replying
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 1024];
                let _ = socket.read(&mut buf).await;
            }
            // second connection: behave
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(b"+OK\r\n").await;
            }
        });

        let conn = BackendConn::new(addr, BackendOptions::default());
        let r1 = new_request("SET", &[&b"SET"[..], &b"x"[..], &b"1"[..]]);
        conn.push_back(r1.clone()).await;
        r1.wait_batch().await;
        assert!(r1.take_response().is_err());

        // the next request still rides the dead round and fails fast
        let r2 = new_request("SET", &[&b"SET"[..], &b"x"[..], &b"1"[..]]);
        conn.push_back(r2.clone()).await;
        r2.wait_batch().await;
        assert!(r2.take_response().is_err());

        // a later one (fresh broken flag) succeeds after reconnect; wait
        // out the supervisor drain and its backoff first
        sleep(Duration::from_millis(400)).await;
        let r3 = new_request("SET", &[&b"SET"[..], &b"x"[..], &b"1"[..]]);
        conn.push_back(r3.clone()).await;
        r3.wait_batch().await;
        assert_eq!(r3.take_response().unwrap(), Resp::ok());
        conn.close();
    }
}
