use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::BufWriter;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::metrics;
use crate::protocol::codec::{CommandCodec, RespCodec};
use crate::protocol::command::{get_op_str, is_not_allowed};
use crate::protocol::resp::Resp;
use crate::request::{Coalesce, Request};
use crate::route::Router;

/// Flush the reply sink at least this often when the client keeps reading.
const REPLY_FLUSH_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub product_auth: Option<String>,
    pub recv_bufsize: usize,
    pub send_bufsize: usize,
    pub max_bufsize: usize,
    pub max_pipeline: usize,
    pub keepalive_period_ms: u64,
    pub ping_local: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            product_auth: None,
            recv_bufsize: 64 * 1024,
            send_bufsize: 64 * 1024,
            max_bufsize: 100 * 1024 * 1024,
            max_pipeline: 1024,
            keepalive_period_ms: 0,
            ping_local: true,
        }
    }
}

/// Whether a handled command leaves the session readable.
enum Handled {
    Continue,
    CloseAfterDrain,
}

/// Serve one client connection to completion.
///
/// The reader side decodes commands through the multi-bulk entry point,
/// classifies them, and dispatches through the router; replies are written
/// strictly in arrival order. The pending queue is bounded by the pipeline
/// limit, which stalls the decoder and, through it, the client socket.
pub async fn handle(
    socket: TcpStream,
    router: Arc<Router>,
    options: SessionOptions,
) -> Result<(), ProxyError> {
    socket.set_nodelay(true).ok();
    if options.keepalive_period_ms > 0 {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_millis(options.keepalive_period_ms));
        socket2::SockRef::from(&socket).set_tcp_keepalive(&keepalive).ok();
    }
    let client = socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let _guard = metrics::FrontConnGuard::new();
    debug!(%client, "session start");

    let (read_half, write_half) = socket.into_split();
    let mut frames = FramedRead::with_capacity(
        read_half,
        CommandCodec::new(options.max_bufsize),
        options.recv_bufsize,
    );
    let mut sink = FramedWrite::new(
        BufWriter::with_capacity(options.send_bufsize, write_half),
        RespCodec::default(),
    );

    let mut authorized = options.product_auth.is_none();
    let mut pending: VecDeque<Request> = VecDeque::new();
    let mut stream_closed = false;
    let mut unflushed = 0usize;

    let result = loop {
        let front = pending.front().cloned();
        tokio::select! {
            _ = async { front.as_ref().expect("front checked").wait_batch().await }, if front.is_some() => {
                let r = pending.pop_front().expect("pending front exists");
                let reply = finalize(r);
                if let Err(err) = sink.feed(reply).await {
                    break Err(err);
                }
                unflushed += 1;
                // flush when no further reply is ready to follow, and at
                // least every REPLY_FLUSH_BATCH replies
                let next_ready = pending
                    .front()
                    .map(|next| next.batch().pending() == 0)
                    .unwrap_or(false);
                if !next_ready || unflushed >= REPLY_FLUSH_BATCH {
                    if let Err(err) = sink.flush().await {
                        break Err(err);
                    }
                    unflushed = 0;
                }
            }
            frame = frames.next(), if !stream_closed && pending.len() < options.max_pipeline => {
                match frame {
                    Some(Ok(multi)) => {
                        match handle_command(multi, &router, &options, &mut authorized, &mut pending).await {
                            Ok(Handled::Continue) => {}
                            Ok(Handled::CloseAfterDrain) => stream_closed = true,
                            Err(err) => break Err(err),
                        }
                    }
                    Some(Err(err)) => {
                        // structural decode failure: answer it, then stop
                        // reading; recovery would be ambiguous
                        metrics::global_error_incr();
                        let r = Request::new(String::new(), Vec::new());
                        r.set_error(err);
                        pending.push_back(r);
                        stream_closed = true;
                    }
                    None => stream_closed = true,
                }
            }
            else => break Ok(()),
        }
    };

    match result {
        Ok(()) => {
            sink.flush().await.ok();
            debug!(%client, "session end");
            Ok(())
        }
        Err(err) => {
            // abandon what is still queued; unsent requests short-circuit
            // at the backend writer
            for r in &pending {
                r.mark_broken();
            }
            warn!(%client, error = %err, "session aborted");
            Err(err)
        }
    }
}

/// Classify one decoded command and either answer it locally or dispatch
/// it. The request enters the pending queue before dispatch so the writer
/// observes arrival order.
async fn handle_command(
    multi: Vec<Resp>,
    router: &Arc<Router>,
    options: &SessionOptions,
    authorized: &mut bool,
    pending: &mut VecDeque<Request>,
) -> Result<Handled, ProxyError> {
    let op = match get_op_str(&multi) {
        Ok(op) => op,
        Err(err) => {
            metrics::global_error_incr();
            let r = Request::new(String::new(), multi);
            r.set_error(err);
            pending.push_back(r);
            return Ok(Handled::Continue);
        }
    };
    metrics::op_incr(&op);

    let r = Request::new(op, multi);
    pending.push_back(r.clone());

    if r.op() == "AUTH" {
        handle_auth(&r, options, authorized);
        return Ok(Handled::Continue);
    }
    if !*authorized {
        r.set_reply(Resp::error(b"NOAUTH Authentication required."));
        return Ok(Handled::Continue);
    }

    if is_not_allowed(r.op()) {
        metrics::global_error_incr();
        r.set_error(ProxyError::CommandNotAllowed(r.op().to_string()));
        return Ok(Handled::Continue);
    }

    match r.op() {
        "QUIT" => {
            r.set_reply(Resp::ok());
            Ok(Handled::CloseAfterDrain)
        }
        "PING" if options.ping_local && r.multi().len() == 1 => {
            r.set_reply(Resp::pong());
            Ok(Handled::Continue)
        }
        "SELECT" => {
            handle_select(&r);
            Ok(Handled::Continue)
        }
        "MGET" if r.multi().len() > 2 => {
            let subs: Vec<Request> = r.multi()[1..]
                .iter()
                .map(|key| r.sub_request(vec![r.multi()[0].clone(), key.clone()]))
                .collect();
            r.set_coalesce(Coalesce::MGet(subs.clone()));
            for sub in subs {
                router.dispatch(sub).await?;
            }
            Ok(Handled::Continue)
        }
        "MSET" => {
            let args = &r.multi()[1..];
            if args.is_empty() || args.len() % 2 != 0 {
                r.set_reply(Resp::error(
                    b"ERR wrong number of arguments for 'mset' command",
                ));
                return Ok(Handled::Continue);
            }
            if args.len() == 2 {
                router.dispatch(r).await?;
                return Ok(Handled::Continue);
            }
            let subs: Vec<Request> = args
                .chunks(2)
                .map(|pair| {
                    r.sub_request(vec![
                        r.multi()[0].clone(),
                        pair[0].clone(),
                        pair[1].clone(),
                    ])
                })
                .collect();
            r.set_coalesce(Coalesce::MSet(subs.clone()));
            for sub in subs {
                router.dispatch(sub).await?;
            }
            Ok(Handled::Continue)
        }
        "DEL" if r.multi().len() > 2 => {
            let subs: Vec<Request> = r.multi()[1..]
                .iter()
                .map(|key| r.sub_request(vec![r.multi()[0].clone(), key.clone()]))
                .collect();
            r.set_coalesce(Coalesce::Del(subs.clone()));
            for sub in subs {
                router.dispatch(sub).await?;
            }
            Ok(Handled::Continue)
        }
        _ => {
            router.dispatch(r).await?;
            Ok(Handled::Continue)
        }
    }
}

fn handle_auth(r: &Request, options: &SessionOptions, authorized: &mut bool) {
    let password = match options.product_auth.as_deref() {
        Some(password) => password,
        None => {
            r.set_reply(Resp::error(
                b"ERR Client sent AUTH, but no password is set",
            ));
            return;
        }
    };
    let presented = r.multi().get(1).and_then(Resp::as_bulk);
    match presented {
        Some(p) if p.as_ref() == password.as_bytes() => {
            *authorized = true;
            r.set_reply(Resp::ok());
        }
        _ => {
            *authorized = false;
            r.set_reply(Resp::error(b"ERR invalid password"));
        }
    }
}

/// Only database 0 exists behind the proxy.
fn handle_select(r: &Request) {
    let db = r.multi().get(1).and_then(Resp::as_bulk);
    match db {
        Some(db) if db.as_ref() == b"0" => r.set_reply(Resp::ok()),
        Some(_) => r.set_reply(Resp::error(b"ERR invalid DB index")),
        None => r.set_reply(Resp::error(
            b"ERR wrong number of arguments for 'select' command",
        )),
    }
}

/// Turn a completed request into the reply written to the client.
fn finalize(r: Request) -> Resp {
    if let Some(coalesce) = r.take_coalesce() {
        return match coalesce.merge() {
            Ok(resp) => resp,
            Err(err) => {
                metrics::global_error_incr();
                Resp::error(err.to_reply().as_bytes())
            }
        };
    }
    match r.take_response() {
        Ok(resp) => resp,
        Err(err) => {
            metrics::global_error_incr();
            Resp::error(err.to_reply().as_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_accepts_the_product_password() {
        let options = SessionOptions {
            product_auth: Some("pass".to_string()),
            ..SessionOptions::default()
        };
        let mut authorized = false;

        let r = Request::new(
            "AUTH".into(),
            vec![Resp::bulk(b"AUTH"), Resp::bulk(b"wrong")],
        );
        handle_auth(&r, &options, &mut authorized);
        assert!(!authorized);
        assert_eq!(r.take_response().unwrap(), Resp::error(b"ERR invalid password"));

        let r = Request::new(
            "AUTH".into(),
            vec![Resp::bulk(b"AUTH"), Resp::bulk(b"pass")],
        );
        handle_auth(&r, &options, &mut authorized);
        assert!(authorized);
        assert_eq!(r.take_response().unwrap(), Resp::ok());
    }

    #[test]
    fn auth_without_configured_password_is_an_error() {
        let options = SessionOptions::default();
        let mut authorized = true;
        let r = Request::new(
            "AUTH".into(),
            vec![Resp::bulk(b"AUTH"), Resp::bulk(b"any")],
        );
        handle_auth(&r, &options, &mut authorized);
        assert_eq!(
            r.take_response().unwrap(),
            Resp::error(b"ERR Client sent AUTH, but no password is set")
        );
    }

    #[test]
    fn select_only_serves_db_zero() {
        let r = Request::new(
            "SELECT".into(),
            vec![Resp::bulk(b"SELECT"), Resp::bulk(b"0")],
        );
        handle_select(&r);
        assert_eq!(r.take_response().unwrap(), Resp::ok());

        let r = Request::new(
            "SELECT".into(),
            vec![Resp::bulk(b"SELECT"), Resp::bulk(b"7")],
        );
        handle_select(&r);
        assert_eq!(
            r.take_response().unwrap(),
            Resp::error(b"ERR invalid DB index")
        );
    }

    #[test]
    fn finalize_renders_errors_as_resp_errors() {
        let r = Request::new("GET".into(), vec![Resp::bulk(b"GET"), Resp::bulk(b"k")]);
        r.set_error(ProxyError::CommandNotAllowed("KEYS".into()));
        assert_eq!(
            finalize(r),
            Resp::error(b"ERR command 'KEYS' not allowed")
        );
    }
}
