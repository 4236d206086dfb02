//! Glue from the TCP byte stream to HTTP parsing and the user callback.
//!
//! Each connection gets a fresh [`HttpContext`] in its opaque context
//! slot when it comes up. On every message event the context consumes
//! what it can; each completed request is dispatched, serialized, and
//! sent, and the loop continues in case more pipelined requests are
//! already buffered (edge-triggered reads deliver them in one burst).
//! Malformed requests get a literal 400 and a half-close.

use crate::metrics;
use net::{Buffer, EventLoop, LoopHandle, TcpConnection, TcpServer, Timestamp};
use protocol_http::{HttpContext, HttpRequest, HttpResponse, ParseError, Version};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Receives each parsed request and fills in the response.
pub type HttpCallback = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

enum Step {
    NeedMore,
    MissingContext,
    Malformed(ParseError),
    Complete(HttpRequest),
}

pub struct HttpServer {
    tcp: TcpServer,
}

impl HttpServer {
    pub fn new(base: LoopHandle, addr: SocketAddr, name: &str, callback: HttpCallback) -> Self {
        let mut tcp = TcpServer::new(base, addr, name);

        tcp.set_connection_callback(Arc::new(|conn, _event_loop| {
            if conn.connected() {
                metrics::CONNECTIONS_ACCEPTED.increment();
                metrics::CONNECTIONS_ACTIVE.increment();
                debug!(conn = %conn.name(), peer = %conn.peer_addr(), "connection up");
                conn.set_context(HttpContext::new());
            } else {
                metrics::CONNECTIONS_ACTIVE.decrement();
                debug!(conn = %conn.name(), peer = %conn.peer_addr(), "connection down");
            }
        }));

        tcp.set_message_callback(Arc::new(move |conn, event_loop, receive_time| {
            on_message(&callback, conn, event_loop, receive_time);
        }));

        Self { tcp }
    }

    pub fn set_thread_num(&mut self, threads: usize) {
        self.tcp.set_thread_num(threads);
    }

    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.tcp.set_idle_timeout(timeout);
    }

    pub fn set_reuse_port(&mut self, on: bool) {
        self.tcp.set_reuse_port(on);
    }

    pub fn set_tcp_no_delay(&mut self, on: bool) {
        self.tcp.set_tcp_no_delay(on);
    }

    pub fn start(&mut self) -> io::Result<()> {
        self.tcp.start()
    }

    pub fn stop(&mut self) {
        self.tcp.stop();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn name(&self) -> &str {
        self.tcp.name()
    }
}

fn on_message(
    callback: &HttpCallback,
    conn: &mut TcpConnection,
    event_loop: &mut EventLoop,
    receive_time: Timestamp,
) {
    loop {
        let step = {
            let (context, input) = conn.context_and_input::<HttpContext>();
            match context {
                None => Step::MissingContext,
                Some(context) => match context.parse(input, receive_time) {
                    Err(err) => Step::Malformed(err),
                    Ok(()) if context.got_all() => Step::Complete(context.take_request()),
                    Ok(()) => Step::NeedMore,
                },
            }
        };
        match step {
            Step::NeedMore => return,
            Step::MissingContext => {
                warn!(conn = %conn.name(), "connection has no http context");
                return;
            }
            Step::Malformed(err) => {
                metrics::PARSE_ERRORS.increment();
                debug!(conn = %conn.name(), error = %err, "rejecting malformed request");
                conn.send(event_loop, BAD_REQUEST_RESPONSE);
                conn.shutdown(event_loop);
                return;
            }
            Step::Complete(request) => {
                on_request(callback, conn, event_loop, &request);
                if !conn.connected() {
                    return;
                }
            }
        }
    }
}

/// Keep-alive policy: HTTP/1.1 stays open unless `Connection: close`;
/// HTTP/1.0 closes unless `Connection: Keep-Alive`.
fn on_request(
    callback: &HttpCallback,
    conn: &mut TcpConnection,
    event_loop: &mut EventLoop,
    request: &HttpRequest,
) {
    metrics::REQUESTS.increment();
    let connection_header = request.header("connection").unwrap_or("");
    let close = connection_header.eq_ignore_ascii_case("close")
        || (request.version() == Version::Http10
            && !connection_header.eq_ignore_ascii_case("keep-alive"));

    let mut response = HttpResponse::new(close);
    callback(request, &mut response);

    match response.status().code() {
        400..=499 => {
            metrics::RESPONSES_4XX.increment();
        }
        500..=599 => {
            metrics::RESPONSES_5XX.increment();
        }
        _ => {}
    }

    let mut out = Buffer::new();
    response.append_to(&mut out);
    conn.send_buffer(event_loop, &mut out);
    if response.close_connection() {
        conn.shutdown(event_loop);
    }
}
