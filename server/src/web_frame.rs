//! Top-level framework facade: route registration, request dispatch, and
//! the error-handler surface.

use crate::config::ServerConfig;
use crate::http_server::{HttpCallback, HttpServer};
use net::{EventLoop, LoopHandle};
use protocol_http::{HttpRequest, HttpResponse, Method, StatusCode};
use router::{Captures, RouteError, RouteMatch, Router};
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

/// A route handler. Returning `Err` routes to the exception handler; a
/// panic is caught and answered as an unknown internal error.
pub type Handler = Arc<dyn Fn(&mut RequestContext) -> HandlerResult + Send + Sync>;

/// Receives handler errors; writes the error response.
pub type ExceptionHandler = Arc<dyn Fn(&mut RequestContext, &HandlerError) + Send + Sync>;

/// What a handler sees: the immutable request, the mutable response, and
/// the path parameters captured by the router.
pub struct RequestContext<'a> {
    request: &'a HttpRequest,
    response: &'a mut HttpResponse,
    params: Captures,
}

impl<'a> RequestContext<'a> {
    pub fn request(&self) -> &HttpRequest {
        self.request
    }

    pub fn response(&mut self) -> &mut HttpResponse {
        self.response
    }

    /// A `:name` or `*name` capture from the matched route.
    pub fn path_variable(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.request.query(name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    /// Reply with a plain-text body.
    pub fn text(&mut self, status: StatusCode, body: impl Into<Vec<u8>>) {
        self.response.set_status(status);
        self.response.set_content_type("text/plain");
        self.response.set_body(body);
    }

    /// Reply with a JSON body (already serialized).
    pub fn json(&mut self, status: StatusCode, body: impl Into<Vec<u8>>) {
        self.response.set_status(status);
        self.response.set_content_type("application/json");
        self.response.set_body(body);
    }
}

pub struct WebFrame {
    config: ServerConfig,
    router: Router<Handler>,
    not_found: Handler,
    method_not_allowed: Handler,
    exception: ExceptionHandler,
}

impl WebFrame {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            config: config.clone(),
            router: Router::new(),
            not_found: Arc::new(default_not_found),
            method_not_allowed: Arc::new(default_method_not_allowed),
            exception: Arc::new(default_exception),
        }
    }

    pub fn get(
        &mut self,
        path: &str,
        handler: impl Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<(), RouteError> {
        self.route(path, Method::Get, handler)
    }

    pub fn post(
        &mut self,
        path: &str,
        handler: impl Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<(), RouteError> {
        self.route(path, Method::Post, handler)
    }

    pub fn put(
        &mut self,
        path: &str,
        handler: impl Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<(), RouteError> {
        self.route(path, Method::Put, handler)
    }

    pub fn delete(
        &mut self,
        path: &str,
        handler: impl Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<(), RouteError> {
        self.route(path, Method::Delete, handler)
    }

    pub fn head(
        &mut self,
        path: &str,
        handler: impl Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<(), RouteError> {
        self.route(path, Method::Head, handler)
    }

    pub fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: impl Fn(&mut RequestContext) -> HandlerResult + Send + Sync + 'static,
    ) -> Result<(), RouteError> {
        self.router.add_route(path, method, Arc::new(handler))
    }

    pub fn set_not_found_handler(&mut self, handler: Handler) {
        self.not_found = handler;
    }

    pub fn set_method_not_allowed_handler(&mut self, handler: Handler) {
        self.method_not_allowed = handler;
    }

    pub fn set_exception_handler(&mut self, handler: ExceptionHandler) {
        self.exception = handler;
    }

    /// Build the base loop, bind the listening socket, and start the
    /// server. Routes are frozen from here on. `BoundServer::run` must be
    /// called on this same thread.
    pub fn bind(self) -> io::Result<BoundServer> {
        let base = EventLoop::new()?;
        let dispatcher = Arc::new(Dispatcher {
            router: self.router,
            not_found: self.not_found,
            method_not_allowed: self.method_not_allowed,
            exception: self.exception,
        });
        let callback: HttpCallback =
            Arc::new(move |request, response| dispatcher.dispatch(request, response));

        let mut http = HttpServer::new(
            base.handle(),
            self.config.address,
            &self.config.name,
            callback,
        );
        http.set_thread_num(self.config.threads);
        http.set_idle_timeout(self.config.idle_timeout());
        http.set_reuse_port(self.config.reuse_port);
        http.set_tcp_no_delay(self.config.tcp_no_delay);
        http.start()?;

        let local_addr = http
            .local_addr()
            .ok_or_else(|| io::Error::other("server has no bound address"))?;
        info!(server = %http.name(), addr = %local_addr, "bound");
        Ok(BoundServer {
            base,
            http,
            local_addr,
        })
    }
}

/// A started server, ready to run its base loop.
pub struct BoundServer {
    base: EventLoop,
    http: HttpServer,
    local_addr: SocketAddr,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            base: self.base.handle(),
        }
    }

    /// Drive the base loop until `ServerHandle::quit`, then tear the
    /// server down.
    pub fn run(mut self) {
        self.base.run();
        self.http.stop();
    }
}

/// Cloneable, thread-safe stop handle for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    base: LoopHandle,
}

impl ServerHandle {
    pub fn quit(&self) {
        self.base.quit();
    }
}

struct Dispatcher {
    router: Router<Handler>,
    not_found: Handler,
    method_not_allowed: Handler,
    exception: ExceptionHandler,
}

impl Dispatcher {
    fn dispatch(&self, request: &HttpRequest, response: &mut HttpResponse) {
        match self.router.find_route(request.path(), request.method()) {
            RouteMatch::Found { handler, params } => {
                self.invoke(handler, request, response, params);
            }
            RouteMatch::MethodNotAllowed => {
                let handler = self.method_not_allowed.clone();
                self.invoke(&handler, request, response, Captures::new());
            }
            RouteMatch::PathNotFound => {
                let handler = self.not_found.clone();
                self.invoke(&handler, request, response, Captures::new());
            }
        }
    }

    fn invoke(
        &self,
        handler: &Handler,
        request: &HttpRequest,
        response: &mut HttpResponse,
        params: Captures,
    ) {
        let mut ctx = RequestContext {
            request,
            response,
            params,
        };
        match catch_unwind(AssertUnwindSafe(|| handler(&mut ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(path = request.path(), error = %err, "handler failed");
                (self.exception)(&mut ctx, &err);
            }
            Err(_) => {
                error!(path = request.path(), "handler panicked");
                ctx.response.set_status(StatusCode::InternalServerError);
                ctx.response.set_body("Unknown Internal Error");
            }
        }
    }
}

fn default_not_found(ctx: &mut RequestContext) -> HandlerResult {
    ctx.response.set_status(StatusCode::NotFound);
    ctx.response.set_body("404 Not Found");
    ctx.response.set_close_connection(true);
    Ok(())
}

fn default_method_not_allowed(ctx: &mut RequestContext) -> HandlerResult {
    ctx.response.set_status(StatusCode::MethodNotAllowed);
    ctx.response.set_body("405 Method Not Allowed");
    ctx.response.set_close_connection(true);
    Ok(())
}

fn default_exception(ctx: &mut RequestContext, err: &HandlerError) {
    ctx.response.set_status(StatusCode::InternalServerError);
    ctx.response.set_content_type("text/plain");
    ctx.response.set_body(err.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher_with(routes: Vec<(&str, Method, Handler)>) -> Dispatcher {
        let mut router = Router::new();
        for (path, method, handler) in routes {
            router.add_route(path, method, handler).unwrap();
        }
        Dispatcher {
            router,
            not_found: Arc::new(default_not_found),
            method_not_allowed: Arc::new(default_method_not_allowed),
            exception: Arc::new(default_exception),
        }
    }

    fn get_request(path: &str) -> HttpRequest {
        let mut ctx = protocol_http::HttpContext::new();
        let mut buf = net::Buffer::new();
        buf.append(format!("GET {path} HTTP/1.1\r\n\r\n").as_bytes());
        ctx.parse(&mut buf, net::Timestamp::now()).unwrap();
        ctx.take_request()
    }

    #[test]
    fn found_route_runs_the_handler() {
        let dispatcher = dispatcher_with(vec![(
            "/hello",
            Method::Get,
            Arc::new(|ctx: &mut RequestContext| {
                ctx.text(StatusCode::Ok, "hi");
                Ok(())
            }) as Handler,
        )]);
        let request = get_request("/hello");
        let mut response = HttpResponse::new(false);
        dispatcher.dispatch(&request, &mut response);
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.body(), b"hi");
    }

    #[test]
    fn handler_error_reaches_the_exception_handler() {
        let dispatcher = dispatcher_with(vec![(
            "/boom",
            Method::Get,
            Arc::new(|_: &mut RequestContext| -> HandlerResult {
                Err("database unavailable".into())
            }) as Handler,
        )]);
        let request = get_request("/boom");
        let mut response = HttpResponse::new(false);
        dispatcher.dispatch(&request, &mut response);
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(response.body(), b"database unavailable");
    }

    #[test]
    fn handler_panic_becomes_unknown_internal_error() {
        let dispatcher = dispatcher_with(vec![(
            "/panic",
            Method::Get,
            Arc::new(|_: &mut RequestContext| -> HandlerResult { panic!("boom") }) as Handler,
        )]);
        let request = get_request("/panic");
        let mut response = HttpResponse::new(false);
        dispatcher.dispatch(&request, &mut response);
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(response.body(), b"Unknown Internal Error");
    }

    #[test]
    fn misses_use_the_default_handlers() {
        let dispatcher = dispatcher_with(vec![(
            "/only-get",
            Method::Get,
            Arc::new(|_: &mut RequestContext| -> HandlerResult { Ok(()) }) as Handler,
        )]);

        let mut response = HttpResponse::new(false);
        dispatcher.dispatch(&get_request("/nope"), &mut response);
        assert_eq!(response.status(), StatusCode::NotFound);
        assert!(response.close_connection());

        // A POST against the GET-only route exercises the method miss.
        let mut ctx = protocol_http::HttpContext::new();
        let mut buf = net::Buffer::new();
        buf.append(b"POST /only-get HTTP/1.1\r\n\r\n");
        ctx.parse(&mut buf, net::Timestamp::now()).unwrap();
        let request = ctx.take_request();
        let mut response = HttpResponse::new(false);
        dispatcher.dispatch(&request, &mut response);
        assert_eq!(response.status(), StatusCode::MethodNotAllowed);
    }
}
