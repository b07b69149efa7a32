use crate::error::HandlerError;
use crate::http::request::Request;
use crate::http::response::Response;

/// Application code invoked once per fully received request.
///
/// Runs on the worker pool, never on the event loop, so it may block. The
/// request is owned; nothing about the connection outlives the call.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Result<Response, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        self(request)
    }
}

/// Answers every request with a short greeting.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hello;

impl Handler for Hello {
    fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        tracing::debug!(
            method = request.method.as_str(),
            path = %request.path,
            body_bytes = request.content_length(),
            "Handling request"
        );
        Ok(Response::ok("Hello from idlegate\n"))
    }
}
