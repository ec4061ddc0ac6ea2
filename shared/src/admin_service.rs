use crate::http::{make_boxed_error_response, make_json_response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Serves `/health`, `/ready` and `/status`.
pub struct AdminService<R, S, E> {
    is_ready: R,
    status: S,
    _error: PhantomData<E>,
}

impl<R, S, E> AdminService<R, S, E>
where
    R: Fn() -> bool,
    S: Fn() -> Value,
{
    pub fn new(is_ready: R, status: S) -> Self {
        Self {
            is_ready,
            status,
            _error: PhantomData,
        }
    }

    fn respond(&self, path: &str) -> Response<BoxBody<Bytes, E>>
    where
        E: 'static,
    {
        let ok_body = || Full::new(Bytes::from("ok\n")).map_err(|e| match e {}).boxed();

        match path {
            "/health" => Response::new(ok_body()),
            "/ready" => match (self.is_ready)() {
                true => Response::new(ok_body()),
                false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            "/status" => match serde_json::to_vec(&(self.status)()) {
                Ok(body) => make_json_response(body),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize status");
                    make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR)
                }
            },
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl<R, S, E> Service<Request<Incoming>> for AdminService<R, S, E>
where
    R: Fn() -> bool,
    S: Fn() -> Value,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.respond(req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}
