//! Serve a tower service of [`Request`](crate::body::Request)s on a hyper
//! connection.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::body::Incoming;
use tower::util::Oneshot;
use tower::ServiceExt as _;

use crate::body::{Body, Request};

/// A hyper service which converts the incoming body to [`Body`] and calls the
/// wrapped tower service.
#[derive(Debug, Clone)]
pub struct HyperService<S> {
    service: S,
}

impl<S> HyperService<S> {
    /// Wrap a tower service.
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S> hyper::service::Service<http::Request<Incoming>> for HyperService<S>
where
    S: tower::Service<Request> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = HyperServiceFuture<S>;

    fn call(&self, req: http::Request<Incoming>) -> Self::Future {
        HyperServiceFuture {
            future: self.service.clone().oneshot(req.map(Body::new)),
        }
    }
}

/// Future returned by [`HyperService`].
#[pin_project::pin_project]
#[derive(Debug)]
pub struct HyperServiceFuture<S>
where
    S: tower::Service<Request>,
{
    #[pin]
    future: Oneshot<S, Request>,
}

impl<S> Future for HyperServiceFuture<S>
where
    S: tower::Service<Request>,
{
    type Output = Result<S::Response, S::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().future.poll(cx)
    }
}
