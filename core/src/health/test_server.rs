//! In-process HTTP server for health-check tests

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Serves `/health` with a status code tests can flip at runtime
pub(crate) struct TestServer {
    pub(crate) port: u16,
    status: Arc<AtomicU16>,
    hits: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub(crate) async fn start(initial_status: u16) -> Self {
        let status = Arc::new(AtomicU16::new(initial_status));
        let hits = Arc::new(AtomicU32::new(0));

        let (svc_status, svc_hits) = (status.clone(), hits.clone());
        let make_svc = make_service_fn(move |_conn| {
            let (status, hits) = (svc_status.clone(), svc_hits.clone());
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let (status, hits) = (status.clone(), hits.clone());
                    async move { Ok::<_, Infallible>(respond(&req, &status, &hits).await) }
                }))
            }
        });

        let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
        let port = server.local_addr().port();
        let task = tokio::spawn(async move {
            let _ = server.await;
        });

        Self { port, status, hits, task }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub(crate) fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond(req: &Request<Body>, status: &AtomicU16, hits: &AtomicU32) -> Response<Body> {
    let (code, body) = match req.uri().path() {
        "/health" => {
            hits.fetch_add(1, Ordering::SeqCst);
            let code = status.load(Ordering::SeqCst);
            let body = if (200..300).contains(&code) { "healthy" } else { "unhealthy" };
            (code, body)
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            (200, "late")
        }
        _ => (404, "not found"),
    };
    Response::builder()
        .status(code)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
