//! A local sync webhook backed by a closure.

use bytes::Bytes;
use decorator_controller_runtime::core::{HookRequest, HookResponse};
use http::{header, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle};

/// Serves until dropped.
pub struct Webhook {
    url: String,
    task: JoinHandle<()>,
}

type Respond = Arc<dyn Fn(HookRequest) -> HookResponse + Send + Sync>;

pub async fn serve(
    respond: impl Fn(HookRequest) -> HookResponse + Send + Sync + 'static,
) -> Webhook {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind webhook");
    let addr = listener.local_addr().expect("webhook must be bound");
    let respond: Respond = Arc::new(respond);

    let task = tokio::spawn(async move {
        loop {
            let Ok((io, _)) = listener.accept().await else {
                continue;
            };
            let respond = respond.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| handle(respond.clone(), req));
                if let Err(error) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(io), svc)
                    .await
                {
                    tracing::debug!(%error, "Webhook connection failed");
                }
            });
        }
    });

    Webhook {
        url: format!("http://{addr}/sync"),
        task,
    }
}

async fn handle(
    respond: Respond,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(error) => return Ok(error_response(StatusCode::BAD_REQUEST, error)),
    };
    let request = match serde_json::from_slice::<HookRequest>(&body) {
        Ok(request) => request,
        Err(error) => return Ok(error_response(StatusCode::BAD_REQUEST, error)),
    };
    let body = match serde_json::to_vec(&respond(request)) {
        Ok(body) => body,
        Err(error) => return Ok(error_response(StatusCode::INTERNAL_SERVER_ERROR, error)),
    };
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("response must be valid"))
}

fn error_response(status: StatusCode, error: impl std::fmt::Display) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::new(Bytes::from(error.to_string())));
    *rsp.status_mut() = status;
    rsp
}

// === impl Webhook ===

impl Webhook {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for Webhook {
    fn drop(&mut self) {
        self.task.abort();
    }
}
