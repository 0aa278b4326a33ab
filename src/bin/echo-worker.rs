//! Reference worker used by the integration tests
//!
//! Speaks the worker contract and echoes every request back as JSON.
//!
//! Extra environment variables:
//! - ECHO_FAIL: report `Failed` instead of binding, then idle until interrupted
//! - ECHO_STARTUP_DELAY_MS: delay before binding (default: 0)
//! - ECHO_IGNORE_INTERRUPT: keep running after SIGINT

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use proxyhost::worker::{Readiness, WorkerContext};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ctx = Arc::new(WorkerContext::from_env()?);

    if let Some(delay) = std::env::var("ECHO_STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    if std::env::var_os("ECHO_FAIL").is_some() {
        eprintln!("echo-worker {}: refusing to start", ctx.namespace);
        ctx.signal(Readiness::Failed).await?;
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    let listener = ctx.bind_listener().await?;
    println!("echo-worker {} listening on {}", ctx.namespace, listener.local_addr()?);

    let ignore_interrupt = std::env::var_os("ECHO_IGNORE_INTERRUPT").is_some();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        eprintln!("echo-worker {}: accept failed: {}", ctx.namespace, e);
                        continue;
                    }
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let ctx = Arc::clone(&ctx);
                        async move { echo(req, &ctx).await }
                    });
                    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        eprintln!("echo-worker: connection error: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                if ignore_interrupt {
                    eprintln!("echo-worker {}: ignoring interrupt", ctx.namespace);
                    continue;
                }
                println!("echo-worker {} stopping", ctx.namespace);
                break;
            }
        }
    }

    Ok(())
}

async fn echo(req: Request<Incoming>, ctx: &WorkerContext) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(String::from);
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    let cookie = header("cookie");
    let forwarded_prefix = header("x-forwarded-prefix");
    let forwarded_for = header("x-forwarded-for");

    println!("{} {}", method, path);

    match ctx.local_path(&path) {
        "/redirect" => {
            return Ok(Response::builder()
                .status(StatusCode::FOUND)
                .header("location", ctx.mount_path("/target"))
                .body(Full::new(Bytes::new()))
                .expect("valid redirect"));
        }
        "/slow" => tokio::time::sleep(Duration::from_secs(3)).await,
        _ => {}
    }

    let body = req.into_body().collect().await?.to_bytes();
    let echoed = serde_json::json!({
        "namespace": ctx.namespace,
        "method": method,
        "path": path,
        "query": query,
        "cookie": cookie,
        "forwarded_prefix": forwarded_prefix,
        "forwarded_for": forwarded_for,
        "body": String::from_utf8_lossy(&body),
    });

    Ok(Response::builder()
        .header("content-type", "application/json")
        .header("set-cookie", format!("seen={}; Path={}", ctx.namespace, ctx.mount))
        .body(Full::new(Bytes::from(echoed.to_string())))
        .expect("valid echo response"))
}
