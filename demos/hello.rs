use bytes::Bytes;
use graceful_serve::{GracefulServer, Routines};
use http_body_util::Full;
use hyper::{body::Incoming, service::service_fn, Request, Response};
use std::convert::Infallible;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

async fn hello(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    // a slow request, shutdown waits for it
    tokio::time::sleep(Duration::from_secs(2)).await;

    if let Some(routines) = req.extensions().get::<Routines>() {
        let guard = routines.guard();
        tokio::spawn(async move {
            tracing::info!("[audit] writing");
            tokio::time::sleep(Duration::from_secs(1)).await;
            tracing::info!("[audit] done");
            drop(guard);
        });
    }

    Ok(Response::new(Full::new(Bytes::from("Hello World!"))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = GracefulServer::new("127.0.0.1:3000", service_fn(hello));

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.close();
    });

    server.listen_and_serve().await?;

    println!("[hello] shutdown complete");
    Ok(())
}
