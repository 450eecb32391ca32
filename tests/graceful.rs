//! End to end shutdown tests against a live server.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use graceful_serve::{
    ConnState, Error, GracefulListener, GracefulServer, Listener, Routines, Server, TlsSettings,
};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

mod common;

use common::{eventually, read_response, send_request, within, Recorder};

type Reply = Result<Response<Full<Bytes>>, Infallible>;

fn text(body: &'static str) -> Reply {
    Ok(Response::new(Full::new(Bytes::from_static(body.as_bytes()))))
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Handler which reports entering and sleeps before answering.
fn slow_handler(
    delay: Duration,
) -> (
    impl Fn(Request<Incoming>) -> std::pin::Pin<Box<dyn Future<Output = Reply> + Send>>
        + Clone
        + Send
        + Sync
        + 'static,
    mpsc::UnboundedReceiver<()>,
    Arc<AtomicBool>,
) {
    let (entered_tx, entered_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicBool::new(false));

    let f = finished.clone();
    let handler = move |_: Request<Incoming>| {
        let entered = entered_tx.clone();
        let finished = f.clone();
        Box::pin(async move {
            let _ = entered.send(());
            tokio::time::sleep(delay).await;
            finished.store(true, Ordering::SeqCst);
            text("slow")
        }) as std::pin::Pin<Box<dyn Future<Output = Reply> + Send>>
    };

    (handler, entered_rx, finished)
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_request() {
    let (handler, mut entered, finished) = slow_handler(Duration::from_millis(300));
    let server = Arc::new(GracefulServer::new("", service_fn(handler)));
    let (listener, addr) = bind().await;

    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    send_request(&mut client, "/", "").await;
    within(entered.recv()).await.unwrap();
    assert_eq!(server.in_flight(), 1);

    server.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.is_closing());
    assert!(!serving.is_finished());
    assert!(!finished.load(Ordering::SeqCst));

    // the listener is gone while the request drains
    assert!(TcpStream::connect(addr).await.is_err());

    let response = within(read_response(&mut client)).await.unwrap().unwrap();
    assert_eq!(response.body, "slow");

    within(serving).await.unwrap().unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(server.in_flight(), 0);
}

#[tokio::test]
async fn shutdown_without_connections_returns_promptly() {
    let (ready_tx, mut ready) = mpsc::unbounded_channel();
    let server = Arc::new(
        GracefulServer::new("127.0.0.1:0", service_fn(|_| async { text("ok") }))
            .with_ready_hook(ready_tx),
    );

    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.listen_and_serve().await }
    });

    let handle = within(ready.recv()).await.unwrap();
    assert!(handle.local_addr().is_some());
    assert!(!handle.is_closed());

    server.close();
    within(serving).await.unwrap().unwrap();
    assert!(handle.is_closed());
}

#[tokio::test]
async fn shutdown_waits_for_registered_routines() {
    let done = Arc::new(AtomicBool::new(false));

    let d = done.clone();
    let handler = service_fn(move |req: Request<Incoming>| {
        let done = d.clone();
        async move {
            let guard = req
                .extensions()
                .get::<Routines>()
                .expect("routines are attached to every request")
                .guard();

            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                done.store(true, Ordering::SeqCst);
                drop(guard);
            });

            text("accepted")
        }
    });

    let server = Arc::new(GracefulServer::new("", handler));
    let (listener, addr) = bind().await;
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    send_request(&mut client, "/", "").await;
    let response = within(read_response(&mut client)).await.unwrap().unwrap();
    assert_eq!(response.body, "accepted");
    assert!(server.in_flight() >= 1);

    server.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!serving.is_finished());
    assert!(!done.load(Ordering::SeqCst));

    within(serving).await.unwrap().unwrap();
    assert!(done.load(Ordering::SeqCst));
}

#[tokio::test]
async fn shutdown_waits_until_the_response_is_flushed() {
    // far more than the socket buffers take, most of it stays with the server
    const BODY_LEN: usize = 32 * 1024 * 1024;

    let body = Bytes::from(vec![b'x'; BODY_LEN]);
    let handler = service_fn(move |_: Request<Incoming>| {
        let body = body.clone();
        async move { Ok::<_, Infallible>(Response::new(Full::new(body))) }
    });

    let server = Arc::new(GracefulServer::new("", handler));
    let (listener, addr) = bind().await;
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    send_request(&mut client, "/", "Connection: close\r\n").await;

    // the handler returned long ago but the client has not read anything yet
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.in_flight(), 1);

    server.close();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!serving.is_finished());

    let mut received = Vec::new();
    within(client.read_to_end(&mut received)).await.unwrap();
    assert!(received.len() > BODY_LEN);
    assert!(received.ends_with(b"xxxx"));

    within(serving).await.unwrap().unwrap();
    assert_eq!(server.in_flight(), 0);
}

#[tokio::test]
async fn configured_server_is_preserved() {
    let recorder = Recorder::default();
    let settings = TlsSettings {
        alpn_protocols: Some(vec![b"h2".to_vec(), b"http/1.1".to_vec()]),
        ..Default::default()
    };

    let server = Server::new("", service_fn(|_| async { text("ok") }))
        .with_header_read_timeout(Duration::from_secs(5))
        .with_max_buf_size(16 * 1024)
        .with_tls(settings.clone())
        .with_conn_state_hook(recorder.hook());
    let server = Arc::new(GracefulServer::with_server(server));

    assert_eq!(server.server().header_read_timeout(), Some(Duration::from_secs(5)));
    assert_eq!(server.server().max_buf_size(), Some(16 * 1024));
    assert_eq!(server.server().tls_settings(), Some(&settings));
    assert_eq!(server.server().tls_settings().unwrap().resolve(), settings);

    let (listener, addr) = bind().await;
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    // the installed hook keeps receiving transitions next to the tracker
    let mut client = TcpStream::connect(addr).await.unwrap();
    send_request(&mut client, "/", "Connection: close\r\n").await;
    let response = within(read_response(&mut client)).await.unwrap().unwrap();
    assert_eq!(response.status(), 200);

    eventually(|| recorder.first_connection().last() == Some(&ConnState::Closed)).await;
    assert_eq!(
        recorder.first_connection(),
        vec![ConnState::New, ConnState::Active, ConnState::Idle, ConnState::Closed]
    );

    server.close();
    within(serving).await.unwrap().unwrap();
}

#[tokio::test]
async fn tls_construction_errors_do_not_start_serving() {
    let server = GracefulServer::new("127.0.0.1:0", service_fn(|_| async { text("ok") }));
    let missing = std::env::temp_dir().join("graceful-serve-does-not-exist.pem");

    let err = server
        .listen_and_serve_tls(&missing, &missing)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Certificate { ref path, .. } if *path == missing));
    assert!(!server.is_closing());
    assert_eq!(server.in_flight(), 0);
}

#[tokio::test]
async fn connection_going_idle_during_shutdown_is_closed() {
    let recorder = Recorder::default();
    let (handler, mut entered, _) = slow_handler(Duration::from_millis(200));
    let server = Server::new("", service_fn(handler)).with_conn_state_hook(recorder.hook());
    let server = Arc::new(GracefulServer::with_server(server));
    let (listener, addr) = bind().await;

    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    send_request(&mut client, "/", "").await;
    within(entered.recv()).await.unwrap();

    server.close();
    let response = within(read_response(&mut client)).await.unwrap().unwrap();
    assert_eq!(response.body, "slow");

    // a second request on the same connection is never handled
    let _ = client
        .write_all(b"GET /again HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await;
    let second = within(read_response(&mut client)).await;
    assert!(!matches!(second, Ok(Some(_))));

    within(serving).await.unwrap().unwrap();
    eventually(|| recorder.first_connection().last() == Some(&ConnState::Closed)).await;
    assert_eq!(
        recorder.first_connection(),
        vec![ConnState::New, ConnState::Active, ConnState::Idle, ConnState::Closed]
    );
}

#[tokio::test]
async fn idle_keep_alive_connection_does_not_block_shutdown() {
    let server = Arc::new(GracefulServer::new("", service_fn(|_| async { text("ok") })));
    let (listener, addr) = bind().await;
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    send_request(&mut client, "/", "").await;
    within(read_response(&mut client)).await.unwrap().unwrap();
    eventually(|| server.in_flight() == 0).await;

    server.close();
    within(serving).await.unwrap().unwrap();
    assert!(!server.server().keep_alives_enabled());

    // keep-alive was switched off, the idle connection gets closed
    assert!(within(read_response(&mut client)).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_close_is_idempotent() {
    let server = Arc::new(GracefulServer::new("", service_fn(|_| async { text("ok") })));
    let (listener, _) = bind().await;
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let closers: Vec<_> = (0..8)
        .map(|i| {
            let server = server.clone();
            let handle = server.shutdown_handle();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    server.close();
                } else {
                    handle.close();
                }
            })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    within(serving).await.unwrap().unwrap();
    server.close();
}

#[tokio::test]
async fn closing_a_supplied_graceful_listener_stops_the_server() {
    let server = Arc::new(GracefulServer::new("", service_fn(|_| async { text("ok") })));
    let (listener, _) = bind().await;
    let listener = GracefulListener::new(listener);
    let handle = listener.handle();

    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.close();
    within(serving).await.unwrap().unwrap();
}

struct BrokenListener;

impl Listener for BrokenListener {
    type Io = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send {
        async { Err(io::Error::from(io::ErrorKind::PermissionDenied)) }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::Error::from(io::ErrorKind::NotConnected))
    }
}

#[tokio::test]
async fn fatal_accept_error_is_returned_without_draining() {
    let server = GracefulServer::new("", service_fn(|_| async { text("ok") }));
    // would hang forever if the error path waited for the drain
    server.start_routine();

    let err = within(server.serve(BrokenListener)).await.unwrap_err();
    match err {
        Error::Accept(err) => assert_eq!(err.kind(), io::ErrorKind::PermissionDenied),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn upgraded_connection_is_reported_hijacked() {
    let recorder = Recorder::default();
    let handler = service_fn(|mut req: Request<Incoming>| async move {
        let upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            // the upgraded stream is dropped right away
            let _ = upgrade.await;
        });

        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "echo")
            .body(Full::new(Bytes::new()))
            .unwrap();
        Ok::<_, Infallible>(response)
    });

    let server = Server::new("", handler).with_conn_state_hook(recorder.hook());
    let server = Arc::new(GracefulServer::with_server(server));
    let (listener, addr) = bind().await;
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve(listener).await }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    send_request(&mut client, "/", "Connection: upgrade\r\nUpgrade: echo\r\n").await;
    let response = within(read_response(&mut client)).await.unwrap().unwrap();
    assert_eq!(response.status(), 101);

    eventually(|| recorder.first_connection().last() == Some(&ConnState::Hijacked)).await;
    assert_eq!(
        recorder.first_connection(),
        vec![ConnState::New, ConnState::Active, ConnState::Hijacked]
    );
    assert_eq!(server.in_flight(), 0);

    server.close();
    within(serving).await.unwrap().unwrap();
}
