use crate::broadcaster::{Broadcaster, SinkHandle, Subscription};
use anyhow::{Context, Result};
use bytes::Bytes;
use dpvr_config::ServerConfig;
use hyper::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::Stream;
use tracing::info;

/// Where events are served and which origin may read them.
struct Route {
    path: String,
    origin: Option<String>,
}

/// HTTP endpoint streaming broadcaster frames as server-sent events.
pub struct StreamServer {
    incoming: AddrIncoming,
    broadcaster: Broadcaster,
    route: Arc<Route>,
}

impl StreamServer {
    pub async fn bind(config: &ServerConfig, broadcaster: Broadcaster) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("Failed to listen on {}:{}", config.host, config.port))?;
        let incoming = AddrIncoming::from_listener(listener)?;

        let server = Self {
            incoming,
            broadcaster,
            route: Arc::new(Route {
                path: config.path.clone(),
                origin: config.origin.clone(),
            }),
        };
        info!(
            "Server is listening on http://{}{}",
            server.local_addr(),
            server.route.path
        );
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.incoming.local_addr()
    }

    /// Serve until `shutdown` becomes `true`, then end every stream and wait for
    /// the connections to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let Self {
            incoming,
            broadcaster,
            route,
        } = self;

        let closing = broadcaster.clone();
        let make_service = make_service_fn(move |conn: &AddrStream| {
            let peer = conn.remote_addr();
            let broadcaster = broadcaster.clone();
            let route = route.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, peer, broadcaster.clone(), route.clone())
                }))
            }
        });

        Server::builder(incoming)
            .serve(make_service)
            .with_graceful_shutdown(async move {
                // A dropped sender also means shut down.
                let _ = shutdown.wait_for(|stop| *stop).await;
                // Open streams only finish once their subscription ends.
                closing.close_all();
            })
            .await
            .context("Stream server failed")?;

        info!("Stream server stopped");
        Ok(())
    }
}

async fn handle_request(
    req: Request<Body>,
    peer: SocketAddr,
    broadcaster: Broadcaster,
    route: Arc<Route>,
) -> Result<Response<Body>, hyper::http::Error> {
    // Query strings are part of the match: `/events?x=1` is not `/events`.
    let target = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path(), |pq| pq.as_str());
    if target != route.path {
        tracing::debug!(%peer, %target, "Unknown path");
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty());
    }

    // Register before answering so the client is live once it sees the headers.
    let Subscription { handle, frames } = broadcaster.subscribe();
    info!(%peer, subscribers = broadcaster.len(), "Client connected");

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, "keep-alive");
    if let Some(origin) = &route.origin {
        response = response.header(ACCESS_CONTROL_ALLOW_ORIGIN, origin.as_str());
    }
    response.body(Body::wrap_stream(EventStream {
        frames,
        handle,
        broadcaster,
        peer,
    }))
}

/// Response body of one client. Dropped by hyper when the connection ends,
/// which takes the client out of the registry.
struct EventStream {
    frames: mpsc::Receiver<Bytes>,
    handle: SinkHandle,
    broadcaster: Broadcaster,
    peer: SocketAddr,
}

impl Stream for EventStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.handle);
        info!(peer = %self.peer, "Client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpvr_imu::{EulerAngles, RotationEvent};
    use hyper::body::HttpBody;
    use hyper::Client;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct Running {
        addr: SocketAddr,
        broadcaster: Broadcaster,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<Result<()>>,
    }

    async fn start(origin: Option<&str>) -> Running {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            path: "/events".into(),
            origin: origin.map(str::to_owned),
        };
        let broadcaster = Broadcaster::new();
        let server = StreamServer::bind(&config, broadcaster.clone()).await.unwrap();
        let addr = server.local_addr();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(server.run(rx));
        Running {
            addr,
            broadcaster,
            shutdown,
            task,
        }
    }

    async fn get(addr: SocketAddr, target: &str) -> Response<Body> {
        let uri = format!("http://{addr}{target}").parse().unwrap();
        timeout(WAIT, Client::new().get(uri)).await.unwrap().unwrap()
    }

    /// Collect body chunks until one full event has arrived.
    async fn next_event(body: &mut Body) -> String {
        let mut out = Vec::new();
        while !out.ends_with(b"\n\n") {
            let chunk = timeout(WAIT, body.data())
                .await
                .unwrap()
                .expect("stream ended early")
                .unwrap();
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    }

    async fn wait_for_subscribers(broadcaster: &Broadcaster, count: usize) {
        timeout(WAIT, async {
            while broadcaster.len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn streams_published_events() {
        let server = start(None).await;
        let response = get(server.addr, "/events").await;

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[CACHE_CONTROL], "no-cache");
        assert_eq!(headers[CONNECTION], "keep-alive");
        assert!(!headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(server.broadcaster.len(), 1);

        let mut body = response.into_body();
        let event = RotationEvent {
            rotation: EulerAngles {
                roll: 0.1,
                pitch: 0.2,
                yaw: 0.3,
            },
        };
        assert_eq!(server.broadcaster.publish(&event).unwrap(), 1);
        assert_eq!(
            next_event(&mut body).await,
            "data: {\"rotation\":{\"roll\":0.1,\"pitch\":0.2,\"yaw\":0.3}}\n\n"
        );

        server.broadcaster.publish(&2).unwrap();
        assert_eq!(next_event(&mut body).await, "data: 2\n\n");
    }

    #[tokio::test]
    async fn two_clients_get_identical_frames() {
        let server = start(None).await;
        let mut a = get(server.addr, "/events").await.into_body();
        let mut b = get(server.addr, "/events").await.into_body();
        wait_for_subscribers(&server.broadcaster, 2).await;

        assert_eq!(server.broadcaster.publish(&json!({"k": "v"})).unwrap(), 2);
        let fa = next_event(&mut a).await;
        let fb = next_event(&mut b).await;
        assert_eq!(fa, fb);
    }

    #[tokio::test]
    async fn allowed_origin_is_echoed() {
        let server = start(Some("http://localhost:5173")).await;
        let response = get(server.addr, "/events").await;
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );
    }

    #[tokio::test]
    async fn other_paths_get_404_with_empty_body() {
        let server = start(None).await;
        for target in ["/", "/event", "/events/", "/events?x=1"] {
            let response = get(server.addr, target).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{target}");
            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert!(body.is_empty());
        }
        assert!(server.broadcaster.is_empty());
    }

    #[tokio::test]
    async fn accepts_bare_lf_request_lines() {
        let server = start(None).await;
        let mut client = TcpStream::connect(server.addr).await.unwrap();
        client
            .write_all(b"GET /events HTTP/1.1\nHost: localhost\n\n")
            .await
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = timeout(WAIT, client.read(&mut byte)).await.unwrap().unwrap();
            assert_ne!(n, 0, "connection closed early");
            head.push(byte[0]);
        }
        assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
        wait_for_subscribers(&server.broadcaster, 1).await;
    }

    #[tokio::test]
    async fn disconnect_unsubscribes() {
        let server = start(None).await;
        let response = get(server.addr, "/events").await;
        assert_eq!(server.broadcaster.len(), 1);

        drop(response);
        // Writes to the closed connection fail, which ends the response.
        timeout(WAIT, async {
            while !server.broadcaster.is_empty() {
                server.broadcaster.publish(&0).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_streams() {
        let server = start(None).await;
        let mut body = get(server.addr, "/events").await.into_body();

        server.shutdown.send(true).unwrap();

        let end = timeout(WAIT, body.data()).await.unwrap();
        assert!(end.is_none());
        timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
        assert!(server.broadcaster.is_empty());
    }
}
