//! HTTP listener that drives the proxy hooks
//!
//! Plain HTTP requests are fully intercepted: hooks run before forwarding and
//! once the response is known. CONNECT tunnels are relayed untouched.

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::session::{ProxyResponse, ProxySession};
use super::{ProxyService, RequestInterceptor, ResponseObserver};
use crate::browser::INSTANCE_HEADER;
use crate::error::{HalberdError, Result};
use crate::http::HttpHeaders;

/// Dropped before forwarding; bodies must come back uncompressed to be inspected
const STRIPPED_HEADERS: &[&str] = &[
    "proxy-connection",
    "connection",
    "keep-alive",
    "host",
    "accept-encoding",
];

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Running listener. Dropping the handle also stops it.
pub struct ServerHandle {
    port: u16,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Signals the accept loop to stop without waiting for it
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Signals the accept loop and waits until the listener is released
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            debug!("Proxy accept loop ended abnormally: {e}");
        }
    }
}

pub struct ProxyServer;

impl ProxyServer {
    /// Binds `127.0.0.1:port` and serves proxy traffic until shut down
    pub async fn bind(port: u16, service: Arc<ProxyService>) -> Result<ServerHandle> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HalberdError::ProxyError(format!("Failed to bind to {addr}: {e}")))?;

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .http1_title_case_headers()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let (stream, client_addr) = match accepted {
                            Ok(conn) => conn,
                            Err(e) => {
                                warn!("Proxy accept failed: {e}");
                                continue;
                            }
                        };
                        let service = Arc::clone(&service);
                        let client = client.clone();
                        tokio::spawn(serve_connection(stream, client_addr, service, client));
                    }
                }
            }
        });

        Ok(ServerHandle {
            port,
            shutdown_tx,
            task,
        })
    }
}

async fn serve_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    service: Arc<ProxyService>,
    client: reqwest::Client,
) {
    let io = TokioIo::new(stream);
    let handler = service_fn(move |req: Request<Incoming>| {
        let service = Arc::clone(&service);
        let client = client.clone();
        handle_request(req, service, client)
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, handler)
        .with_upgrades()
        .await
    {
        let err_str = e.to_string();
        if !err_str.contains("connection closed") && !err_str.contains("early eof") {
            debug!("Connection error from {client_addr}: {e}");
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    service: Arc<ProxyService>,
    client: reqwest::Client,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() == Method::CONNECT {
        Ok(handle_connect(req))
    } else {
        handle_http(req, service, client).await
    }
}

/// Builds the absolute request URL, falling back to the Host header for origin-form URIs
fn absolute_url(req: &Request<Incoming>) -> String {
    let uri = req.uri().to_string();
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri
    } else {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{host}{uri}")
    }
}

async fn handle_http(
    req: Request<Incoming>,
    service: Arc<ProxyService>,
    client: reqwest::Client,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().to_string();
    let url = absolute_url(&req);

    let mut headers = HttpHeaders::from(req.headers());
    let process_id = headers
        .get(INSTANCE_HEADER)
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0);
    headers.remove(INSTANCE_HEADER);
    for name in STRIPPED_HEADERS {
        headers.remove(name);
    }

    let body = match req.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            (!bytes.is_empty()).then(|| bytes.to_vec())
        }
        Err(e) => {
            error!("Failed to read request body: {e}");
            None
        }
    };

    let mut session = ProxySession::new(process_id, method, url, headers);
    session.request.body = body;

    service.before_request(&mut session);
    if session.response.is_none() {
        session.response = Some(forward(&client, &session).await);
    }
    service.before_response(&mut session);

    let response = session
        .response
        .unwrap_or_else(|| ProxyResponse::new(502, HttpHeaders::new(), b"Bad Gateway".to_vec()));
    Ok(to_hyper_response(response))
}

/// Sends the (already rewritten) request upstream
async fn forward(client: &reqwest::Client, session: &ProxySession) -> ProxyResponse {
    let request = &session.request;
    let method =
        reqwest::Method::from_bytes(request.method.as_bytes()).unwrap_or(reqwest::Method::GET);

    let mut upstream = client.request(method, &request.url);
    for (key, value) in request.headers.iter() {
        upstream = upstream.header(key, value);
    }
    if let Some(ref body) = request.body {
        upstream = upstream.body(body.clone());
    }

    match upstream.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let headers = HttpHeaders::from(resp.headers());
            let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            ProxyResponse::new(status, headers, body)
        }
        Err(e) => {
            warn!("Failed to forward request to {}: {e}", request.url);
            let headers: HttpHeaders = [("Content-Type", "text/plain")].into_iter().collect();
            ProxyResponse::new(502, headers, format!("Bad Gateway: {e}").into_bytes())
        }
    }
}

fn to_hyper_response(response: ProxyResponse) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(response.status);
    for (key, value) in response.headers.iter() {
        if key.eq_ignore_ascii_case("transfer-encoding") || key.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        builder = builder.header(key, value);
    }
    builder
        .body(Full::new(Bytes::from(response.body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Proxy Error"))))
}

/// Relays a CONNECT tunnel without inspecting it
fn handle_connect(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();

    debug!("CONNECT tunnel to {target}");

    tokio::task::spawn(async move {
        match TcpStream::connect(&target).await {
            Ok(mut upstream) => match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut upgraded = TokioIo::new(upgraded);
                    let (mut client_read, mut client_write) = tokio::io::split(&mut upgraded);
                    let (mut server_read, mut server_write) = tokio::io::split(&mut upstream);

                    let client_to_server = tokio::io::copy(&mut client_read, &mut server_write);
                    let server_to_client = tokio::io::copy(&mut server_read, &mut client_write);

                    let _ = tokio::try_join!(client_to_server, server_to_client);
                }
                Err(e) => error!("CONNECT upgrade failed: {e}"),
            },
            Err(e) => error!("Failed to connect to {target}: {e}"),
        }
    });

    Response::builder()
        .status(200)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
