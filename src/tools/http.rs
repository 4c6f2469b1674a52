//! Minimal async HTTP(S) GET client used by the lock-source aggregator
//! (C8) to poll external lock endpoints.
//!
//! Adapted from the teacher's `tools/http.rs`: the same `tokio_openssl`
//! `SslStream`-over-`hyper::service::Service` idiom, with the proxy/CONNECT
//! tunneling machinery dropped — lock sources are polled directly and
//! SPEC_FULL.md has no proxy-chaining requirement (see DESIGN.md).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{bail, format_err, Error};
use futures::future::{BoxFuture, FutureExt};
use hyper::client::{Client, HttpConnector};
use hyper::{Body, Request, Uri};
use openssl::ssl::{SslConnector, SslMethod};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

pub struct SimpleHttp {
    client: Client<HttpsConnector, Body>,
}

impl SimpleHttp {
    pub const USER_AGENT: &'static str = "ddm-core/1.0";

    pub fn new() -> Result<Self, Error> {
        let ssl_connector = SslConnector::builder(SslMethod::tls())?.build();
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let connector = HttpsConnector { connector: http, ssl_connector: Arc::new(ssl_connector) };
        Ok(SimpleHttp { client: Client::builder().build(connector) })
    }

    pub async fn get_string(&self, uri: &str) -> Result<String, Error> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(hyper::header::USER_AGENT, Self::USER_AGENT)
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();
        if !status.is_success() {
            bail!("got status {} from {}", status, uri);
        }
        let body = hyper::body::to_bytes(response).await?;
        String::from_utf8(body.to_vec()).map_err(|err| format_err!("non-UTF8 response body: {}", err))
    }

    /// Returns the raw status code without treating non-2xx as an error;
    /// used by the lock-source aggregator's `lock_url` busy-poll (spec.md
    /// §4.5), which specifically distinguishes 404 from everything else.
    pub async fn get_status(&self, uri: &str) -> Result<u16, Error> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(hyper::header::USER_AGENT, Self::USER_AGENT)
            .body(Body::empty())?;
        let response = self.client.request(request).await?;
        Ok(response.status().as_u16())
    }
}

/// Either a plain TCP stream or one wrapped in TLS, selected per-request by
/// the destination URI's scheme.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut tokio::io::ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl hyper::client::connect::Connection for MaybeTlsStream {
    fn connected(&self) -> hyper::client::connect::Connected {
        hyper::client::connect::Connected::new()
    }
}

#[derive(Clone)]
struct HttpsConnector {
    connector: HttpConnector,
    ssl_connector: Arc<SslConnector>,
}

impl hyper::service::Service<Uri> for HttpsConnector {
    type Response = MaybeTlsStream;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.connector.poll_ready(ctx).map_err(Error::from)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let mut connector = self.connector.clone();
        let ssl_connector = Arc::clone(&self.ssl_connector);
        let is_https = dst.scheme() == Some(&http::uri::Scheme::HTTPS);
        let host = match dst.host() {
            Some(host) => host.to_owned(),
            None => return futures::future::err(format_err!("missing host in URL")).boxed(),
        };

        async move {
            let tcp_stream = connector.call(dst).await.map_err(|err| format_err!("connect failed: {}", err))?;
            if !is_https {
                return Ok(MaybeTlsStream::Plain(tcp_stream));
            }
            let config = ssl_connector.configure()?;
            let mut stream = SslStream::new(config.into_ssl(&host)?, tcp_stream)?;
            Pin::new(&mut stream).connect().await?;
            Ok(MaybeTlsStream::Tls(stream))
        }
        .boxed()
    }
}
