// src/client.rs
//
// The narrow seam between the request pipeline and the HTTP transport. The
// driver only ever sees this trait; the reqwest-backed implementation is the
// production transport, and tests substitute scripted clients.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::auth::HttpAuth;
use crate::request::{keys, Context, HttpRequest, HttpResponse, Method};

#[async_trait]
pub trait Client: Send + Sync {
    /// Executes one request and consumes the response body.
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;

    /// Stops accepting new submissions. Graceful shutdown lets in-flight
    /// exchanges finish; the driver has already drained them by the time
    /// this is called.
    async fn shutdown(&self, _graceful: bool) -> Result<()> {
        Ok(())
    }
}

pub struct HttpClient {
    http: reqwest::Client,
    auth: Arc<dyn HttpAuth>,
    refusing: AtomicBool,
}

impl HttpClient {
    pub fn new(auth: Arc<dyn HttpAuth>, timeout: Option<Duration>) -> Result<HttpClient> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(HttpClient {
            http: builder.build().context("failed to build http client")?,
            auth,
            refusing: AtomicBool::new(false),
        })
    }

    fn method(&self, method: Method) -> reqwest::Method {
        match method {
            Method::Put => reqwest::Method::PUT,
            Method::Get => reqwest::Method::GET,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
        }
    }
}

#[async_trait]
impl Client for HttpClient {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        anyhow::ensure!(
            !self.refusing.load(Ordering::Acquire),
            "client is shut down"
        );

        let mut builder = self
            .http
            .request(self.method(request.method), &request.uri);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        for (key, value) in self.auth.authorization_headers(request)? {
            builder = builder.header(&key, &value);
        }

        if request.body.size() > 0 {
            // the auth layer may wrap the stream (chunked signing), which
            // changes the wire length
            let mut reader = self
                .auth
                .wrap_reader(request, Box::new(request.body.reader()))?;
            let mut wire = Vec::with_capacity(self.auth.content_length(request) as usize);
            reader
                .read_to_end(&mut wire)
                .context("failed to materialize request body")?;
            builder = builder
                .header(reqwest::header::CONTENT_LENGTH, wire.len())
                .body(wire);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", request.method, request.uri))?;
        let status_code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .context("failed to consume response body")?;

        let mut context = Context::new();
        if let Some(id) = request.context.get(keys::REQUEST_ID) {
            context.insert(keys::REQUEST_ID.to_string(), id.clone());
        }
        Ok(HttpResponse {
            status_code,
            headers,
            body,
            context,
        })
    }

    async fn shutdown(&self, _graceful: bool) -> Result<()> {
        self.refusing.store(true, Ordering::Release);
        Ok(())
    }
}
