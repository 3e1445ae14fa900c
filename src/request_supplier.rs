// src/request_supplier.rs
//
// Single-step request production. Context producers run first (in order),
// then the URI is assembled from the populated context, then body and
// headers are attached.
//
// URI shape:
//   scheme://[container.]host[:port]/[uri_root/][api_version/]
//       [storage_account/][container][/object][/][?k=v&...]
// Virtual-host style moves the container into the host and drops it from
// the path.

use std::collections::{HashMap, VecDeque};

use anyhow::{Context as _, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest, Md5};
use url::Url;

use crate::body::{Body, DataType};
use crate::config::Scheme;
use crate::request::{keys, Context, HttpRequest, Method, Operation};
use crate::suppliers::{ContextProducer, ValueSupplier};

/// MD5 digests of the fixed zero pattern, keyed by size. Bounded LRU so a
/// size-distributed workload cannot grow it without bound.
pub struct Md5Cache {
    capacity: usize,
    digests: HashMap<u64, String>,
    order: VecDeque<u64>,
}

impl Md5Cache {
    pub fn new(capacity: usize) -> Md5Cache {
        Md5Cache {
            capacity,
            digests: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, size: u64) -> String {
        if let Some(digest) = self.digests.get(&size) {
            let digest = digest.clone();
            self.touch(size);
            return digest;
        }
        let mut hasher = Md5::new();
        let mut remaining = size;
        let zeroes = [0u8; 8192];
        while remaining > 0 {
            let n = remaining.min(zeroes.len() as u64) as usize;
            hasher.update(&zeroes[..n]);
            remaining -= n as u64;
        }
        let digest = BASE64.encode(hasher.finalize());
        if self.digests.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.digests.remove(&oldest);
            }
        }
        self.digests.insert(size, digest.clone());
        self.order.push_back(size);
        digest
    }

    fn touch(&mut self, size: u64) {
        if let Some(pos) = self.order.iter().position(|&s| s == size) {
            self.order.remove(pos);
            self.order.push_back(size);
        }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// How the request body materializes once the context is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Zeroes,
    Random,
    Existing,
}

pub struct RequestSupplier {
    operation: Operation,
    method: Method,
    scheme: Scheme,
    host: ValueSupplier,
    port: Option<u16>,
    uri_root: Option<String>,
    api_version: Option<String>,
    context_producers: Vec<ContextProducer>,
    headers: Vec<(String, ValueSupplier)>,
    query_parameters: Vec<(String, Option<ValueSupplier>)>,
    trailing_slash: bool,
    virtual_host: bool,
    body: BodyKind,
    content_md5: bool,
    md5_cache: Md5Cache,
}

#[allow(clippy::too_many_arguments)]
impl RequestSupplier {
    pub fn new(
        operation: Operation,
        method: Method,
        scheme: Scheme,
        host: ValueSupplier,
        port: Option<u16>,
        uri_root: Option<String>,
        api_version: Option<String>,
        context_producers: Vec<ContextProducer>,
        headers: Vec<(String, ValueSupplier)>,
        query_parameters: Vec<(String, Option<ValueSupplier>)>,
        trailing_slash: bool,
        virtual_host: bool,
        body: BodyKind,
        content_md5: bool,
    ) -> RequestSupplier {
        RequestSupplier {
            operation,
            method,
            scheme,
            host,
            port,
            uri_root,
            api_version,
            context_producers,
            headers,
            query_parameters,
            trailing_slash,
            virtual_host,
            body,
            content_md5,
            md5_cache: Md5Cache::new(100),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn get(&mut self) -> Result<HttpRequest> {
        let mut ctx = Context::new();
        for producer in &mut self.context_producers {
            producer.apply(&mut ctx)?;
        }

        let uri = self.build_uri(&mut ctx)?;
        let mut builder = HttpRequest::builder(self.method, uri, self.operation);

        for (key, supplier) in &mut self.headers {
            builder = builder.header(key.clone(), supplier.get());
        }
        if let Some(retention) = ctx.get(keys::OBJECT_RETENTION) {
            builder = builder.header(keys::OBJECT_RETENTION, retention.clone());
        }
        if let Some(legal_hold) = ctx.get(keys::LEGAL_HOLD) {
            builder = builder.header(keys::LEGAL_HOLD, legal_hold.clone());
        }

        let body = self.make_body(&ctx);
        if body.data_type() != DataType::None {
            if self.content_md5 {
                builder = builder.header(keys::CONTENT_MD5, self.md5_cache.get(body.size()));
            }
            builder = builder.body(body);
        }

        for (key, value) in &ctx {
            builder = builder.context(key.clone(), value.clone());
        }
        Ok(builder.build())
    }

    fn make_body(&self, ctx: &Context) -> Body {
        let size = ctx
            .get(keys::OBJECT_SIZE)
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        match self.body {
            BodyKind::None => Body::none(),
            BodyKind::Zeroes => Body::zeroes(size),
            BodyKind::Random => Body::random(size),
            BodyKind::Existing => Body::existing(size),
        }
    }

    fn build_uri(&mut self, ctx: &mut Context) -> Result<String> {
        let container = ctx.get(keys::CONTAINER_NAME).cloned();
        let mut s = format!("{}://", self.scheme);
        if self.virtual_host {
            if let Some(container) = &container {
                s.push_str(container);
                s.push('.');
            }
        }
        s.push_str(&self.host.get());
        if let Some(port) = self.port {
            s.push_str(&format!(":{}", port));
        }
        if !self.virtual_host {
            s.push('/');
            if let Some(root) = &self.uri_root {
                s.push_str(root);
                s.push('/');
            }
            if let Some(version) = &self.api_version {
                s.push_str(version);
                s.push('/');
            }
            if let Some(account) = self.storage_account_path(ctx) {
                s.push_str(&account);
            }
            if let Some(container) = &container {
                s.push_str(container);
            }
        }
        if let Some(object) = ctx.get(keys::OBJECT_NAME) {
            s.push('/');
            s.push_str(object);
        }
        if self.trailing_slash {
            s.push('/');
        }

        let mut first = true;
        for (key, supplier) in &mut self.query_parameters {
            s.push(if first { '?' } else { '&' });
            first = false;
            s.push_str(key);
            if let Some(supplier) = supplier {
                s.push('=');
                s.push_str(&supplier.get());
            }
        }

        Url::parse(&s).with_context(|| format!("constructed an invalid uri [{}]", s))?;
        Ok(s)
    }

    fn storage_account_path(&self, ctx: &Context) -> Option<String> {
        match (ctx.get(keys::STORAGE_ACCOUNT_NAME), &self.api_version) {
            (Some(account), _) => Some(format!("{}/", account)),
            // vault-mode endpoints expect an account segment whenever an api
            // version is present, even unauthenticated
            (None, Some(_)) => Some("dummyaccount/".to_string()),
            (None, None) => None,
        }
    }
}
