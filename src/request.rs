// src/request.rs
//
// Core message records: requests, responses, credentials, and the per-request
// context map that couples producers to response handling.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

/// Context keys recognized by the pipeline. The context map itself is open
/// (unknown keys pass through untouched), but every key a component writes or
/// reads is one of these.
pub mod keys {
    pub const REQUEST_ID: &str = "x-og-request-id";
    pub const OBJECT_NAME: &str = "x-og-object-name";
    pub const OBJECT_SIZE: &str = "x-og-object-size";
    pub const CONTAINER_NAME: &str = "x-og-container-name";
    pub const CONTAINER_PREFIX: &str = "x-og-container-prefix";
    pub const CONTAINER_SUFFIX: &str = "x-og-container-suffix";
    pub const USERNAME: &str = "x-og-username";
    pub const PASSWORD: &str = "x-og-password";
    pub const KEYSTONE_TOKEN: &str = "x-og-keystone-token";
    pub const STORAGE_ACCOUNT_NAME: &str = "x-og-storage-account-name";
    pub const MULTIPART_REQUEST: &str = "x-og-multipart-request";
    pub const MULTIPART_UPLOAD_ID: &str = "x-og-multipart-upload-id";
    pub const MULTIPART_PART_NUMBER: &str = "x-og-multipart-part-number";
    pub const MULTIPART_PART_SIZE: &str = "x-og-multipart-part-size";
    pub const MULTIPART_MAX_PARTS: &str = "x-og-multipart-max-parts";
    pub const MULTIPART_CONTAINER: &str = "x-og-multipart-container";
    pub const MULTIPART_BODY_DATA_TYPE: &str = "x-og-multipart-body-data-type";
    pub const CONTENT_MD5: &str = "x-og-content-md5";
    pub const LEGAL_HOLD: &str = "x-og-legal-hold";
    pub const OBJECT_RETENTION: &str = "x-og-object-retention";
    pub const RESPONSE_BODY_CONSUMER: &str = "x-og-response-body-consumer";
}

/// Per-request metadata, written by context producers and read by downstream
/// components (auth, object manager, multipart supplier).
pub type Context = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Put,
    Get,
    Delete,
    Head,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Put => "PUT",
            Method::Get => "GET",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Post => "POST",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workload-level tag carried by every request for accounting. Multipart
/// steps are distinct operations so the summary can break them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Write,
    Read,
    Delete,
    Head,
    Overwrite,
    MetadataRead,
    MultipartWriteInitiate,
    MultipartWritePart,
    MultipartWriteComplete,
    MultipartWriteAbort,
}

pub const ALL_OPERATIONS: [Operation; 10] = [
    Operation::Write,
    Operation::Read,
    Operation::Delete,
    Operation::Head,
    Operation::Overwrite,
    Operation::MetadataRead,
    Operation::MultipartWriteInitiate,
    Operation::MultipartWritePart,
    Operation::MultipartWriteComplete,
    Operation::MultipartWriteAbort,
];

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Write => "write",
            Operation::Read => "read",
            Operation::Delete => "delete",
            Operation::Head => "head",
            Operation::Overwrite => "overwrite",
            Operation::MetadataRead => "metadata_read",
            Operation::MultipartWriteInitiate => "multipart_write_initiate",
            Operation::MultipartWritePart => "multipart_write_part",
            Operation::MultipartWriteComplete => "multipart_write_complete",
            Operation::MultipartWriteAbort => "multipart_write_abort",
        }
    }

    pub fn index(&self) -> usize {
        ALL_OPERATIONS.iter().position(|o| o == self).unwrap_or(0)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub username: Option<String>,
    pub password: Option<String>,
    pub keystone_token: Option<String>,
    pub storage_account_name: Option<String>,
}

impl Credential {
    pub fn basic(username: &str, password: &str) -> Self {
        Credential {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            ..Default::default()
        }
    }
}

/// An immutable HTTP request record. Headers are an ordered, case-sensitive
/// list; insertion order is preserved all the way into the signed URI.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: crate::body::Body,
    pub message_time: i64,
    pub operation: Operation,
    pub context: Context,
}

impl HttpRequest {
    pub fn builder(method: Method, uri: impl Into<String>, operation: Operation) -> Builder {
        Builder::new(method, uri.into(), operation)
    }

    /// Exact-match header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Case-insensitive header lookup, for signing code that must tolerate
    /// either `Date` or `date`.
    pub fn header_ignore_case(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path component of the uri (no scheme/authority, no query).
    pub fn uri_path(&self) -> &str {
        split_uri(&self.uri).0
    }

    /// Raw query string, if any.
    pub fn uri_query(&self) -> Option<&str> {
        split_uri(&self.uri).1
    }

    /// Host component of the uri authority, without any port.
    pub fn uri_host(&self) -> &str {
        let rest = match self.uri.find("://") {
            Some(i) => &self.uri[i + 3..],
            None => self.uri.as_str(),
        };
        let authority = rest.split(['/', '?']).next().unwrap_or(rest);
        authority.split(':').next().unwrap_or(authority)
    }
}

/// Splits an absolute uri into (path, query). The path of `http://h:80` is `/`.
pub fn split_uri(uri: &str) -> (&str, Option<&str>) {
    let rest = match uri.find("://") {
        Some(i) => &uri[i + 3..],
        None => uri,
    };
    let (path_start, _) = match rest.char_indices().find(|(_, c)| *c == '/' || *c == '?') {
        Some((i, _)) => (i, ()),
        None => return ("/", None),
    };
    let path_and_query = &rest[path_start..];
    match path_and_query.split_once('?') {
        Some((p, q)) => (if p.is_empty() { "/" } else { p }, Some(q)),
        None => (path_and_query, None),
    }
}

/// Request builder. Stamps an rfc1123 `Date` header from the message time at
/// build; an explicit `Date` set through `header()` replaces the stamp.
pub struct Builder {
    method: Method,
    uri: String,
    operation: Operation,
    headers: Vec<(String, String)>,
    body: crate::body::Body,
    message_time: i64,
    context: Context,
}

impl Builder {
    fn new(method: Method, uri: String, operation: Operation) -> Self {
        Builder {
            method,
            uri,
            operation,
            headers: Vec::new(),
            body: crate::body::Body::none(),
            message_time: Utc::now().timestamp_millis(),
            context: Context::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.headers.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.headers.push((key, value));
        }
        self
    }

    pub fn body(mut self, body: crate::body::Body) -> Self {
        self.body = body;
        self
    }

    pub fn message_time(mut self, epoch_ms: i64) -> Self {
        self.message_time = epoch_ms;
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn build(mut self) -> HttpRequest {
        if !self.headers.iter().any(|(k, _)| k == "Date") {
            self.headers
                .insert(0, ("Date".to_string(), rfc1123(self.message_time)));
        }
        HttpRequest {
            method: self.method,
            uri: self.uri,
            headers: self.headers,
            body: self.body,
            message_time: self.message_time,
            operation: self.operation,
            context: self.context,
        }
    }
}

/// Rfc1123 date line for the given epoch-millisecond timestamp, in GMT.
pub fn rfc1123(epoch_ms: i64) -> String {
    match Utc.timestamp_millis_opt(epoch_ms).single() {
        Some(dt) => dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        None => String::new(),
    }
}

/// A consumed HTTP response. The request id is echoed back in the context so
/// subscribers can correlate without holding the request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: bytes::Bytes,
    pub context: Context,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn status_class(&self) -> usize {
        (self.status_code as usize / 100).min(5)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}
