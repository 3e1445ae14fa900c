// src/auth/mod.rs
//
// Request signing. Implementations canonicalize the request, compute the
// signature, and hand back the headers to attach; the v4 signer can also
// wrap the body stream for chunked signing.

pub mod v2;
pub mod v4;

use std::io::Read;

use anyhow::{anyhow, Result};

use crate::request::{keys, HttpRequest};

pub trait HttpAuth: Send + Sync {
    /// Headers this scheme adds to the request (Authorization and friends).
    fn authorization_headers(&self, request: &HttpRequest) -> Result<Vec<(String, String)>>;

    /// Wraps the body stream; the default is pass-through.
    fn wrap_reader(
        &self,
        _request: &HttpRequest,
        reader: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Read + Send>> {
        Ok(reader)
    }

    /// Content length of the wire body, accounting for any wrapping.
    fn content_length(&self, request: &HttpRequest) -> u64 {
        request.body.size()
    }
}

/// Anonymous access: no headers added.
pub struct NoAuth;

impl HttpAuth for NoAuth {
    fn authorization_headers(&self, _request: &HttpRequest) -> Result<Vec<(String, String)>> {
        Ok(Vec::new())
    }
}

/// Pulls the access key pair out of the request context, where the credential
/// producer placed it.
pub fn credential_from_context(request: &HttpRequest) -> Result<(String, String)> {
    let access_key = request
        .context
        .get(keys::USERNAME)
        .ok_or_else(|| anyhow!("request context is missing {}", keys::USERNAME))?;
    let secret_key = request
        .context
        .get(keys::PASSWORD)
        .ok_or_else(|| anyhow!("request context is missing {}", keys::PASSWORD))?;
    Ok((access_key.clone(), secret_key.clone()))
}

/// Header lookup by exact key, then by lowercased key.
pub(crate) fn header_or<'a>(
    request: &'a HttpRequest,
    key: &str,
    default: &'a str,
) -> &'a str {
    if let Some(v) = request.header(key) {
        return v;
    }
    if let Some(v) = request.header(&key.to_ascii_lowercase()) {
        return v;
    }
    default
}
