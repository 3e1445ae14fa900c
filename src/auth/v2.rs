// src/auth/v2.rs
//
// AWS signature version 2. Known limitations, kept deliberately: path-style
// requests only, non-subresource query parameters are not canonicalized, and
// x-amz-date is excluded from the canonicalized amz headers (the documented
// examples ignore it even though the text does not say so).

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::auth::{credential_from_context, header_or, HttpAuth};
use crate::request::HttpRequest;

const SUBRESOURCES: [&str; 15] = [
    "acl",
    "lifecycle",
    "location",
    "logging",
    "notification",
    "partNumber",
    "policy",
    "requestPayment",
    "torrent",
    "uploadId",
    "uploads",
    "versionId",
    "versioning",
    "versions",
    "website",
];

pub struct AwsV2Auth;

impl AwsV2Auth {
    pub fn new() -> AwsV2Auth {
        AwsV2Auth
    }

    pub fn string_to_sign(&self, request: &HttpRequest) -> String {
        let date = {
            let fallback = header_or(request, "Date", "");
            header_or(request, "X-Amz-Date", fallback)
        };
        format!(
            "{}\n{}\n{}\n{}\n{}{}",
            request.method,
            header_or(request, "Content-MD5", ""),
            header_or(request, "Content-Type", ""),
            date,
            canonicalized_amz_headers(request),
            canonicalized_resource(request),
        )
    }

    fn signature(&self, request: &HttpRequest, secret_key: &str) -> Result<String> {
        let mut mac = Hmac::<Sha1>::new_from_slice(secret_key.as_bytes())
            .map_err(|e| anyhow!("failed to key hmac-sha1: {}", e))?;
        mac.update(self.string_to_sign(request).as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}

impl Default for AwsV2Auth {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAuth for AwsV2Auth {
    fn authorization_headers(&self, request: &HttpRequest) -> Result<Vec<(String, String)>> {
        let (access_key, secret_key) = credential_from_context(request)?;
        let value = format!("AWS {}:{}", access_key, self.signature(request, &secret_key)?);
        Ok(vec![("Authorization".to_string(), value)])
    }
}

fn canonicalized_amz_headers(request: &HttpRequest) -> String {
    let mut canonical: BTreeMap<String, &str> = BTreeMap::new();
    for (key, value) in &request.headers {
        let key_lower = key.trim().to_ascii_lowercase();
        if key_lower.starts_with("x-amz-") && key_lower != "x-amz-date" {
            canonical.insert(key_lower, value.trim());
        }
    }
    let mut s = String::new();
    for (key, value) in canonical {
        s.push_str(&key);
        s.push(':');
        s.push_str(value);
        s.push('\n');
    }
    s
}

fn canonicalized_resource(request: &HttpRequest) -> String {
    let path = request.uri_path();
    let mut subresources: BTreeMap<&str, Option<&str>> = BTreeMap::new();
    for (key, value) in split_query(request.uri_query().unwrap_or("")) {
        if SUBRESOURCES.contains(&key) {
            subresources.insert(key, value);
        }
    }
    if subresources.is_empty() {
        return path.to_string();
    }
    let mut s = format!("{}?", path);
    for (i, (key, value)) in subresources.iter().enumerate() {
        if i > 0 {
            s.push('&');
        }
        s.push_str(key);
        if let Some(value) = value {
            s.push('=');
            s.push_str(value);
        }
    }
    s
}

/// Splits a raw query string into pairs. Keys without a value (`?torrent`)
/// stay bare rather than becoming `torrent=`.
pub fn split_query(query: &str) -> Vec<(&str, Option<&str>)> {
    if query.is_empty() {
        return Vec::new();
    }
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (part, None),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;
    use crate::request::{keys, Method, Operation};

    fn signed_request() -> HttpRequest {
        HttpRequest::builder(
            Method::Put,
            "http://127.0.0.1:8080/container/object?uploads",
            Operation::MultipartWriteInitiate,
        )
        .header("Date", "Thu, 30 Apr 2015 18:40:47 GMT")
        .header("Content-Type", "application/octet-stream")
        .header("x-amz-meta-color", " green ")
        .header("X-Amz-Meta-Alpha", "1")
        .body(Body::zeroes(10))
        .context(keys::USERNAME, "AKIDEXAMPLE")
        .context(keys::PASSWORD, "secret")
        .build()
    }

    #[test]
    fn string_to_sign_shape() {
        let auth = AwsV2Auth::new();
        let sts = auth.string_to_sign(&signed_request());
        assert_eq!(
            sts,
            "PUT\n\napplication/octet-stream\nThu, 30 Apr 2015 18:40:47 GMT\n\
             x-amz-meta-alpha:1\nx-amz-meta-color:green\n/container/object?uploads"
        );
    }

    #[test]
    fn x_amz_date_preferred_but_not_canonicalized() {
        let request = HttpRequest::builder(Method::Get, "http://h/c/o", Operation::Read)
            .header("Date", "ignored")
            .header("X-Amz-Date", "20150430T184047Z")
            .build();
        let sts = AwsV2Auth::new().string_to_sign(&request);
        assert!(sts.contains("\n20150430T184047Z\n"));
        assert!(!sts.contains("x-amz-date"));
    }

    #[test]
    fn subresources_sorted_and_bare_keys_kept() {
        let request = HttpRequest::builder(
            Method::Get,
            "http://h/c/o?uploadId=abc&torrent&ignored=1",
            Operation::Read,
        )
        .build();
        assert_eq!(
            canonicalized_resource(&request),
            "/c/o?torrent&uploadId=abc"
        );
    }

    #[test]
    fn non_subresource_queries_are_ignored() {
        let request =
            HttpRequest::builder(Method::Get, "http://h/c/o?prefix=x&max-keys=10", Operation::Read)
                .build();
        assert_eq!(canonicalized_resource(&request), "/c/o");
    }

    #[test]
    fn signature_is_deterministic() {
        let auth = AwsV2Auth::new();
        let a = auth.authorization_headers(&signed_request()).unwrap();
        let b = auth.authorization_headers(&signed_request()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
        assert!(a[0].1.starts_with("AWS AKIDEXAMPLE:"));
    }

    #[test]
    fn missing_credentials_is_an_error() {
        let request = HttpRequest::builder(Method::Get, "http://h/c/o", Operation::Read).build();
        assert!(AwsV2Auth::new().authorization_headers(&request).is_err());
    }
}
