// src/auth/v4.rs
//
// AWS signature version 4, with optional chunked body signing. The signed
// header set is the minimal one the wire needs: host, x-amz-content-sha256,
// x-amz-date, plus date when the request carries a Date header.

use std::collections::BTreeMap;
use std::io::Read;

use anyhow::{anyhow, Context as _, Result};
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::auth::v2::split_query;
use crate::auth::{credential_from_context, HttpAuth};
use crate::request::HttpRequest;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const STREAMING_PAYLOAD: &str = "STREAMING-AWS4-HMAC-SHA256-PAYLOAD";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// SHA-256 over the full body.
    Signed,
    /// The UNSIGNED-PAYLOAD literal.
    Unsigned,
    /// Chunked signing: the body stream is framed and each chunk signed
    /// against the previous signature.
    Chunked { chunk_size: usize },
}

pub struct AwsV4Auth {
    region: String,
    service: String,
    payload_mode: PayloadMode,
}

impl AwsV4Auth {
    pub fn new(region: &str, service: &str) -> AwsV4Auth {
        AwsV4Auth {
            region: region.to_string(),
            service: service.to_string(),
            payload_mode: PayloadMode::Signed,
        }
    }

    pub fn with_payload_mode(region: &str, service: &str, mode: PayloadMode) -> AwsV4Auth {
        AwsV4Auth {
            region: region.to_string(),
            service: service.to_string(),
            payload_mode: mode,
        }
    }

    fn payload_hash(&self, request: &HttpRequest) -> Result<String> {
        match self.payload_mode {
            PayloadMode::Unsigned => Ok(UNSIGNED_PAYLOAD.to_string()),
            PayloadMode::Chunked { .. } => Ok(STREAMING_PAYLOAD.to_string()),
            PayloadMode::Signed => {
                let mut hasher = Sha256::new();
                let mut reader = request.body.reader();
                let mut buf = [0u8; 8192];
                loop {
                    let n = reader.read(&mut buf).context("failed to hash body")?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hex::encode(hasher.finalize()))
            }
        }
    }

    fn derive(&self, request: &HttpRequest) -> Result<Derived> {
        let (access_key, secret_key) = credential_from_context(request)?;
        let timestamp = Utc
            .timestamp_millis_opt(request.message_time)
            .single()
            .ok_or_else(|| anyhow!("message time out of range [{}]", request.message_time))?;
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );

        let payload_hash = self.payload_hash(request)?;

        let mut canonical_headers: BTreeMap<String, String> = BTreeMap::new();
        canonical_headers.insert("host".to_string(), request.uri_host().to_string());
        canonical_headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        canonical_headers.insert("x-amz-date".to_string(), amz_date.clone());
        if let Some(date) = request.header_ignore_case("Date") {
            canonical_headers.insert("date".to_string(), date.trim().to_string());
        }

        let signed_headers = canonical_headers
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(";");
        let header_block: String = canonical_headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method,
            request.uri_path(),
            canonical_query(request.uri_query().unwrap_or("")),
            header_block,
            signed_headers,
            payload_hash,
        );

        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes())),
        );

        let signing_key = signing_key(&secret_key, &date_stamp, &self.region, &self.service)?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        Ok(Derived {
            access_key,
            amz_date,
            scope,
            payload_hash,
            signed_headers,
            signing_key,
            signature,
        })
    }
}

struct Derived {
    access_key: String,
    amz_date: String,
    scope: String,
    payload_hash: String,
    signed_headers: String,
    signing_key: Vec<u8>,
    signature: String,
}

impl HttpAuth for AwsV4Auth {
    fn authorization_headers(&self, request: &HttpRequest) -> Result<Vec<(String, String)>> {
        let d = self.derive(request)?;
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, d.access_key, d.scope, d.signed_headers, d.signature
        );
        Ok(vec![
            ("Host".to_string(), request.uri_host().to_string()),
            ("x-amz-date".to_string(), d.amz_date),
            ("x-amz-content-sha256".to_string(), d.payload_hash),
            ("Authorization".to_string(), authorization),
        ])
    }

    fn wrap_reader(
        &self,
        request: &HttpRequest,
        reader: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Read + Send>> {
        let PayloadMode::Chunked { chunk_size } = self.payload_mode else {
            return Ok(reader);
        };
        let d = self.derive(request)?;
        Ok(Box::new(ChunkedSigningReader {
            inner: reader,
            chunk_size,
            signing_key: d.signing_key,
            amz_date: d.amz_date,
            scope: d.scope,
            previous_signature: d.signature,
            buf: Vec::new(),
            pos: 0,
            finished: false,
        }))
    }

    fn content_length(&self, request: &HttpRequest) -> u64 {
        match self.payload_mode {
            PayloadMode::Chunked { chunk_size } => {
                chunked_content_length(request.body.size(), chunk_size)
            }
            _ => request.body.size(),
        }
    }
}

fn canonical_query(query: &str) -> String {
    let mut pairs: Vec<(&str, &str)> = split_query(query)
        .into_iter()
        .map(|(k, v)| (k, v.unwrap_or("")))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| anyhow!("failed to key hmac-sha256: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let date_key = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes())?;
    let region_key = hmac_sha256(&date_key, region.as_bytes())?;
    let service_key = hmac_sha256(&region_key, service.as_bytes())?;
    hmac_sha256(&service_key, b"aws4_request")
}

/// Wire length of a chunk-signed body: every chunk is framed as
/// `hex(len);chunk-signature=<64 hex>\r\n<bytes>\r\n`, terminated by a
/// zero-length chunk.
pub fn chunked_content_length(payload_len: u64, chunk_size: usize) -> u64 {
    let chunk_size = chunk_size as u64;
    let frame = |len: u64| -> u64 {
        let hex_digits = if len == 0 {
            1
        } else {
            ((64 - len.leading_zeros() as u64) + 3) / 4
        };
        hex_digits + ";chunk-signature=".len() as u64 + 64 + 2 + len + 2
    };
    let full = payload_len / chunk_size;
    let rem = payload_len % chunk_size;
    let mut total = full * frame(chunk_size);
    if rem > 0 {
        total += frame(rem);
    }
    total + frame(0)
}

/// Frames and signs the inner stream chunk by chunk, each signature chained
/// off the previous one, starting from the request's seed signature.
struct ChunkedSigningReader {
    inner: Box<dyn Read + Send>,
    chunk_size: usize,
    signing_key: Vec<u8>,
    amz_date: String,
    scope: String,
    previous_signature: String,
    buf: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl ChunkedSigningReader {
    fn next_chunk(&mut self) -> std::io::Result<()> {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.inner.read(&mut chunk[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        chunk.truncate(filled);

        let chunk_hash = hex::encode(Sha256::digest(&chunk));
        let string_to_sign = format!(
            "{}-PAYLOAD\n{}\n{}\n{}\n{}\n{}",
            ALGORITHM, self.amz_date, self.scope, self.previous_signature, EMPTY_SHA256, chunk_hash
        );
        let signature = hex::encode(
            hmac_sha256(&self.signing_key, string_to_sign.as_bytes())
                .map_err(|e| std::io::Error::other(e.to_string()))?,
        );
        self.previous_signature = signature.clone();

        self.buf.clear();
        self.buf.extend_from_slice(
            format!("{:x};chunk-signature={}\r\n", chunk.len(), signature).as_bytes(),
        );
        self.buf.extend_from_slice(&chunk);
        self.buf.extend_from_slice(b"\r\n");
        self.pos = 0;
        if chunk.is_empty() {
            self.finished = true;
        }
        Ok(())
    }
}

impl Read for ChunkedSigningReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.buf.len() {
                let n = out.len().min(self.buf.len() - self.pos);
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            self.next_chunk()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;
    use crate::request::{keys, Method, Operation};

    const KEY_ID: &str = "AKIDEXAMPLE";
    const SECRET_KEY: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    fn vector_request() -> HttpRequest {
        HttpRequest::builder(
            Method::Put,
            "http://127.0.0.1:8080/container/object",
            Operation::Write,
        )
        .header("Date", "Thu, 30 Apr 2015 13:40:47 -0500")
        .body(Body::zeroes(35))
        .message_time(1430419247000)
        .context(keys::USERNAME, KEY_ID)
        .context(keys::PASSWORD, SECRET_KEY)
        .build()
    }

    #[test]
    fn known_answer_vector() {
        let auth = AwsV4Auth::new("dsnet", "s3");
        let headers = auth.authorization_headers(&vector_request()).unwrap();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("Host"), "127.0.0.1");
        assert_eq!(get("x-amz-date"), "20150430T184047Z");
        assert_eq!(
            get("x-amz-content-sha256"),
            "0d5535e13cc9708d0ff0289af2fae27e564b6bcbcd9242f5140d96957744a517"
        );
        assert_eq!(
            get("Authorization"),
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150430/dsnet/s3/aws4_request, \
             SignedHeaders=date;host;x-amz-content-sha256;x-amz-date, \
             Signature=32e574543e02fb2f975dce2af9ec6c2ddea845ce023fa56b18b70574a5e42986"
        );
    }

    #[test]
    fn equal_bytes_yield_equal_payload_hash() {
        let auth = AwsV4Auth::new("dsnet", "s3");
        let zeroes = auth.payload_hash(&vector_request()).unwrap();
        let mut other = vector_request();
        other.body = Body::custom("\0".repeat(35));
        assert_eq!(auth.payload_hash(&other).unwrap(), zeroes);
    }

    #[test]
    fn changing_date_changes_signature_not_signed_headers() {
        let auth = AwsV4Auth::new("dsnet", "s3");
        let base = auth.authorization_headers(&vector_request()).unwrap();
        let mut shifted = vector_request();
        shifted.message_time += 1000;
        let other = auth.authorization_headers(&shifted).unwrap();

        let authz = |h: &[(String, String)]| {
            h.iter()
                .find(|(k, _)| k == "Authorization")
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        let a = authz(&base);
        let b = authz(&other);
        assert_ne!(a, b);
        assert!(a.contains("SignedHeaders=date;host;x-amz-content-sha256;x-amz-date"));
        assert!(b.contains("SignedHeaders=date;host;x-amz-content-sha256;x-amz-date"));
    }

    #[test]
    fn unsigned_payload_uses_the_literal() {
        let auth = AwsV4Auth::with_payload_mode("dsnet", "s3", PayloadMode::Unsigned);
        assert_eq!(auth.payload_hash(&vector_request()).unwrap(), UNSIGNED_PAYLOAD);
    }

    #[test]
    fn chunked_mode_streams_framed_chunks() {
        let auth = AwsV4Auth::with_payload_mode(
            "dsnet",
            "s3",
            PayloadMode::Chunked { chunk_size: 16 },
        );
        let mut request = vector_request();
        request.body = Body::zeroes(40);
        assert_eq!(auth.payload_hash(&request).unwrap(), STREAMING_PAYLOAD);

        let mut wire = Vec::new();
        auth.wrap_reader(&request, Box::new(request.body.reader()))
            .unwrap()
            .read_to_end(&mut wire)
            .unwrap();
        assert_eq!(wire.len() as u64, auth.content_length(&request));

        // 16 + 16 + 8 byte chunks, then the zero terminator
        let text = String::from_utf8_lossy(&wire);
        assert!(text.starts_with("10;chunk-signature="));
        assert!(text.contains("\r\n8;chunk-signature="));
        assert!(text.contains("\r\n0;chunk-signature="));
        assert!(text.ends_with("\r\n"));

        // recover the payload from the frames
        let mut payload = Vec::new();
        let mut rest: &[u8] = &wire;
        loop {
            let header_end = rest.windows(2).position(|w| w == b"\r\n").unwrap();
            let header = std::str::from_utf8(&rest[..header_end]).unwrap();
            let len = usize::from_str_radix(header.split(';').next().unwrap(), 16).unwrap();
            let start = header_end + 2;
            payload.extend_from_slice(&rest[start..start + len]);
            rest = &rest[start + len + 2..];
            if len == 0 {
                break;
            }
        }
        assert_eq!(payload, vec![0u8; 40]);
    }

    #[test]
    fn chunk_signatures_chain() {
        let auth = AwsV4Auth::with_payload_mode(
            "dsnet",
            "s3",
            PayloadMode::Chunked { chunk_size: 8 },
        );
        let mut request = vector_request();
        request.body = Body::zeroes(16);
        let mut wire = Vec::new();
        auth.wrap_reader(&request, Box::new(request.body.reader()))
            .unwrap()
            .read_to_end(&mut wire)
            .unwrap();
        let text = String::from_utf8_lossy(&wire);
        // identical chunk bytes must still sign differently because each
        // signature chains off the previous one
        let sigs: Vec<&str> = text
            .split("chunk-signature=")
            .skip(1)
            .map(|s| &s[..64])
            .collect();
        assert_eq!(sigs.len(), 3);
        assert_ne!(sigs[0], sigs[1]);
        assert_ne!(sigs[1], sigs[2]);
    }

    #[test]
    fn chunked_content_length_matches_framing_math() {
        // one 10-byte chunk: "a;chunk-signature=<64>\r\n" + 10 + "\r\n"
        //   = 1 + 17 + 64 + 2 + 10 + 2 = 96
        // terminator: "0;chunk-signature=<64>\r\n\r\n" = 1 + 17 + 64 + 2 + 0 + 2 = 86
        assert_eq!(chunked_content_length(10, 16), 96 + 86);
        assert_eq!(chunked_content_length(0, 16), 86);
        // 16-byte chunk header has two hex digits
        assert_eq!(chunked_content_length(16, 16), (2 + 17 + 64 + 2 + 16 + 2) + 86);
    }
}
