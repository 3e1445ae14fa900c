// src/multipart.rs
//
// Multipart-upload session machinery. One supplier keeps up to
// `target_sessions` uploads in flight; within a session up to
// `max_concurrent_parts` PART requests may be outstanding. The selector
// serializes through one lock; response handling re-admits sessions and
// wakes the selector.
//
// Sessions are created when the INITIATE response arrives (the upload id is
// server-issued), not when the INITIATE request is emitted. COMPLETE is
// emitted only when every part response has been observed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::body::{Body, DataType};
use crate::config::Scheme;
use crate::driver::{RequestSource, ShutdownToken};
use crate::events::{Completed, Subscriber};
use crate::request::{keys, Context, HttpRequest, HttpResponse, Method, Operation};
use crate::request_supplier::Md5Cache;
use crate::size_generator::SizeGenerator;
use crate::suppliers::{ContextProducer, ValueSupplier};

/// Consumer tag that routes INITIATE response bodies through the upload-id
/// extractor.
pub const MULTIPART_CONSUMER: &str = "s3.multipart";

const INITIATE: &str = "INITIATE";
const PART: &str = "PART";
const COMPLETE: &str = "COMPLETE";
const ABORT: &str = "ABORT";

/// What a session would emit next. The Internal* states never leave the
/// selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Part,
    Complete,
    InternalPending,
    InternalDone,
    InternalError,
}

struct Session {
    container: String,
    object: String,
    body_data_type: DataType,
    object_size: u64,
    part_size: u64,
    last_part_size: u64,
    total_parts: u32,
    next_part_number: u32,
    in_progress_parts: u32,
    finished_parts: u32,
    max_concurrent_parts: u32,
    complete_in_progress: bool,
    complete_done: bool,
    actionable: bool,
    parts: BinaryHeap<Reverse<(u32, String)>>,
    context: Context,
}

impl Session {
    fn new(
        container: String,
        object: String,
        object_size: u64,
        part_size: u64,
        max_concurrent_parts: u32,
        body_data_type: DataType,
        context: Context,
    ) -> Session {
        let part_size = part_size.max(1);
        let whole = (object_size / part_size) as u32;
        let (total_parts, last_part_size) = if object_size % part_size != 0 {
            (whole + 1, object_size % part_size)
        } else {
            (whole, part_size)
        };
        Session {
            container,
            object,
            body_data_type,
            object_size,
            part_size,
            last_part_size,
            total_parts,
            next_part_number: 0,
            in_progress_parts: 0,
            finished_parts: 0,
            max_concurrent_parts,
            complete_in_progress: false,
            complete_done: false,
            actionable: false,
            parts: BinaryHeap::new(),
            context,
        }
    }

    fn next_step(&self) -> Step {
        if self.in_progress_parts == 0
            && !self.complete_done
            && !self.complete_in_progress
            && self.finished_parts == self.total_parts
        {
            Step::Complete
        } else if self.finished_parts == self.total_parts
            && self.complete_done
            && !self.complete_in_progress
        {
            Step::InternalDone
        } else if self.in_progress_parts + self.finished_parts < self.total_parts
            && self.in_progress_parts < self.max_concurrent_parts
        {
            Step::Part
        } else if self.in_progress_parts + self.finished_parts == self.total_parts
            || self.in_progress_parts >= self.max_concurrent_parts
        {
            Step::InternalPending
        } else {
            Step::InternalError
        }
    }

    /// Claims the next part; returns its number and size.
    fn start_part(&mut self) -> (u32, u64) {
        self.in_progress_parts += 1;
        self.next_part_number += 1;
        let size = if self.next_part_number < self.total_parts {
            self.part_size
        } else {
            self.last_part_size
        };
        (self.next_part_number, size)
    }

    fn finish_part(&mut self, part_number: u32, etag: String) {
        self.parts.push(Reverse((part_number, etag)));
        self.in_progress_parts -= 1;
        self.finished_parts += 1;
    }

    fn start_complete(&mut self) -> String {
        self.complete_in_progress = true;
        self.complete_body()
    }

    fn finish_complete(&mut self) {
        self.complete_done = true;
        self.complete_in_progress = false;
    }

    /// Drains the part queue in part-number order into the COMPLETE body.
    fn complete_body(&mut self) -> String {
        let mut body = String::from("<CompleteMultipartUpload>");
        while let Some(Reverse((part_number, etag))) = self.parts.pop() {
            body.push_str("<Part><PartNumber>");
            body.push_str(&part_number.to_string());
            body.push_str("</PartNumber><ETag>");
            body.push_str(&etag);
            body.push_str("</ETag></Part>");
        }
        body.push_str("</CompleteMultipartUpload>");
        body
    }
}

#[derive(Default)]
struct MpState {
    /// Sessions counted from INITIATE emission until the COMPLETE response
    /// (or a failed INITIATE).
    active_sessions: u32,
    sessions: HashMap<String, Session>,
    actionable: Vec<String>,
}

struct Inner {
    host: ValueSupplier,
    initiate_producers: Vec<ContextProducer>,
    headers: Vec<(String, ValueSupplier)>,
    part_size: SizeGenerator,
    max_concurrent_parts: u32,
    body_data_type: DataType,
    request_id: u64,
    md5_cache: Md5Cache,
    state: MpState,
}

enum Decision {
    Built(Box<HttpRequest>),
    Retry,
    Wait,
}

pub struct MultipartRequestSupplier {
    target_sessions: u32,
    scheme: Scheme,
    port: Option<u16>,
    uri_root: Option<String>,
    trailing_slash: bool,
    virtual_host: bool,
    content_md5: bool,
    shutdown: ShutdownToken,
    notify: Notify,
    inner: Mutex<Inner>,
}

#[allow(clippy::too_many_arguments)]
impl MultipartRequestSupplier {
    pub fn new(
        scheme: Scheme,
        host: ValueSupplier,
        port: Option<u16>,
        uri_root: Option<String>,
        initiate_producers: Vec<ContextProducer>,
        headers: Vec<(String, ValueSupplier)>,
        part_size: SizeGenerator,
        max_concurrent_parts: u32,
        target_sessions: u32,
        body_data_type: DataType,
        trailing_slash: bool,
        virtual_host: bool,
        content_md5: bool,
        shutdown: ShutdownToken,
    ) -> Result<MultipartRequestSupplier> {
        anyhow::ensure!(target_sessions > 0, "target_sessions must be > 0");
        anyhow::ensure!(max_concurrent_parts > 0, "max_concurrent_parts must be > 0");
        Ok(MultipartRequestSupplier {
            target_sessions,
            scheme,
            port,
            uri_root,
            trailing_slash,
            virtual_host,
            content_md5,
            shutdown,
            notify: Notify::new(),
            inner: Mutex::new(Inner {
                host,
                initiate_producers,
                headers,
                part_size,
                max_concurrent_parts,
                body_data_type,
                request_id: 0,
                md5_cache: Md5Cache::new(100),
                state: MpState::default(),
            }),
        })
    }

    async fn next(&self) -> Result<Option<HttpRequest>> {
        loop {
            if self.shutdown.is_stopped() {
                return Ok(None);
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before inspecting state so a response arriving in the
            // gap still wakes us
            notified.as_mut().enable();

            let decision = {
                let mut inner = self.inner.lock().expect("multipart lock poisoned");
                self.decide(&mut inner)?
            };
            match decision {
                Decision::Built(request) => return Ok(Some(*request)),
                Decision::Retry => continue,
                Decision::Wait => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.shutdown.cancelled() => return Ok(None),
                    }
                }
            }
        }
    }

    fn decide(&self, inner: &mut Inner) -> Result<Decision> {
        if inner.state.active_sessions < self.target_sessions {
            let request = self.build_initiate(inner)?;
            inner.state.active_sessions += 1;
            return Ok(Decision::Built(Box::new(request)));
        }
        if inner.state.actionable.is_empty() {
            return Ok(Decision::Wait);
        }
        let idx = rand::rng().random_range(0..inner.state.actionable.len());
        let upload_id = inner.state.actionable[idx].clone();
        let step = inner.state.sessions.get(&upload_id).map(|s| s.next_step());
        match step {
            None => {
                inner.state.actionable.remove(idx);
                Ok(Decision::Retry)
            }
            Some(Step::InternalPending) | Some(Step::InternalDone) | Some(Step::InternalError) => {
                inner.state.actionable.remove(idx);
                if let Some(session) = inner.state.sessions.get_mut(&upload_id) {
                    session.actionable = false;
                }
                debug!(
                    "session [{}] not actionable, {} remain",
                    upload_id,
                    inner.state.actionable.len()
                );
                Ok(Decision::Retry)
            }
            Some(Step::Complete) => {
                inner.state.actionable.remove(idx);
                if let Some(session) = inner.state.sessions.get_mut(&upload_id) {
                    session.actionable = false;
                }
                let request = self.build_complete(inner, &upload_id)?;
                Ok(Decision::Built(Box::new(request)))
            }
            Some(Step::Part) => {
                let request = self.build_part(inner, &upload_id)?;
                Ok(Decision::Built(Box::new(request)))
            }
        }
    }

    fn build_initiate(&self, inner: &mut Inner) -> Result<HttpRequest> {
        let mut ctx = Context::new();
        for producer in &mut inner.initiate_producers {
            producer.apply(&mut ctx)?;
        }
        let container = ctx
            .get(keys::CONTAINER_NAME)
            .cloned()
            .ok_or_else(|| anyhow!("multipart write requires a container producer"))?;
        let object = ctx
            .get(keys::OBJECT_NAME)
            .cloned()
            .ok_or_else(|| anyhow!("multipart write requires an object name producer"))?;
        let part_size = inner.part_size.generate().max(1);

        ctx.insert(
            keys::MULTIPART_BODY_DATA_TYPE.to_string(),
            inner.body_data_type.as_str().to_string(),
        );
        ctx.insert(keys::MULTIPART_REQUEST.to_string(), INITIATE.to_string());
        ctx.insert(keys::MULTIPART_CONTAINER.to_string(), container.clone());
        ctx.insert(keys::MULTIPART_PART_SIZE.to_string(), part_size.to_string());
        ctx.insert(
            keys::MULTIPART_MAX_PARTS.to_string(),
            inner.max_concurrent_parts.to_string(),
        );

        let uri = self.build_uri(inner, &container, &object, "uploads", None, None);
        let builder = HttpRequest::builder(Method::Post, uri, Operation::MultipartWriteInitiate);
        Ok(self.finalize(inner, builder, ctx))
    }

    fn build_part(&self, inner: &mut Inner, upload_id: &str) -> Result<HttpRequest> {
        let (part_number, part_size, container, object, body_data_type, mut ctx) = {
            let session = inner
                .state
                .sessions
                .get_mut(upload_id)
                .ok_or_else(|| anyhow!("unknown multipart session [{}]", upload_id))?;
            let (part_number, part_size) = session.start_part();
            (
                part_number,
                part_size,
                session.container.clone(),
                session.object.clone(),
                session.body_data_type,
                session.context.clone(),
            )
        };
        ctx.insert(keys::MULTIPART_REQUEST.to_string(), PART.to_string());
        ctx.insert(
            keys::MULTIPART_PART_NUMBER.to_string(),
            part_number.to_string(),
        );
        ctx.insert(keys::MULTIPART_UPLOAD_ID.to_string(), upload_id.to_string());
        ctx.insert(keys::MULTIPART_PART_SIZE.to_string(), part_size.to_string());

        let uri = self.build_uri(
            inner,
            &container,
            &object,
            "",
            Some(part_number),
            Some(upload_id),
        );
        let body = match body_data_type {
            DataType::Zeroes => Body::zeroes(part_size),
            _ => Body::random(part_size),
        };
        let mut builder = HttpRequest::builder(Method::Put, uri, Operation::MultipartWritePart);
        if self.content_md5 {
            builder = builder.header(keys::CONTENT_MD5, inner.md5_cache.get(body.size()));
        }
        builder = builder.body(body);
        Ok(self.finalize(inner, builder, ctx))
    }

    fn build_complete(&self, inner: &mut Inner, upload_id: &str) -> Result<HttpRequest> {
        let (body, container, object, mut ctx) = {
            let session = inner
                .state
                .sessions
                .get_mut(upload_id)
                .ok_or_else(|| anyhow!("unknown multipart session [{}]", upload_id))?;
            (
                session.start_complete(),
                session.container.clone(),
                session.object.clone(),
                session.context.clone(),
            )
        };
        ctx.insert(keys::MULTIPART_REQUEST.to_string(), COMPLETE.to_string());
        ctx.insert(keys::MULTIPART_UPLOAD_ID.to_string(), upload_id.to_string());

        let uri = self.build_uri(inner, &container, &object, "", None, Some(upload_id));
        let builder = HttpRequest::builder(Method::Post, uri, Operation::MultipartWriteComplete)
            .body(Body::custom(body));
        Ok(self.finalize(inner, builder, ctx))
    }

    /// Builds the DELETE that would abandon a session. Nothing schedules
    /// this today: the trigger policy (on error, on timeout) is a decision
    /// the response handler acknowledges but does not make.
    pub fn abort_request(&self, upload_id: &str) -> Result<HttpRequest> {
        let mut inner = self.inner.lock().expect("multipart lock poisoned");
        let (container, object, mut ctx) = {
            let session = inner
                .state
                .sessions
                .get(upload_id)
                .ok_or_else(|| anyhow!("unknown multipart session [{}]", upload_id))?;
            (
                session.container.clone(),
                session.object.clone(),
                session.context.clone(),
            )
        };
        ctx.insert(keys::MULTIPART_REQUEST.to_string(), ABORT.to_string());
        ctx.insert(keys::MULTIPART_UPLOAD_ID.to_string(), upload_id.to_string());
        let uri = self.build_uri(&mut inner, &container, &object, "", None, Some(upload_id));
        let builder =
            HttpRequest::builder(Method::Delete, uri, Operation::MultipartWriteAbort);
        Ok(self.finalize(&mut inner, builder, ctx))
    }

    fn finalize(
        &self,
        inner: &mut Inner,
        mut builder: crate::request::Builder,
        ctx: Context,
    ) -> HttpRequest {
        for (key, supplier) in &mut inner.headers {
            builder = builder.header(key.clone(), supplier.get());
        }
        inner.request_id += 1;
        builder = builder.context(keys::REQUEST_ID, inner.request_id.to_string());
        for (key, value) in ctx {
            if key == keys::REQUEST_ID {
                continue;
            }
            builder = builder.context(key, value);
        }
        builder = builder.context(keys::RESPONSE_BODY_CONSUMER, MULTIPART_CONSUMER);
        builder.build()
    }

    fn build_uri(
        &self,
        inner: &mut Inner,
        container: &str,
        object: &str,
        bare_query: &str,
        part_number: Option<u32>,
        upload_id: Option<&str>,
    ) -> String {
        let mut s = format!("{}://", self.scheme);
        if self.virtual_host {
            s.push_str(container);
            s.push('.');
        }
        s.push_str(&inner.host.get());
        if let Some(port) = self.port {
            s.push_str(&format!(":{}", port));
        }
        if !self.virtual_host {
            s.push('/');
            if let Some(root) = &self.uri_root {
                s.push_str(root);
                s.push('/');
            }
            s.push_str(container);
        }
        s.push('/');
        s.push_str(object);
        if self.trailing_slash {
            s.push('/');
        }
        if !bare_query.is_empty() {
            s.push('?');
            s.push_str(bare_query);
        } else {
            let mut first = true;
            if let Some(n) = part_number {
                s.push('?');
                s.push_str(&format!("partNumber={}", n));
                first = false;
            }
            if let Some(id) = upload_id {
                s.push(if first { '?' } else { '&' });
                s.push_str(&format!("uploadId={}", id));
            }
        }
        s
    }
}

#[async_trait]
impl RequestSource for MultipartRequestSupplier {
    fn operation(&self) -> Operation {
        Operation::MultipartWriteInitiate
    }

    async fn get(&self) -> Result<Option<HttpRequest>> {
        self.next().await
    }
}

#[async_trait]
impl Subscriber for MultipartRequestSupplier {
    fn name(&self) -> &'static str {
        "multipart-supplier"
    }

    async fn on_completed(&self, event: &Completed) -> Result<()> {
        let request_ctx = &event.request.context;
        let Some(kind) = request_ctx.get(keys::MULTIPART_REQUEST) else {
            return Ok(());
        };
        let mut inner = self.inner.lock().expect("multipart lock poisoned");
        match kind.as_str() {
            INITIATE => {
                if event.response.status_code != 200 {
                    warn!(
                        "multipart initiate failed with {}",
                        event.response.status_code
                    );
                    inner.state.active_sessions = inner.state.active_sessions.saturating_sub(1);
                } else {
                    match event.response.context.get(keys::MULTIPART_UPLOAD_ID) {
                        Some(upload_id) => {
                            let session = session_from_context(
                                request_ctx,
                                inner.max_concurrent_parts,
                            )?;
                            let upload_id = upload_id.clone();
                            inner.state.sessions.insert(upload_id.clone(), session);
                            admit(&mut inner.state, &upload_id);
                        }
                        None => {
                            warn!("multipart initiate response carried no upload id");
                            inner.state.active_sessions =
                                inner.state.active_sessions.saturating_sub(1);
                        }
                    }
                }
            }
            PART => {
                let upload_id = request_ctx
                    .get(keys::MULTIPART_UPLOAD_ID)
                    .cloned()
                    .unwrap_or_default();
                match event.response.header("ETag") {
                    Some(etag) => {
                        let part_number = request_ctx
                            .get(keys::MULTIPART_PART_NUMBER)
                            .and_then(|n| n.parse::<u32>().ok())
                            .ok_or_else(|| anyhow!("part response without a part number"))?;
                        if let Some(session) = inner.state.sessions.get_mut(&upload_id) {
                            // stored verbatim, quoted or not
                            session.finish_part(part_number, etag.to_string());
                            let readmit = matches!(
                                session.next_step(),
                                Step::Part | Step::Complete
                            );
                            if readmit {
                                admit(&mut inner.state, &upload_id);
                            }
                        } else {
                            debug!("part response for unknown session [{}]", upload_id);
                        }
                    }
                    None => {
                        // protocol failure: abandon the session
                        warn!(
                            "part response without ETag, abandoning session [{}]",
                            upload_id
                        );
                        if inner.state.sessions.remove(&upload_id).is_some() {
                            inner.state.actionable.retain(|id| id != &upload_id);
                            inner.state.active_sessions =
                                inner.state.active_sessions.saturating_sub(1);
                        }
                    }
                }
            }
            COMPLETE => {
                let upload_id = request_ctx
                    .get(keys::MULTIPART_UPLOAD_ID)
                    .cloned()
                    .unwrap_or_default();
                inner.state.active_sessions = inner.state.active_sessions.saturating_sub(1);
                if let Some(mut session) = inner.state.sessions.remove(&upload_id) {
                    session.finish_complete();
                    debug!(
                        "session [{}] complete: {} bytes in {} part(s)",
                        upload_id, session.object_size, session.total_parts
                    );
                }
                inner.state.actionable.retain(|id| id != &upload_id);
            }
            ABORT => {
                let upload_id = request_ctx
                    .get(keys::MULTIPART_UPLOAD_ID)
                    .cloned()
                    .unwrap_or_default();
                warn!("multipart abort observed for session [{}]", upload_id);
                if inner.state.sessions.remove(&upload_id).is_some() {
                    inner.state.actionable.retain(|id| id != &upload_id);
                    inner.state.active_sessions =
                        inner.state.active_sessions.saturating_sub(1);
                }
            }
            other => warn!("unrecognized multipart request kind [{}]", other),
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }
}

fn admit(state: &mut MpState, upload_id: &str) {
    if let Some(session) = state.sessions.get_mut(upload_id) {
        if !session.actionable {
            session.actionable = true;
            state.actionable.push(upload_id.to_string());
        }
    }
}

fn session_from_context(ctx: &Context, default_max_parts: u32) -> Result<Session> {
    let container = ctx
        .get(keys::MULTIPART_CONTAINER)
        .cloned()
        .ok_or_else(|| anyhow!("initiate context missing container"))?;
    let object = ctx
        .get(keys::OBJECT_NAME)
        .cloned()
        .ok_or_else(|| anyhow!("initiate context missing object name"))?;
    let object_size = ctx
        .get(keys::OBJECT_SIZE)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| anyhow!("initiate context missing object size"))?;
    let part_size = ctx
        .get(keys::MULTIPART_PART_SIZE)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| anyhow!("initiate context missing part size"))?;
    let max_parts = ctx
        .get(keys::MULTIPART_MAX_PARTS)
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(default_max_parts);
    let body_data_type = ctx
        .get(keys::MULTIPART_BODY_DATA_TYPE)
        .and_then(|s| DataType::parse(s))
        .unwrap_or(DataType::Random);
    Ok(Session::new(
        container,
        object,
        object_size,
        part_size,
        max_parts,
        body_data_type,
        ctx.clone(),
    ))
}

/// Applies the response-body consumer named in the request context. The
/// `s3.multipart` consumer extracts the server-issued upload id from the
/// INITIATE response body.
pub fn consume_response_body(request: &HttpRequest, response: &mut HttpResponse) {
    if request.context.get(keys::RESPONSE_BODY_CONSUMER).map(String::as_str)
        != Some(MULTIPART_CONSUMER)
    {
        return;
    }
    let body = String::from_utf8_lossy(&response.body);
    if let Some(upload_id) = extract_upload_id(&body) {
        response
            .context
            .insert(keys::MULTIPART_UPLOAD_ID.to_string(), upload_id.to_string());
    }
}

pub fn extract_upload_id(xml: &str) -> Option<&str> {
    let start = xml.find("<UploadId>")? + "<UploadId>".len();
    let end = xml[start..].find("</UploadId>")? + start;
    Some(xml[start..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_generator::SizeSpec;
    use crate::suppliers::ObjectNameSource;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn supplier(target_sessions: u32, max_parts: u32) -> MultipartRequestSupplier {
        MultipartRequestSupplier::new(
            Scheme::Http,
            ValueSupplier::constant("127.0.0.1"),
            Some(8080),
            None,
            vec![
                ContextProducer::ContainerName {
                    base: ValueSupplier::constant("vault-0"),
                    suffix: None,
                },
                ContextProducer::ObjectName(ObjectNameSource::Generate),
                ContextProducer::ObjectSize(
                    SizeGenerator::new(&SizeSpec::Fixed(10 * MIB)).unwrap(),
                ),
            ],
            Vec::new(),
            SizeGenerator::new(&SizeSpec::Fixed(4 * MIB)).unwrap(),
            max_parts,
            target_sessions,
            DataType::Zeroes,
            false,
            false,
            false,
            ShutdownToken::new(),
        )
        .unwrap()
    }

    fn respond(request: &HttpRequest, status: u16, headers: Vec<(String, String)>, body: &str) -> Completed {
        let mut response = HttpResponse {
            status_code: status,
            headers,
            body: bytes::Bytes::from(body.to_string()),
            context: Context::new(),
        };
        consume_response_body(request, &mut response);
        Completed {
            request: request.clone(),
            response,
            latency: Duration::from_millis(1),
        }
    }

    fn etag_header(value: &str) -> Vec<(String, String)> {
        vec![("ETag".to_string(), value.to_string())]
    }

    #[test]
    fn part_sizing_splits_the_object() {
        let session = Session::new(
            "c".into(),
            "o".into(),
            10 * MIB,
            4 * MIB,
            2,
            DataType::Zeroes,
            Context::new(),
        );
        assert_eq!(session.total_parts, 3);
        assert_eq!(session.last_part_size, 2 * MIB);

        let even = Session::new(
            "c".into(),
            "o".into(),
            8 * MIB,
            4 * MIB,
            2,
            DataType::Zeroes,
            Context::new(),
        );
        assert_eq!(even.total_parts, 2);
        assert_eq!(even.last_part_size, 4 * MIB);
    }

    #[test]
    fn session_invariants_hold_through_transitions() {
        let mut s = Session::new(
            "c".into(),
            "o".into(),
            10 * MIB,
            4 * MIB,
            2,
            DataType::Zeroes,
            Context::new(),
        );
        assert_eq!(s.next_step(), Step::Part);
        let (p1, sz1) = s.start_part();
        assert_eq!((p1, sz1), (1, 4 * MIB));
        assert_eq!(s.next_step(), Step::Part);
        let (p2, _) = s.start_part();
        assert_eq!(p2, 2);
        // both slots in use
        assert_eq!(s.next_step(), Step::InternalPending);
        assert!(s.finished_parts + s.in_progress_parts <= s.total_parts);

        s.finish_part(2, "b".into());
        assert_eq!(s.next_step(), Step::Part);
        let (p3, sz3) = s.start_part();
        assert_eq!((p3, sz3), (3, 2 * MIB));
        assert_eq!(s.next_step(), Step::InternalPending);

        s.finish_part(1, "a".into());
        assert_eq!(s.next_step(), Step::InternalPending);
        s.finish_part(3, "c".into());
        assert_eq!(s.next_step(), Step::Complete);
        assert!(s.finished_parts + s.in_progress_parts <= s.total_parts);

        let body = s.start_complete();
        assert_eq!(s.next_step(), Step::InternalPending);
        s.finish_complete();
        assert_eq!(s.next_step(), Step::InternalDone);
        assert!(body.starts_with("<CompleteMultipartUpload>"));
    }

    #[test]
    fn complete_body_lists_parts_in_number_order() {
        let mut s = Session::new(
            "c".into(),
            "o".into(),
            3,
            1,
            3,
            DataType::Zeroes,
            Context::new(),
        );
        s.start_part();
        s.start_part();
        s.start_part();
        s.finish_part(3, "\"e3\"".into());
        s.finish_part(1, "\"e1\"".into());
        s.finish_part(2, "\"e2\"".into());
        assert_eq!(
            s.complete_body(),
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"e2\"</ETag></Part>\
             <Part><PartNumber>3</PartNumber><ETag>\"e3\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn upload_id_extraction() {
        let xml = "<?xml version=\"1.0\"?><InitiateMultipartUploadResult>\
                   <Bucket>b</Bucket><Key>k</Key><UploadId>abc-123</UploadId>\
                   </InitiateMultipartUploadResult>";
        assert_eq!(extract_upload_id(xml), Some("abc-123"));
        assert_eq!(extract_upload_id("<NoUploadId/>"), None);
    }

    #[tokio::test]
    async fn full_session_flow_emits_the_expected_sequence() {
        let supplier = supplier(1, 2);

        // INITIATE first; the session is only created on its response
        let initiate = supplier.get().await.unwrap().unwrap();
        assert_eq!(initiate.operation, Operation::MultipartWriteInitiate);
        assert_eq!(initiate.method, Method::Post);
        assert!(initiate.uri.ends_with("?uploads"));
        assert_eq!(
            initiate.context[keys::MULTIPART_REQUEST],
            "INITIATE"
        );

        // target reached and no session yet: the selector must wait
        assert!(
            tokio::time::timeout(Duration::from_millis(50), supplier.get())
                .await
                .is_err()
        );

        let body = "<InitiateMultipartUploadResult><UploadId>u-1</UploadId>\
                    </InitiateMultipartUploadResult>";
        supplier
            .on_completed(&respond(&initiate, 200, Vec::new(), body))
            .await
            .unwrap();

        let part1 = supplier.get().await.unwrap().unwrap();
        assert_eq!(part1.operation, Operation::MultipartWritePart);
        assert_eq!(part1.context[keys::MULTIPART_PART_NUMBER], "1");
        assert!(part1.uri.contains("partNumber=1"));
        assert!(part1.uri.contains("uploadId=u-1"));
        assert_eq!(part1.body.size(), 4 * MIB);

        let part2 = supplier.get().await.unwrap().unwrap();
        assert_eq!(part2.context[keys::MULTIPART_PART_NUMBER], "2");

        // two parts outstanding at max_concurrent_parts=2: no third part yet
        assert!(
            tokio::time::timeout(Duration::from_millis(50), supplier.get())
                .await
                .is_err()
        );

        supplier
            .on_completed(&respond(&part1, 200, etag_header("\"etag-1\""), ""))
            .await
            .unwrap();
        let part3 = supplier.get().await.unwrap().unwrap();
        assert_eq!(part3.context[keys::MULTIPART_PART_NUMBER], "3");
        assert_eq!(part3.body.size(), 2 * MIB);

        // all parts sent but responses outstanding: COMPLETE not yet allowed
        assert!(
            tokio::time::timeout(Duration::from_millis(50), supplier.get())
                .await
                .is_err()
        );

        supplier
            .on_completed(&respond(&part2, 200, etag_header("\"etag-2\""), ""))
            .await
            .unwrap();
        supplier
            .on_completed(&respond(&part3, 200, etag_header("\"etag-3\""), ""))
            .await
            .unwrap();

        let complete = supplier.get().await.unwrap().unwrap();
        assert_eq!(complete.operation, Operation::MultipartWriteComplete);
        assert!(complete.uri.ends_with("?uploadId=u-1"));
        let xml = String::from_utf8(complete.body.to_bytes()).unwrap();
        assert_eq!(
            xml,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"etag-1\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"etag-2\"</ETag></Part>\
             <Part><PartNumber>3</PartNumber><ETag>\"etag-3\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );

        // COMPLETE response erases the session and frees a slot: next pull
        // starts a new upload
        supplier
            .on_completed(&respond(&complete, 200, Vec::new(), ""))
            .await
            .unwrap();
        let next = supplier.get().await.unwrap().unwrap();
        assert_eq!(next.operation, Operation::MultipartWriteInitiate);
    }

    #[tokio::test]
    async fn failed_initiate_frees_the_session_slot() {
        let supplier = supplier(1, 2);
        let initiate = supplier.get().await.unwrap().unwrap();
        supplier
            .on_completed(&respond(&initiate, 503, Vec::new(), ""))
            .await
            .unwrap();
        // slot freed: the next request is another INITIATE, not a wait
        let retry = tokio::time::timeout(Duration::from_millis(100), supplier.get())
            .await
            .expect("slot was not freed")
            .unwrap()
            .unwrap();
        assert_eq!(retry.operation, Operation::MultipartWriteInitiate);
    }

    #[tokio::test]
    async fn part_without_etag_abandons_the_session() {
        let supplier = supplier(1, 2);
        let initiate = supplier.get().await.unwrap().unwrap();
        let body = "<InitiateMultipartUploadResult><UploadId>u-2</UploadId>\
                    </InitiateMultipartUploadResult>";
        supplier
            .on_completed(&respond(&initiate, 200, Vec::new(), body))
            .await
            .unwrap();
        let part1 = supplier.get().await.unwrap().unwrap();
        supplier
            .on_completed(&respond(&part1, 200, Vec::new(), ""))
            .await
            .unwrap();
        // session abandoned, slot freed: a fresh INITIATE follows
        let next = supplier.get().await.unwrap().unwrap();
        assert_eq!(next.operation, Operation::MultipartWriteInitiate);
    }

    #[tokio::test]
    async fn abort_request_targets_an_open_session() {
        let supplier = supplier(1, 2);
        let initiate = supplier.get().await.unwrap().unwrap();
        let body = "<InitiateMultipartUploadResult><UploadId>u-9</UploadId>\
                    </InitiateMultipartUploadResult>";
        supplier
            .on_completed(&respond(&initiate, 200, Vec::new(), body))
            .await
            .unwrap();

        assert!(supplier.abort_request("missing").is_err());
        let abort = supplier.abort_request("u-9").unwrap();
        assert_eq!(abort.operation, Operation::MultipartWriteAbort);
        assert_eq!(abort.method, Method::Delete);
        assert!(abort.uri.ends_with("?uploadId=u-9"));
        assert_eq!(abort.context[keys::MULTIPART_REQUEST], "ABORT");

        // an abort response erases the session and frees its slot
        supplier
            .on_completed(&respond(&abort, 204, Vec::new(), ""))
            .await
            .unwrap();
        let next = supplier.get().await.unwrap().unwrap();
        assert_eq!(next.operation, Operation::MultipartWriteInitiate);
    }

    #[tokio::test]
    async fn shutdown_unblocks_a_waiting_selector() {
        let shutdown = ShutdownToken::new();
        let supplier = MultipartRequestSupplier::new(
            Scheme::Http,
            ValueSupplier::constant("h"),
            None,
            None,
            vec![
                ContextProducer::ContainerName {
                    base: ValueSupplier::constant("c"),
                    suffix: None,
                },
                ContextProducer::ObjectName(ObjectNameSource::Generate),
                ContextProducer::ObjectSize(SizeGenerator::new(&SizeSpec::Fixed(8)).unwrap()),
            ],
            Vec::new(),
            SizeGenerator::new(&SizeSpec::Fixed(4)).unwrap(),
            1,
            1,
            DataType::Zeroes,
            false,
            false,
            false,
            shutdown.clone(),
        )
        .unwrap();

        // consume the one slot, then stop while the selector waits
        let _initiate = supplier.get().await.unwrap().unwrap();
        let waiter = tokio::spawn(async move { supplier.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.stop();
        assert!(waiter.await.unwrap().unwrap().is_none());
    }
}
