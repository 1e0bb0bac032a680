use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fitcheck_contracts::errors::{FailureKind, Stage, TryOnError};
use fitcheck_contracts::events::{new_session_id, TracePayload, TraceWriter};
use fitcheck_contracts::models::{ModelRegistry, ModelSelector};
use fitcheck_contracts::receipts::{build_variant_receipt, write_receipt};
use fitcheck_contracts::tryon::{
    AssetReference, AttemptOutcome, EndpointContract, FieldVariant, InvocationAttempt,
    NormalizedImage, RawOutput, ReferenceKind, ResultImageReference, SizeEnvelope, TryOnParams,
    VariantOutcome, VariantResult,
};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// Remote-service configuration, resolved once at startup.
///
/// Everything the transports need lives here so the pipeline itself never
/// reads the process environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub replicate_api_base: String,
    pub replicate_api_token: Option<String>,
    pub segmind_api_base: String,
    pub segmind_api_key: Option<String>,
    pub openai_api_base: String,
    pub openai_api_key: Option<String>,
    pub narrator_model: String,
    pub upload_timeout_s: f64,
    pub invoke_timeout_s: f64,
    pub poll_interval_s: f64,
    pub poll_timeout_s: f64,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            replicate_api_base: base_url_env("REPLICATE_API_BASE", "https://api.replicate.com/v1"),
            replicate_api_token: non_empty_env("REPLICATE_API_TOKEN")
                .or_else(|| non_empty_env("REPLICATE_API_KEY")),
            segmind_api_base: base_url_env("SEGMIND_API_BASE", "https://api.segmind.com/v1"),
            segmind_api_key: non_empty_env("SEGMIND_API_KEY"),
            openai_api_base: base_url_env("OPENAI_API_BASE", "https://api.openai.com/v1"),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            narrator_model: non_empty_env("OPENAI_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replicate_api_base: "https://api.replicate.com/v1".to_string(),
            replicate_api_token: None,
            segmind_api_base: "https://api.segmind.com/v1".to_string(),
            segmind_api_key: None,
            openai_api_base: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            narrator_model: "gpt-4o-mini".to_string(),
            upload_timeout_s: 60.0,
            invoke_timeout_s: 180.0,
            poll_interval_s: 1.0,
            poll_timeout_s: 120.0,
        }
    }
}

/// Retry shape for invocations: how often a transient failure is retried in
/// place, how many invocations a single variant may spend in total, and the
/// backoff curve between retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub transient_retries: usize,
    pub attempt_budget: usize,
    pub backoff_base_s: f64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    fn delay_s(&self, attempt: usize) -> f64 {
        self.backoff_base_s * self.backoff_multiplier.powi(attempt as i32)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transient_retries: 2,
            attempt_budget: 6,
            backoff_base_s: 0.8,
            backoff_multiplier: 1.7,
        }
    }
}

/// Decode any supported format, force RGB, and re-encode as JPEG inside the
/// contract envelope.
///
/// Images with a short side under `min_short_side` are pulled up to it;
/// otherwise images with a long side over `max_long_side` are pushed down.
/// Anything already inside the envelope keeps its native dimensions.
pub fn normalize_image(
    raw: &[u8],
    envelope: &SizeEnvelope,
    file_name: &str,
) -> Result<NormalizedImage, TryOnError> {
    let decoded = image::load_from_memory(raw).map_err(|err| TryOnError::Decode {
        detail: truncate_text(&err.to_string(), 256),
    })?;
    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
    let (width, height) = (rgb.width(), rgb.height());
    if width == 0 || height == 0 {
        return Err(TryOnError::Decode {
            detail: "image has no pixels".to_string(),
        });
    }

    let short_side = width.min(height) as f64;
    let long_side = width.max(height) as f64;
    let scale = if short_side < envelope.min_short_side as f64 {
        envelope.min_short_side as f64 / short_side
    } else if long_side > envelope.max_long_side as f64 {
        envelope.max_long_side as f64 / long_side
    } else {
        1.0
    };

    let sized = if scale != 1.0 {
        let target_w = ((width as f64 * scale).round() as u32).max(1);
        let target_h = ((height as f64 * scale).round() as u32).max(1);
        rgb.resize_exact(target_w, target_h, FilterType::Lanczos3)
    } else {
        rgb
    };

    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, envelope.jpeg_quality);
    encoder
        .encode_image(&sized)
        .map_err(|err| TryOnError::Decode {
            detail: format!("jpeg encode failed: {err}"),
        })?;

    Ok(NormalizedImage {
        bytes,
        file_name: file_name.to_string(),
        width: sized.width(),
        height: sized.height(),
    })
}

/// Liveness check for hosted URLs before they are trusted in a payload.
pub trait UrlProbe: Send + Sync {
    fn is_live_image(&self, url: &str) -> bool;
}

/// HEAD first; if that is refused or inconclusive, pull a small byte range
/// and sniff the magic bytes.
pub struct HttpUrlProbe {
    http: HttpClient,
    timeout: Duration,
}

impl HttpUrlProbe {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
            timeout: Duration::from_secs_f64(10.0),
        }
    }
}

impl UrlProbe for HttpUrlProbe {
    fn is_live_image(&self, url: &str) -> bool {
        if let Ok(response) = self.http.head(url).timeout(self.timeout).send() {
            if response.status().is_success() {
                if let Some(content_type) = header_content_type(&response) {
                    if content_type.starts_with("image/") {
                        return true;
                    }
                }
            }
        }

        let Ok(response) = self
            .http
            .get(url)
            .header("Range", "bytes=0-2047")
            .timeout(self.timeout)
            .send()
        else {
            return false;
        };
        if !response.status().is_success() {
            return false;
        }
        if let Some(content_type) = header_content_type(&response) {
            if content_type.starts_with("image/") {
                return true;
            }
        }
        let Ok(bytes) = response.bytes() else {
            return false;
        };
        image::guess_format(&bytes).is_ok()
    }
}

/// One place normalized bytes can be turned into a public URL.
pub trait HostingBackend: Send + Sync {
    fn name(&self) -> &str;
    fn upload(&self, image: &NormalizedImage) -> Result<String>;
}

/// Replicate's file store. Preferred when a token is present since results
/// stay inside the same auth domain as the primary models.
pub struct ReplicateFilesHost {
    api_base: String,
    api_token: String,
    http: HttpClient,
    timeout: Duration,
}

impl ReplicateFilesHost {
    pub fn new(api_base: &str, api_token: &str, upload_timeout_s: f64) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            http: HttpClient::new(),
            timeout: Duration::from_secs_f64(upload_timeout_s),
        }
    }
}

impl HostingBackend for ReplicateFilesHost {
    fn name(&self) -> &str {
        "replicate-files"
    }

    fn upload(&self, image: &NormalizedImage) -> Result<String> {
        let endpoint = format!("{}/files", self.api_base);
        let part = MultipartPart::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str("image/jpeg")
            .context("invalid upload mime type")?;
        let form = MultipartForm::new().part("content", part);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_token)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .with_context(|| format!("replicate file upload failed ({endpoint})"))?;
        let payload = response_json_or_error("replicate-files", response)?;
        payload
            .get("urls")
            .and_then(Value::as_object)
            .and_then(|urls| urls.get("get"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("replicate file response missing serving url"))
    }
}

/// Anonymous host. The upload response carries a browser page URL; only the
/// `/dl/` form serves raw bytes, so the URL is rewritten before use.
pub struct TmpfilesHost {
    endpoint: String,
    http: HttpClient,
    timeout: Duration,
}

impl TmpfilesHost {
    pub fn new(upload_timeout_s: f64) -> Self {
        Self {
            endpoint: "https://tmpfiles.org/api/v1/upload".to_string(),
            http: HttpClient::new(),
            timeout: Duration::from_secs_f64(upload_timeout_s),
        }
    }
}

fn tmpfiles_direct_url(page_url: &str) -> String {
    let trimmed = page_url.trim();
    if trimmed.contains("tmpfiles.org/dl/") {
        return trimmed.to_string();
    }
    trimmed.replacen("tmpfiles.org/", "tmpfiles.org/dl/", 1)
}

impl HostingBackend for TmpfilesHost {
    fn name(&self) -> &str {
        "tmpfiles"
    }

    fn upload(&self, image: &NormalizedImage) -> Result<String> {
        let part = MultipartPart::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str("image/jpeg")
            .context("invalid upload mime type")?;
        let form = MultipartForm::new().part("file", part);
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .with_context(|| format!("tmpfiles upload failed ({})", self.endpoint))?;
        let payload = response_json_or_error("tmpfiles", response)?;
        let page_url = payload
            .get("data")
            .and_then(Value::as_object)
            .and_then(|data| data.get("url"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("tmpfiles response missing url"))?;
        Ok(tmpfiles_direct_url(page_url))
    }
}

/// Anonymous host with a plain-text response body.
pub struct CatboxHost {
    endpoint: String,
    http: HttpClient,
    timeout: Duration,
}

impl CatboxHost {
    pub fn new(upload_timeout_s: f64) -> Self {
        Self {
            endpoint: "https://catbox.moe/user/api.php".to_string(),
            http: HttpClient::new(),
            timeout: Duration::from_secs_f64(upload_timeout_s),
        }
    }
}

impl HostingBackend for CatboxHost {
    fn name(&self) -> &str {
        "catbox"
    }

    fn upload(&self, image: &NormalizedImage) -> Result<String> {
        let part = MultipartPart::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str("image/jpeg")
            .context("invalid upload mime type")?;
        let form = MultipartForm::new()
            .text("reqtype", "fileupload")
            .part("fileToUpload", part);
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .with_context(|| format!("catbox upload failed ({})", self.endpoint))?;
        let status = response.status();
        let code = status.as_u16();
        let body = response
            .text()
            .context("catbox response body read failed")?;
        if !status.is_success() {
            bail!(
                "catbox upload failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let url = body.trim();
        if !url.starts_with("http") {
            bail!(
                "catbox returned an unexpected body: {}",
                truncate_text(url, 512)
            );
        }
        Ok(url.to_string())
    }
}

pub fn default_hosting_backends(config: &EngineConfig) -> Vec<Box<dyn HostingBackend>> {
    let mut backends: Vec<Box<dyn HostingBackend>> = Vec::new();
    if let Some(token) = &config.replicate_api_token {
        backends.push(Box::new(ReplicateFilesHost::new(
            &config.replicate_api_base,
            token,
            config.upload_timeout_s,
        )));
    }
    backends.push(Box::new(TmpfilesHost::new(config.upload_timeout_s)));
    backends.push(Box::new(CatboxHost::new(config.upload_timeout_s)));
    backends
}

/// Turns normalized bytes into the reference kind a transport accepts.
///
/// `DirectBytes` and `InlineEncoded` never touch the network. `RemoteUrl`
/// walks the hosting backends in order, giving each a few attempts with
/// growing backoff, and only trusts URLs the probe confirms serve an image.
pub struct AssetLocator {
    backends: Vec<Box<dyn HostingBackend>>,
    probe: Box<dyn UrlProbe>,
    attempts_per_backend: usize,
    backoff_base_s: f64,
    backoff_multiplier: f64,
    trace: Option<TraceWriter>,
}

impl AssetLocator {
    pub fn new(backends: Vec<Box<dyn HostingBackend>>, probe: Box<dyn UrlProbe>) -> Self {
        Self {
            backends,
            probe,
            attempts_per_backend: 3,
            backoff_base_s: 0.8,
            backoff_multiplier: 1.7,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Option<TraceWriter>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_backoff(mut self, base_s: f64, multiplier: f64) -> Self {
        self.backoff_base_s = base_s;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn locate(
        &self,
        image: &NormalizedImage,
        kind: ReferenceKind,
    ) -> Result<AssetReference, TryOnError> {
        match kind {
            ReferenceKind::DirectBytes => Ok(AssetReference::DirectBytes {
                bytes: image.bytes.clone(),
                file_name: image.file_name.clone(),
            }),
            ReferenceKind::InlineEncoded => {
                Ok(AssetReference::InlineEncoded(BASE64.encode(&image.bytes)))
            }
            ReferenceKind::RemoteUrl => self.host_url(image).map(AssetReference::RemoteUrl),
        }
    }

    fn host_url(&self, image: &NormalizedImage) -> Result<String, TryOnError> {
        if self.backends.is_empty() {
            return Err(TryOnError::HostingExhausted {
                detail: "no hosting backends configured".to_string(),
            });
        }
        let mut last_detail = String::new();
        for backend in &self.backends {
            for attempt in 0..self.attempts_per_backend {
                if attempt > 0 {
                    self.record_upload_retry(backend.name(), attempt, &last_detail);
                    let delay_s =
                        self.backoff_base_s * self.backoff_multiplier.powi(attempt as i32 - 1);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
                match backend.upload(image) {
                    Ok(url) => {
                        if self.probe.is_live_image(&url) {
                            return Ok(url);
                        }
                        last_detail = format!(
                            "{}: uploaded url failed the liveness probe",
                            backend.name()
                        );
                    }
                    Err(err) => {
                        last_detail =
                            format!("{}: {}", backend.name(), error_chain_text(&err, 512));
                    }
                }
            }
        }
        Err(TryOnError::HostingExhausted {
            detail: last_detail,
        })
    }

    fn record_upload_retry(&self, backend: &str, attempt: usize, detail: &str) {
        if let Some(trace) = &self.trace {
            let _ = trace.record(
                "upload_retry",
                map_object(json!({
                    "backend": backend,
                    "attempt": attempt,
                    "detail": detail,
                })),
            );
        }
    }
}

const QUOTA_MARKERS: [&str; 2] = ["insufficient_quota", "exceeded your current quota"];

/// Map an HTTP failure to the pipeline error taxonomy. Quota markers in the
/// body win over the status code; otherwise 4xx means the service rejected
/// the request shape and 5xx/timeouts are worth retrying.
fn classify_status(provider: &str, code: u16, body: &str) -> TryOnError {
    let provider = provider.to_string();
    let detail = truncate_text(body, 512);
    let lowered = body.to_ascii_lowercase();
    if QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return TryOnError::Quota { provider, detail };
    }
    match code {
        401 | 403 => TryOnError::Auth { provider, detail },
        402 | 429 => TryOnError::Quota { provider, detail },
        408 => TryOnError::Transient { provider, detail },
        code if code >= 500 => TryOnError::Transient { provider, detail },
        _ => TryOnError::Validation { provider, detail },
    }
}

fn transport_error(provider: &str, what: &str, err: reqwest::Error) -> TryOnError {
    let wrapped = anyhow::Error::new(err).context(what.to_string());
    TryOnError::Transient {
        provider: provider.to_string(),
        detail: error_chain_text(&wrapped, 512),
    }
}

/// Read the body, classify failures, and parse successful bodies as JSON.
fn classified_json(provider: &str, response: HttpResponse) -> Result<Value, TryOnError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|err| {
        transport_error(
            provider,
            &format!("{provider} response body read failed"),
            err,
        )
    })?;
    if !status.is_success() {
        return Err(classify_status(provider, code, &body));
    }
    serde_json::from_str(&body).map_err(|_| TryOnError::NoResult {
        provider: provider.to_string(),
    })
}

/// A fully located request: one endpoint contract, one field spelling, both
/// image references, and the per-variant knobs.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub contract: EndpointContract,
    pub field_variant: FieldVariant,
    pub person: AssetReference,
    pub garment: AssetReference,
    pub params: TryOnParams,
}

/// Transport binding for one remote service family.
pub trait EndpointAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn invoke(&self, request: &AdapterRequest) -> Result<RawOutput, TryOnError>;
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Box<dyn EndpointAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: EndpointAdapter + 'static>(&mut self, adapter: A) {
        self.adapters
            .insert(adapter.name().to_string(), Box::new(adapter));
    }

    pub fn get(&self, name: &str) -> Option<&dyn EndpointAdapter> {
        self.adapters.get(name).map(|adapter| adapter.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

pub fn default_adapter_registry(config: &EngineConfig) -> AdapterRegistry {
    let mut adapters = AdapterRegistry::new();
    adapters.register(DryrunAdapter);
    adapters.register(ReplicateAdapter::new(config));
    adapters.register(SegmindAdapter::new(config));
    adapters
}

pub struct ReplicateAdapter {
    api_base: String,
    api_token: Option<String>,
    http: HttpClient,
    invoke_timeout_s: f64,
    poll_interval_s: f64,
    poll_timeout_s: f64,
}

impl ReplicateAdapter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            api_base: config.replicate_api_base.clone(),
            api_token: config.replicate_api_token.clone(),
            http: HttpClient::new(),
            invoke_timeout_s: config.invoke_timeout_s,
            poll_interval_s: config.poll_interval_s.clamp(0.2, 5.0),
            poll_timeout_s: config.poll_timeout_s.clamp(10.0, 600.0),
        }
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.api_base)
    }

    fn poll_prediction(&self, poll_url: &str, api_token: &str) -> Result<Value, TryOnError> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_token)
                .send()
                .map_err(|err| {
                    transport_error(
                        "replicate",
                        &format!("replicate poll request failed ({poll_url})"),
                        err,
                    )
                })?;
            let payload = classified_json("replicate", response)?;
            let status = payload
                .get("status")
                .and_then(Value::as_str)
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_default();
            if status == "succeeded" {
                return Ok(payload);
            }
            if matches!(status.as_str(), "failed" | "canceled") {
                return Err(prediction_failure("replicate", &payload));
            }
            if started.elapsed().as_secs_f64() >= self.poll_timeout_s {
                return Err(TryOnError::Transient {
                    provider: "replicate".to_string(),
                    detail: format!("polling timed out after {:.1}s", self.poll_timeout_s),
                });
            }
            thread::sleep(Duration::from_secs_f64(self.poll_interval_s));
        }
    }
}

fn prediction_failure(provider: &str, prediction: &Value) -> TryOnError {
    let detail = prediction
        .get("error")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| truncate_text(value, 512))
        .unwrap_or_else(|| "prediction reported failure without detail".to_string());
    TryOnError::Transient {
        provider: provider.to_string(),
        detail,
    }
}

/// Predictions are created against the bare version hash; the catalog pins
/// carry the `owner/name:hash` form for readability.
fn replicate_version_hash(version: &str) -> String {
    version
        .rsplit_once(':')
        .map(|(_, hash)| hash.to_string())
        .unwrap_or_else(|| version.to_string())
}

fn replicate_reference_value(reference: &AssetReference) -> Result<Value, TryOnError> {
    match reference {
        AssetReference::RemoteUrl(url) => Ok(Value::String(url.clone())),
        AssetReference::InlineEncoded(encoded) => {
            Ok(Value::String(format!("data:image/jpeg;base64,{encoded}")))
        }
        AssetReference::DirectBytes { .. } => Err(TryOnError::Validation {
            provider: "replicate".to_string(),
            detail: "raw bytes are not a wire format for predictions".to_string(),
        }),
    }
}

fn build_replicate_input(request: &AdapterRequest) -> Result<Map<String, Value>, TryOnError> {
    let mut input = Map::new();
    input.insert(
        request.field_variant.person_field.clone(),
        replicate_reference_value(&request.person)?,
    );
    input.insert(
        request.field_variant.garment_field.clone(),
        replicate_reference_value(&request.garment)?,
    );

    let contract = &request.contract;
    let params = &request.params;
    if contract.supports_knob("category") {
        input.insert(
            "category".to_string(),
            Value::String(params.category.replicate_slug().to_string()),
        );
    }
    if contract.supports_knob("crop") {
        input.insert("crop".to_string(), Value::Bool(params.crop));
    }
    if contract.supports_knob("steps") {
        input.insert("steps".to_string(), Value::Number(params.steps.into()));
    }
    if contract.supports_knob("seed") {
        if let Some(seed) = params.seed {
            input.insert("seed".to_string(), Value::Number(seed.into()));
        }
    }
    Ok(input)
}

impl EndpointAdapter for ReplicateAdapter {
    fn name(&self) -> &str {
        "replicate"
    }

    fn invoke(&self, request: &AdapterRequest) -> Result<RawOutput, TryOnError> {
        let Some(api_token) = self.api_token.clone() else {
            return Err(TryOnError::Auth {
                provider: "replicate".to_string(),
                detail: "REPLICATE_API_TOKEN not set".to_string(),
            });
        };

        let input = build_replicate_input(request)?;
        let payload = match &request.contract.version {
            Some(version) => map_object(json!({
                "version": replicate_version_hash(version),
                "input": input,
            })),
            None => map_object(json!({
                "model": request.contract.name,
                "input": input,
            })),
        };

        let endpoint = self.predictions_endpoint();
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_token)
            .header("Prefer", "wait")
            .timeout(Duration::from_secs_f64(self.invoke_timeout_s))
            .json(&Value::Object(payload))
            .send()
            .map_err(|err| {
                transport_error(
                    "replicate",
                    &format!("replicate request failed ({endpoint})"),
                    err,
                )
            })?;
        let mut prediction = classified_json("replicate", response)?;

        let status = prediction
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if status != "succeeded" {
            if matches!(status.as_str(), "starting" | "processing") {
                let poll_url = prediction
                    .get("urls")
                    .and_then(Value::as_object)
                    .and_then(|urls| urls.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| TryOnError::NoResult {
                        provider: "replicate".to_string(),
                    })?
                    .to_string();
                prediction = self.poll_prediction(&poll_url, &api_token)?;
            } else {
                return Err(prediction_failure("replicate", &prediction));
            }
        }

        let output = prediction.get("output").cloned().unwrap_or(Value::Null);
        Ok(RawOutput::Json(output))
    }
}

pub struct SegmindAdapter {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    invoke_timeout_s: f64,
}

impl SegmindAdapter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            api_base: config.segmind_api_base.clone(),
            api_key: config.segmind_api_key.clone(),
            http: HttpClient::new(),
            invoke_timeout_s: config.invoke_timeout_s,
        }
    }

    fn endpoint_for(&self, contract: &EndpointContract) -> String {
        format!("{}/{}", self.api_base, contract.name)
    }
}

fn segmind_reference_value(reference: &AssetReference) -> Result<Value, TryOnError> {
    match reference {
        AssetReference::InlineEncoded(encoded) => Ok(Value::String(encoded.clone())),
        AssetReference::RemoteUrl(url) => Ok(Value::String(url.clone())),
        AssetReference::DirectBytes { .. } => Err(TryOnError::Validation {
            provider: "segmind".to_string(),
            detail: "raw bytes are not a wire format for this endpoint".to_string(),
        }),
    }
}

fn build_segmind_payload(request: &AdapterRequest) -> Result<Map<String, Value>, TryOnError> {
    let mut payload = Map::new();
    payload.insert(
        request.field_variant.person_field.clone(),
        segmind_reference_value(&request.person)?,
    );
    payload.insert(
        request.field_variant.garment_field.clone(),
        segmind_reference_value(&request.garment)?,
    );

    let contract = &request.contract;
    let params = &request.params;
    if contract.supports_knob("category") {
        payload.insert(
            "category".to_string(),
            Value::String(params.category.segmind_label().to_string()),
        );
    }
    if contract.supports_knob("steps") {
        payload.insert(
            "num_inference_steps".to_string(),
            Value::Number(params.steps.into()),
        );
    }
    if contract.supports_knob("guidance") {
        if let Some(guidance) = params.guidance {
            if let Some(number) = serde_json::Number::from_f64(guidance) {
                payload.insert("guidance_scale".to_string(), Value::Number(number));
            }
        }
    }
    if contract.supports_knob("seed") {
        if let Some(seed) = params.seed {
            payload.insert("seed".to_string(), Value::Number(seed.into()));
        }
    }
    payload.insert("base64".to_string(), Value::Bool(false));
    Ok(payload)
}

impl EndpointAdapter for SegmindAdapter {
    fn name(&self) -> &str {
        "segmind"
    }

    fn invoke(&self, request: &AdapterRequest) -> Result<RawOutput, TryOnError> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(TryOnError::Auth {
                provider: "segmind".to_string(),
                detail: "SEGMIND_API_KEY not set".to_string(),
            });
        };

        let payload = build_segmind_payload(request)?;
        let endpoint = self.endpoint_for(&request.contract);
        let response = self
            .http
            .post(&endpoint)
            .header("x-api-key", api_key)
            .timeout(Duration::from_secs_f64(self.invoke_timeout_s))
            .json(&Value::Object(payload))
            .send()
            .map_err(|err| {
                transport_error(
                    "segmind",
                    &format!("segmind request failed ({endpoint})"),
                    err,
                )
            })?;

        let status = response.status();
        let code = status.as_u16();
        let content_type = header_content_type(&response).unwrap_or_default();
        if status.is_success() && content_type.starts_with("image/") {
            let bytes = response
                .bytes()
                .map_err(|err| {
                    transport_error("segmind", "segmind image body read failed", err)
                })?
                .to_vec();
            return Ok(RawOutput::Bytes {
                bytes,
                mime: content_type,
            });
        }

        let body = response.text().map_err(|err| {
            transport_error("segmind", "segmind response body read failed", err)
        })?;
        if !status.is_success() {
            return Err(classify_status("segmind", code, &body));
        }
        match serde_json::from_str(&body) {
            Ok(parsed) => Ok(RawOutput::Json(parsed)),
            Err(_) => Err(TryOnError::NoResult {
                provider: "segmind".to_string(),
            }),
        }
    }
}

/// Offline stand-in that renders a deterministic flat-color JPEG from the
/// request digest. Keeps the whole walk exercisable without credentials.
pub struct DryrunAdapter;

impl DryrunAdapter {
    fn render(request: &AdapterRequest) -> Result<Vec<u8>, TryOnError> {
        let mut hasher = Sha256::new();
        hasher.update(request.person.describe().as_bytes());
        hasher.update(request.garment.describe().as_bytes());
        hasher.update(request.params.seed.unwrap_or_default().to_be_bytes());
        let digest = hasher.finalize();

        let mut image = RgbImage::new(96, 128);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([digest[0], digest[1], digest[2]]);
        }
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        encoder
            .encode_image(&DynamicImage::ImageRgb8(image))
            .map_err(|_| TryOnError::NoResult {
                provider: "dryrun".to_string(),
            })?;
        Ok(bytes)
    }
}

impl EndpointAdapter for DryrunAdapter {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn invoke(&self, request: &AdapterRequest) -> Result<RawOutput, TryOnError> {
        let bytes = Self::render(request)?;
        Ok(RawOutput::Bytes {
            bytes,
            mime: "image/jpeg".to_string(),
        })
    }
}

const RESULT_KEYS: [&str; 8] = [
    "images", "image", "output", "result", "results", "urls", "url", "data",
];

/// Pull the one usable image reference out of a raw service response.
///
/// `None` means the transport succeeded but nothing image-shaped was found.
/// Callers must not confuse that with a transport failure.
pub fn resolve_output(output: &RawOutput) -> Option<ResultImageReference> {
    match output {
        RawOutput::Bytes { bytes, mime } => {
            if bytes.is_empty() {
                None
            } else {
                Some(ResultImageReference::Bytes {
                    bytes: bytes.clone(),
                    mime: mime.clone(),
                })
            }
        }
        RawOutput::Json(value) => resolve_value(value, 0),
    }
}

/// URL strings and lists are accepted at any depth; descending into known
/// result-carrying keys happens once, from the top-level object only.
fn resolve_value(value: &Value, depth: usize) -> Option<ResultImageReference> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if is_http_url(trimmed) {
                return Some(ResultImageReference::Url(trimmed.to_string()));
            }
            None
        }
        Value::Array(items) => resolve_value(items.first()?, depth),
        Value::Object(map) => {
            for key in ["url", "href"] {
                if let Some(Value::String(text)) = map.get(key) {
                    let trimmed = text.trim();
                    if is_http_url(trimmed) {
                        return Some(ResultImageReference::Url(trimmed.to_string()));
                    }
                }
            }
            for key in ["b64_json", "image", "base64"] {
                if let Some(Value::String(text)) = map.get(key) {
                    if let Some(reference) = decode_inline_image(text) {
                        return Some(reference);
                    }
                }
            }
            if depth == 0 {
                for key in RESULT_KEYS {
                    if let Some(inner) = map.get(key) {
                        if let Some(reference) = resolve_value(inner, depth + 1) {
                            return Some(reference);
                        }
                    }
                }
            }
            None
        }
        _ => None,
    }
}

fn decode_inline_image(text: &str) -> Option<ResultImageReference> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if is_http_url(trimmed) {
        return Some(ResultImageReference::Url(trimmed.to_string()));
    }
    let encoded = trimmed
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .map(|(_, data)| data)
        .unwrap_or(trimmed);
    let bytes = BASE64.decode(encoded.as_bytes()).ok()?;
    if bytes.is_empty() {
        return None;
    }
    let mime = image::guess_format(&bytes)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| "image/png".to_string());
    Some(ResultImageReference::Bytes { bytes, mime })
}

fn stage_for_kind(kind: FailureKind) -> Stage {
    match kind {
        FailureKind::Decode => Stage::Preprocess,
        FailureKind::HostingExhausted => Stage::Hosting,
        FailureKind::NoResult => Stage::Resolution,
        _ => Stage::Invocation,
    }
}

fn variant_seed(base: Option<i64>, variant_index: usize) -> Option<i64> {
    base.map(|seed| seed.saturating_add(variant_index as i64))
}

fn failed_variant(
    variant_index: usize,
    seed: Option<i64>,
    attempts: Vec<InvocationAttempt>,
    stage: Stage,
    err: TryOnError,
) -> VariantResult {
    VariantResult {
        variant_index,
        seed,
        outcome: VariantOutcome::Failure {
            stage,
            kind: err.kind(),
            detail: err.to_string(),
        },
        attempts,
    }
}

fn record_trace(trace: Option<&TraceWriter>, event: &str, payload: TracePayload) {
    if let Some(trace) = trace {
        let _ = trace.record(event, payload);
    }
}

/// One variant's walk across the fallback chain.
///
/// Per contract: normalize to its envelope, then try each accepted reference
/// kind; hosting failures fall through to the next kind. Per field spelling:
/// validation rejections advance to the next spelling, transient failures
/// retry in place, auth and quota failures end the variant at once, and an
/// empty resolution is terminal. A hard budget caps total invocations.
fn run_single_variant(
    adapters: &AdapterRegistry,
    locator: &AssetLocator,
    chain: &[EndpointContract],
    person_bytes: &[u8],
    garment_bytes: &[u8],
    params: &TryOnParams,
    variant_index: usize,
    policy: &RetryPolicy,
    trace: Option<&TraceWriter>,
) -> VariantResult {
    let seed = params.seed;
    let mut attempts: Vec<InvocationAttempt> = Vec::new();
    let mut budget = policy.attempt_budget.max(1);
    let mut last_failure = (
        Stage::Invocation,
        FailureKind::Transient,
        "no endpoint accepted the request".to_string(),
    );

    'chain: for contract in chain {
        let Some(adapter) = adapters.get(&contract.provider) else {
            last_failure = (
                Stage::Invocation,
                FailureKind::Validation,
                format!("no adapter registered for provider '{}'", contract.provider),
            );
            continue;
        };

        record_trace(
            trace,
            "variant_preparing",
            map_object(json!({
                "variant_index": variant_index,
                "model": contract.name,
                "min_short_side": contract.envelope.min_short_side,
                "max_long_side": contract.envelope.max_long_side,
            })),
        );

        let person = match normalize_image(person_bytes, &contract.envelope, "person.jpg") {
            Ok(image) => image,
            Err(err) => return failed_variant(variant_index, seed, attempts, Stage::Preprocess, err),
        };
        let garment = match normalize_image(garment_bytes, &contract.envelope, "garment.jpg") {
            Ok(image) => image,
            Err(err) => return failed_variant(variant_index, seed, attempts, Stage::Preprocess, err),
        };

        for kind in &contract.accepts {
            let located = locator.locate(&person, *kind).and_then(|person_ref| {
                locator
                    .locate(&garment, *kind)
                    .map(|garment_ref| (person_ref, garment_ref))
            });
            let (person_ref, garment_ref) = match located {
                Ok(pair) => pair,
                Err(err) => {
                    record_trace(
                        trace,
                        "attempt_failed",
                        map_object(json!({
                            "variant_index": variant_index,
                            "model": contract.name,
                            "stage": Stage::Hosting.as_str(),
                            "kind": err.kind().as_str(),
                            "detail": err.to_string(),
                        })),
                    );
                    last_failure = (Stage::Hosting, err.kind(), err.to_string());
                    continue;
                }
            };

            for (spelling, field_variant) in contract.field_variants.iter().enumerate() {
                let request = AdapterRequest {
                    contract: contract.clone(),
                    field_variant: field_variant.clone(),
                    person: person_ref.clone(),
                    garment: garment_ref.clone(),
                    params: params.clone(),
                };
                let mut transient_used = 0;
                loop {
                    if budget == 0 {
                        break 'chain;
                    }
                    budget -= 1;

                    record_trace(
                        trace,
                        "variant_invoking",
                        map_object(json!({
                            "variant_index": variant_index,
                            "model": contract.name,
                            "provider": contract.provider,
                            "field_variant": spelling,
                            "reference_kind": kind.as_str(),
                            "seed": seed,
                        })),
                    );

                    match adapter.invoke(&request) {
                        Ok(raw) => {
                            attempts.push(InvocationAttempt {
                                adapter: contract.provider.clone(),
                                field_variant: spelling,
                                reference_kind: *kind,
                                outcome: AttemptOutcome::Success,
                            });
                            record_trace(
                                trace,
                                "variant_resolving",
                                map_object(json!({
                                    "variant_index": variant_index,
                                    "model": contract.name,
                                })),
                            );
                            return match resolve_output(&raw) {
                                Some(reference) => VariantResult {
                                    variant_index,
                                    seed,
                                    outcome: VariantOutcome::Success(reference),
                                    attempts,
                                },
                                None => failed_variant(
                                    variant_index,
                                    seed,
                                    attempts,
                                    Stage::Resolution,
                                    TryOnError::NoResult {
                                        provider: contract.provider.clone(),
                                    },
                                ),
                            };
                        }
                        Err(err) => {
                            let failure_kind = err.kind();
                            let detail = err.to_string();
                            attempts.push(InvocationAttempt {
                                adapter: contract.provider.clone(),
                                field_variant: spelling,
                                reference_kind: *kind,
                                outcome: AttemptOutcome::Failed {
                                    kind: failure_kind,
                                    detail: detail.clone(),
                                },
                            });
                            record_trace(
                                trace,
                                "attempt_failed",
                                map_object(json!({
                                    "variant_index": variant_index,
                                    "model": contract.name,
                                    "stage": stage_for_kind(failure_kind).as_str(),
                                    "kind": failure_kind.as_str(),
                                    "detail": detail,
                                })),
                            );
                            last_failure = (stage_for_kind(failure_kind), failure_kind, detail);

                            match failure_kind {
                                FailureKind::Auth | FailureKind::Quota => {
                                    return failed_variant(
                                        variant_index,
                                        seed,
                                        attempts,
                                        Stage::Invocation,
                                        err,
                                    );
                                }
                                FailureKind::NoResult => {
                                    return failed_variant(
                                        variant_index,
                                        seed,
                                        attempts,
                                        Stage::Resolution,
                                        err,
                                    );
                                }
                                FailureKind::Transient => {
                                    if transient_used < policy.transient_retries {
                                        transient_used += 1;
                                        thread::sleep(Duration::from_secs_f64(
                                            policy.delay_s(transient_used - 1),
                                        ));
                                        continue;
                                    }
                                    break;
                                }
                                _ => break,
                            }
                        }
                    }
                }
            }
        }
    }

    let (stage, kind, detail) = last_failure;
    VariantResult {
        variant_index,
        seed,
        outcome: VariantOutcome::Failure {
            stage,
            kind,
            detail,
        },
        attempts,
    }
}

/// Orchestrates the person+garment synthesis walk and owns the session
/// artifacts: the trace log and one receipt per variant.
pub struct TryOnEngine {
    session_dir: PathBuf,
    trace: TraceWriter,
    registry: ModelRegistry,
    selector: ModelSelector,
    adapters: AdapterRegistry,
    locator: AssetLocator,
    policy: RetryPolicy,
}

impl TryOnEngine {
    pub fn new(config: &EngineConfig, session_dir: impl Into<PathBuf>) -> Result<Self> {
        let session_dir = session_dir.into();
        std::fs::create_dir_all(&session_dir)?;
        let trace = TraceWriter::new(session_dir.join("trace.jsonl"), new_session_id());
        let locator = AssetLocator::new(
            default_hosting_backends(config),
            Box::new(HttpUrlProbe::new()),
        )
        .with_trace(Some(trace.clone()));

        Ok(Self {
            session_dir,
            trace,
            registry: ModelRegistry::new(None),
            selector: ModelSelector::new(None),
            adapters: default_adapter_registry(config),
            locator,
            policy: RetryPolicy::default(),
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn trace_writer(&self) -> TraceWriter {
        self.trace.clone()
    }

    pub fn model_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    pub fn set_locator(&mut self, locator: AssetLocator) {
        self.locator = locator;
    }

    pub fn set_adapters(&mut self, adapters: AdapterRegistry) {
        self.adapters = adapters;
    }

    /// Run `n_variants` independently seeded synthesis attempts and return
    /// them in request order. A failed variant never blocks the others.
    pub fn run_try_on(
        &self,
        person_bytes: &[u8],
        garment_bytes: &[u8],
        model_choice: Option<&str>,
        params: &TryOnParams,
        n_variants: usize,
        allow_fallback: bool,
    ) -> Result<Vec<VariantResult>> {
        let selection = self
            .selector
            .select(model_choice)
            .map_err(|message| anyhow::anyhow!(message))?;
        let chain = if allow_fallback {
            self.registry.fallback_chain(&selection.contract.name)
        } else {
            vec![selection.contract.clone()]
        };

        self.trace.record(
            "session_started",
            map_object(json!({
                "model": selection.contract.name,
                "requested": selection.requested,
                "fallback_reason": selection.fallback_reason,
                "n_variants": n_variants.max(1),
                "chain": chain.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
                "person_digest": short_digest(person_bytes),
                "garment_digest": short_digest(garment_bytes),
            })),
        )?;

        let mut results = Vec::new();
        for variant_index in 0..n_variants.max(1) {
            let mut variant_params = params.clone();
            variant_params.seed = variant_seed(params.seed, variant_index);

            let result = run_single_variant(
                &self.adapters,
                &self.locator,
                &chain,
                person_bytes,
                garment_bytes,
                &variant_params,
                variant_index,
                &self.policy,
                Some(&self.trace),
            );

            self.write_variant_receipt(
                &selection.contract.name,
                &selection.contract.provider,
                params,
                n_variants,
                person_bytes,
                garment_bytes,
                &result,
            )?;

            match &result.outcome {
                VariantOutcome::Success(reference) => {
                    self.trace.record(
                        "variant_succeeded",
                        map_object(json!({
                            "variant_index": variant_index,
                            "seed": result.seed,
                            "result": reference.describe(),
                        })),
                    )?;
                }
                VariantOutcome::Failure {
                    stage,
                    kind,
                    detail,
                } => {
                    self.trace.record(
                        "variant_failed",
                        map_object(json!({
                            "variant_index": variant_index,
                            "seed": result.seed,
                            "stage": stage.as_str(),
                            "kind": kind.as_str(),
                            "detail": detail,
                        })),
                    )?;
                }
            }

            results.push(result);
        }

        let succeeded = results
            .iter()
            .filter(|result| result.outcome.is_success())
            .count();
        self.trace.record(
            "session_finished",
            map_object(json!({
                "variants": results.len(),
                "succeeded": succeeded,
                "failed": results.len() - succeeded,
            })),
        )?;

        Ok(results)
    }

    fn write_variant_receipt(
        &self,
        model: &str,
        provider: &str,
        params: &TryOnParams,
        n_variants: usize,
        person_bytes: &[u8],
        garment_bytes: &[u8],
        result: &VariantResult,
    ) -> Result<()> {
        let receipt_path = self
            .session_dir
            .join(format!("variant-{:02}.json", result.variant_index));
        let request_summary = map_object(json!({
            "model": model,
            "category": params.category.replicate_slug(),
            "crop": params.crop,
            "steps": params.steps,
            "guidance": params.guidance,
            "seed": params.seed,
            "n_variants": n_variants.max(1),
            "person_digest": short_digest(person_bytes),
            "garment_digest": short_digest(garment_bytes),
        }));
        let receipt = build_variant_receipt(
            self.trace.session_id(),
            model,
            provider,
            &request_summary,
            result,
            &receipt_path,
        );
        write_receipt(&receipt_path, &receipt)
    }
}

/// K prominent colors from an image, as lowercase hex strings.
///
/// Plain k-means over a 64x64 thumbnail. Centers start at evenly spaced
/// pixels so the same bytes always give the same palette.
pub fn extract_palette(image_bytes: &[u8], k: usize) -> Result<Vec<String>, TryOnError> {
    let decoded = image::load_from_memory(image_bytes).map_err(|err| TryOnError::Decode {
        detail: truncate_text(&err.to_string(), 256),
    })?;
    let thumb = decoded.resize_exact(64, 64, FilterType::Triangle).to_rgb8();
    let data: Vec<[f32; 3]> = thumb
        .pixels()
        .map(|pixel| [pixel[0] as f32, pixel[1] as f32, pixel[2] as f32])
        .collect();
    let k = k.clamp(1, data.len());

    let mut centers: Vec<[f32; 3]> = (0..k)
        .map(|index| data[(index * data.len() / k).min(data.len() - 1)])
        .collect();

    for _ in 0..6 {
        let mut sums = vec![[0.0f32; 3]; k];
        let mut counts = vec![0usize; k];
        for pixel in &data {
            let mut best = 0;
            let mut best_distance = f32::MAX;
            for (index, center) in centers.iter().enumerate() {
                let distance = squared_distance(pixel, center);
                if distance < best_distance {
                    best_distance = distance;
                    best = index;
                }
            }
            for channel in 0..3 {
                sums[best][channel] += pixel[channel];
            }
            counts[best] += 1;
        }

        let mut moved = false;
        for index in 0..k {
            if counts[index] == 0 {
                continue;
            }
            let mut next = [0.0f32; 3];
            for channel in 0..3 {
                next[channel] = sums[index][channel] / counts[index] as f32;
            }
            if squared_distance(&next, &centers[index]) > 1e-6 {
                moved = true;
            }
            centers[index] = next;
        }
        if !moved {
            break;
        }
    }

    Ok(centers.iter().map(rgb_to_hex).collect())
}

fn squared_distance(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    dr * dr + dg * dg + db * db
}

fn rgb_to_hex(center: &[f32; 3]) -> String {
    format!(
        "#{:02x}{:02x}{:02x}",
        center[0].round().clamp(0.0, 255.0) as u8,
        center[1].round().clamp(0.0, 255.0) as u8,
        center[2].round().clamp(0.0, 255.0) as u8
    )
}

pub const STYLIST_SYSTEM_PROMPT: &str = "You are a warm, witty fashion girlfriend. \
Be concise but vivid. Explain why the pieces fit the occasion, proportions, and palette.";

const NO_KEY_NOTE: &str = "(No OpenAI key set) Showing basic suggestions.";
const QUOTA_NOTE: &str = "(AI limit reached) Showing basic suggestions.";

/// Turns a structured outfit plan into a short styled write-up.
///
/// Failures never propagate: with no key, on quota exhaustion, or on any
/// transport error the narrator returns a canned note so the plan still
/// renders.
pub struct OutfitNarrator {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
    temperature: f64,
}

impl OutfitNarrator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            api_base: config.openai_api_base.clone(),
            api_key: config.openai_api_key.clone(),
            model: config.narrator_model.clone(),
            http: HttpClient::new(),
            temperature: 0.8,
        }
    }

    pub fn describe(&self, plan_summary: &str) -> String {
        let Some(api_key) = self.api_key.clone() else {
            return NO_KEY_NOTE.to_string();
        };
        match self.chat_completion(&api_key, plan_summary) {
            Ok(text) => text,
            Err(err) => {
                let detail = error_chain_text(&err, 512);
                let lowered = detail.to_ascii_lowercase();
                if QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker)) {
                    QUOTA_NOTE.to_string()
                } else {
                    format!(
                        "(AI error) {}. Proceeding with basic description.",
                        truncate_text(&detail, 200)
                    )
                }
            }
        }
    }

    fn chat_completion(&self, api_key: &str, plan_summary: &str) -> Result<String> {
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": STYLIST_SYSTEM_PROMPT},
                {"role": "user", "content": plan_summary},
            ],
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .timeout(Duration::from_secs_f64(60.0))
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response)?;
        let text = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("OpenAI response missing message content"))?;
        Ok(text.to_string())
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn base_url_env(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn header_content_type(response: &HttpResponse) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase())
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn short_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use fitcheck_contracts::errors::{FailureKind, Stage, TryOnError};
    use fitcheck_contracts::models::ModelRegistry;
    use fitcheck_contracts::tryon::{
        AssetReference, AttemptOutcome, EndpointContract, FieldVariant, GarmentCategory,
        NormalizedImage, RawOutput, ReferenceKind, ResultImageReference, SizeEnvelope,
        TryOnParams, VariantOutcome,
    };
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use serde_json::{json, Value};

    use super::BASE64;
    use super::{
        build_replicate_input, build_segmind_payload, classify_status, extract_palette,
        normalize_image, replicate_version_hash, resolve_output, run_single_variant,
        tmpfiles_direct_url, variant_seed, AdapterRegistry, AdapterRequest, AssetLocator,
        EndpointAdapter, EngineConfig, HostingBackend, OutfitNarrator, RetryPolicy, TryOnEngine,
        UrlProbe,
    };
    use base64::Engine as _;

    fn sample_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let mut image = RgbImage::new(width, height);
        for pixel in image.pixels_mut() {
            *pixel = Rgb(color);
        }
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn split_png(width: u32, height: u32, top: [u8; 3], bottom: [u8; 3]) -> Vec<u8> {
        let mut image = RgbImage::new(width, height);
        for (_, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = if y < height / 2 { Rgb(top) } else { Rgb(bottom) };
        }
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn sample_normalized() -> NormalizedImage {
        NormalizedImage {
            bytes: vec![1, 2, 3, 4],
            file_name: "person.jpg".to_string(),
            width: 4,
            height: 1,
        }
    }

    struct StaticProbe(bool);

    impl UrlProbe for StaticProbe {
        fn is_live_image(&self, _url: &str) -> bool {
            self.0
        }
    }

    struct QueueHost {
        label: &'static str,
        queue: Mutex<VecDeque<Result<String, String>>>,
        uploads: Arc<AtomicUsize>,
    }

    impl QueueHost {
        fn new(
            label: &'static str,
            queue: Vec<Result<String, String>>,
            uploads: Arc<AtomicUsize>,
        ) -> Self {
            Self {
                label,
                queue: Mutex::new(queue.into()),
                uploads,
            }
        }
    }

    impl HostingBackend for QueueHost {
        fn name(&self) -> &str {
            self.label
        }

        fn upload(&self, _image: &NormalizedImage) -> anyhow::Result<String> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            match self.queue.lock().unwrap().pop_front() {
                Some(Ok(url)) => Ok(url),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Err(anyhow::anyhow!("upload queue exhausted")),
            }
        }
    }

    #[derive(Default)]
    struct CallLog {
        calls: Mutex<Vec<(usize, ReferenceKind, Option<i64>)>>,
    }

    struct ScriptedAdapter {
        provider: &'static str,
        script: Mutex<VecDeque<Result<RawOutput, TryOnError>>>,
        log: Arc<CallLog>,
    }

    impl ScriptedAdapter {
        fn new(
            provider: &'static str,
            script: Vec<Result<RawOutput, TryOnError>>,
            log: Arc<CallLog>,
        ) -> Self {
            Self {
                provider,
                script: Mutex::new(script.into()),
                log,
            }
        }
    }

    impl EndpointAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            self.provider
        }

        fn invoke(&self, request: &AdapterRequest) -> Result<RawOutput, TryOnError> {
            let spelling = request
                .contract
                .field_variants
                .iter()
                .position(|fv| fv == &request.field_variant)
                .unwrap_or(usize::MAX);
            self.log.calls.lock().unwrap().push((
                spelling,
                request.person.kind(),
                request.params.seed,
            ));
            self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
                Err(TryOnError::Transient {
                    provider: self.provider.to_string(),
                    detail: "script exhausted".to_string(),
                })
            })
        }
    }

    fn scripted_contract(
        accepts: &[ReferenceKind],
        field_variants: &[(&str, &str)],
    ) -> EndpointContract {
        EndpointContract {
            name: "scripted-model".to_string(),
            provider: "scripted".to_string(),
            version: None,
            accepts: accepts.to_vec(),
            field_variants: field_variants
                .iter()
                .map(|(person, garment)| FieldVariant::new(person, garment))
                .collect(),
            knobs: vec!["seed".to_string()],
            envelope: SizeEnvelope::new(8, 4096, 80),
        }
    }

    fn offline_locator() -> AssetLocator {
        AssetLocator::new(Vec::new(), Box::new(StaticProbe(false))).with_backoff(0.0, 1.0)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff_base_s: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn url_output(url: &str) -> RawOutput {
        RawOutput::Json(json!({ "output": [url] }))
    }

    #[test]
    fn normalize_upscales_below_min_short_side() -> anyhow::Result<()> {
        let raw = sample_png(300, 400, [120, 90, 60]);
        let normalized = normalize_image(&raw, &SizeEnvelope::default(), "person.jpg")?;
        assert_eq!(normalized.width, 512);
        assert_eq!(normalized.height, 683);
        assert_eq!(normalized.file_name, "person.jpg");
        Ok(())
    }

    #[test]
    fn normalize_downscales_above_max_long_side() -> anyhow::Result<()> {
        let raw = sample_png(2000, 2000, [10, 20, 30]);
        let normalized = normalize_image(&raw, &SizeEnvelope::default(), "garment.jpg")?;
        assert_eq!(normalized.width, 1536);
        assert_eq!(normalized.height, 1536);
        Ok(())
    }

    #[test]
    fn normalize_keeps_images_already_inside_envelope() -> anyhow::Result<()> {
        let raw = sample_png(800, 600, [200, 200, 200]);
        let normalized = normalize_image(&raw, &SizeEnvelope::default(), "person.jpg")?;
        assert_eq!(normalized.width, 800);
        assert_eq!(normalized.height, 600);
        assert_eq!(image::guess_format(&normalized.bytes)?, ImageFormat::Jpeg);
        Ok(())
    }

    #[test]
    fn normalize_is_stable_after_one_pass() -> anyhow::Result<()> {
        let raw = sample_png(300, 400, [90, 120, 150]);
        let envelope = SizeEnvelope::default();
        let first = normalize_image(&raw, &envelope, "person.jpg")?;
        let second = normalize_image(&first.bytes, &envelope, "person.jpg")?;
        assert_eq!((second.width, second.height), (first.width, first.height));
        Ok(())
    }

    #[test]
    fn normalize_rejects_non_image_bytes() {
        let err = normalize_image(b"definitely not pixels", &SizeEnvelope::default(), "x.jpg")
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Decode);
    }

    #[test]
    fn tmpfiles_page_url_gains_dl_segment() {
        assert_eq!(
            tmpfiles_direct_url("https://tmpfiles.org/1234/photo.jpg"),
            "https://tmpfiles.org/dl/1234/photo.jpg"
        );
        assert_eq!(
            tmpfiles_direct_url("https://tmpfiles.org/dl/1234/photo.jpg"),
            "https://tmpfiles.org/dl/1234/photo.jpg"
        );
    }

    #[test]
    fn locator_serves_direct_and_inline_without_backends() -> anyhow::Result<()> {
        let locator = offline_locator();
        let image = sample_normalized();

        let direct = locator.locate(&image, ReferenceKind::DirectBytes)?;
        match direct {
            AssetReference::DirectBytes { bytes, file_name } => {
                assert_eq!(bytes, image.bytes);
                assert_eq!(file_name, "person.jpg");
            }
            other => panic!("unexpected reference: {other:?}"),
        }

        let inline = locator.locate(&image, ReferenceKind::InlineEncoded)?;
        match inline {
            AssetReference::InlineEncoded(encoded) => {
                assert_eq!(BASE64.decode(encoded.as_bytes())?, image.bytes);
            }
            other => panic!("unexpected reference: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn locator_walks_backends_in_declared_order() -> anyhow::Result<()> {
        let first_uploads = Arc::new(AtomicUsize::new(0));
        let second_uploads = Arc::new(AtomicUsize::new(0));
        let backends: Vec<Box<dyn HostingBackend>> = vec![
            Box::new(QueueHost::new("first", Vec::new(), first_uploads.clone())),
            Box::new(QueueHost::new(
                "second",
                vec![Ok("https://files.test/a.jpg".to_string())],
                second_uploads.clone(),
            )),
        ];
        let locator =
            AssetLocator::new(backends, Box::new(StaticProbe(true))).with_backoff(0.0, 1.0);

        let reference = locator.locate(&sample_normalized(), ReferenceKind::RemoteUrl)?;
        match reference {
            AssetReference::RemoteUrl(url) => assert_eq!(url, "https://files.test/a.jpg"),
            other => panic!("unexpected reference: {other:?}"),
        }
        assert_eq!(first_uploads.load(Ordering::SeqCst), 3);
        assert_eq!(second_uploads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn locator_retries_a_backend_before_moving_on() -> anyhow::Result<()> {
        let uploads = Arc::new(AtomicUsize::new(0));
        let backends: Vec<Box<dyn HostingBackend>> = vec![Box::new(QueueHost::new(
            "flaky",
            vec![
                Err("connection reset".to_string()),
                Ok("https://files.test/b.jpg".to_string()),
            ],
            uploads.clone(),
        ))];
        let locator =
            AssetLocator::new(backends, Box::new(StaticProbe(true))).with_backoff(0.0, 1.0);

        let reference = locator.locate(&sample_normalized(), ReferenceKind::RemoteUrl)?;
        match reference {
            AssetReference::RemoteUrl(url) => assert_eq!(url, "https://files.test/b.jpg"),
            other => panic!("unexpected reference: {other:?}"),
        }
        assert_eq!(uploads.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn locator_never_trusts_urls_failing_the_probe() {
        let uploads = Arc::new(AtomicUsize::new(0));
        let backends: Vec<Box<dyn HostingBackend>> = vec![Box::new(QueueHost::new(
            "pages",
            vec![
                Ok("https://files.test/page/1".to_string()),
                Ok("https://files.test/page/2".to_string()),
                Ok("https://files.test/page/3".to_string()),
            ],
            uploads.clone(),
        ))];
        let locator =
            AssetLocator::new(backends, Box::new(StaticProbe(false))).with_backoff(0.0, 1.0);

        let err = locator
            .locate(&sample_normalized(), ReferenceKind::RemoteUrl)
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::HostingExhausted);
        assert!(err.to_string().contains("liveness"));
        assert_eq!(uploads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn resolver_extracts_urls_from_common_shapes() {
        let url = "https://cdn.test/result.png";
        let cases = [
            json!(url),
            json!([url]),
            json!({ "output": [url] }),
            json!({ "images": [{ "url": url }] }),
            json!({ "result": { "href": url } }),
            json!({ "urls": url }),
        ];
        for case in cases {
            match resolve_output(&RawOutput::Json(case.clone())) {
                Some(ResultImageReference::Url(found)) => assert_eq!(found, url, "case {case}"),
                other => panic!("case {case} resolved to {other:?}"),
            }
        }
    }

    #[test]
    fn resolver_decodes_inline_base64_payloads() {
        let png = sample_png(8, 8, [1, 2, 3]);
        let encoded = BASE64.encode(&png);

        let openai_shape = json!({ "data": [{ "b64_json": encoded }] });
        match resolve_output(&RawOutput::Json(openai_shape)) {
            Some(ResultImageReference::Bytes { bytes, mime }) => {
                assert_eq!(bytes, png);
                assert_eq!(mime, "image/png");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }

        let bare_shape = json!({ "image": format!("data:image/png;base64,{}", BASE64.encode(&png)) });
        match resolve_output(&RawOutput::Json(bare_shape)) {
            Some(ResultImageReference::Bytes { bytes, .. }) => assert_eq!(bytes, png),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn resolver_returns_none_for_unusable_payloads() {
        assert!(resolve_output(&RawOutput::Json(json!({}))).is_none());
        assert!(resolve_output(&RawOutput::Json(json!(42))).is_none());
        assert!(resolve_output(&RawOutput::Json(json!("not a url"))).is_none());
        assert!(resolve_output(&RawOutput::Json(json!({ "status": "ok" }))).is_none());
        assert!(resolve_output(&RawOutput::Bytes {
            bytes: Vec::new(),
            mime: "image/jpeg".to_string(),
        })
        .is_none());
    }

    #[test]
    fn resolver_passes_raw_bytes_through() {
        let output = RawOutput::Bytes {
            bytes: vec![9, 9, 9],
            mime: "image/jpeg".to_string(),
        };
        match resolve_output(&output) {
            Some(ResultImageReference::Bytes { bytes, mime }) => {
                assert_eq!(bytes, vec![9, 9, 9]);
                assert_eq!(mime, "image/jpeg");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn classify_maps_statuses_to_failure_kinds() {
        assert_eq!(
            classify_status("replicate", 401, "bad token").kind(),
            FailureKind::Auth
        );
        assert_eq!(
            classify_status("replicate", 403, "forbidden").kind(),
            FailureKind::Auth
        );
        assert_eq!(
            classify_status("replicate", 402, "payment").kind(),
            FailureKind::Quota
        );
        assert_eq!(
            classify_status("segmind", 429, "slow down").kind(),
            FailureKind::Quota
        );
        assert_eq!(
            classify_status("segmind", 422, "unknown field").kind(),
            FailureKind::Validation
        );
        assert_eq!(
            classify_status("segmind", 404, "no such model").kind(),
            FailureKind::Validation
        );
        assert_eq!(
            classify_status("replicate", 500, "boom").kind(),
            FailureKind::Transient
        );
        assert_eq!(
            classify_status("replicate", 408, "slow").kind(),
            FailureKind::Transient
        );
        assert_eq!(
            classify_status("openai", 400, "{\"error\": \"insufficient_quota\"}").kind(),
            FailureKind::Quota
        );
    }

    #[test]
    fn validation_rejection_advances_to_next_field_spelling() {
        let log = Arc::new(CallLog::default());
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new(
            "scripted",
            vec![
                Err(TryOnError::Validation {
                    provider: "scripted".to_string(),
                    detail: "unknown field human_img".to_string(),
                }),
                Ok(url_output("https://cdn.test/v.png")),
            ],
            log.clone(),
        ));
        let chain = vec![scripted_contract(
            &[ReferenceKind::DirectBytes],
            &[("human_img", "garm_img"), ("human_image", "cloth_image")],
        )];
        let person = sample_png(16, 16, [1, 1, 1]);
        let garment = sample_png(16, 16, [2, 2, 2]);

        let result = run_single_variant(
            &adapters,
            &offline_locator(),
            &chain,
            &person,
            &garment,
            &TryOnParams::default(),
            0,
            &fast_policy(),
            None,
        );

        assert!(result.outcome.is_success());
        let calls = log.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, 0);
        assert_eq!(calls[1].0, 1);
        assert_eq!(result.attempts.len(), 2);
        assert!(matches!(
            result.attempts[0].outcome,
            AttemptOutcome::Failed {
                kind: FailureKind::Validation,
                ..
            }
        ));
        assert_eq!(result.attempts[1].outcome, AttemptOutcome::Success);
    }

    #[test]
    fn auth_failure_ends_the_variant_immediately() {
        let log = Arc::new(CallLog::default());
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new(
            "scripted",
            vec![Err(TryOnError::Auth {
                provider: "scripted".to_string(),
                detail: "key rejected".to_string(),
            })],
            log.clone(),
        ));
        let chain = vec![
            scripted_contract(
                &[ReferenceKind::DirectBytes],
                &[("human_img", "garm_img"), ("human_image", "cloth_image")],
            ),
            scripted_contract(&[ReferenceKind::DirectBytes], &[("a", "b")]),
        ];
        let person = sample_png(16, 16, [1, 1, 1]);
        let garment = sample_png(16, 16, [2, 2, 2]);

        let result = run_single_variant(
            &adapters,
            &offline_locator(),
            &chain,
            &person,
            &garment,
            &TryOnParams::default(),
            0,
            &fast_policy(),
            None,
        );

        match result.outcome {
            VariantOutcome::Failure { stage, kind, .. } => {
                assert_eq!(stage, Stage::Invocation);
                assert_eq!(kind, FailureKind::Auth);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(log.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn transient_failures_retry_the_same_spelling() {
        let log = Arc::new(CallLog::default());
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new(
            "scripted",
            vec![
                Err(TryOnError::Transient {
                    provider: "scripted".to_string(),
                    detail: "gateway timeout".to_string(),
                }),
                Ok(url_output("https://cdn.test/t.png")),
            ],
            log.clone(),
        ));
        let chain = vec![scripted_contract(
            &[ReferenceKind::DirectBytes],
            &[("human_img", "garm_img")],
        )];
        let person = sample_png(16, 16, [1, 1, 1]);
        let garment = sample_png(16, 16, [2, 2, 2]);

        let result = run_single_variant(
            &adapters,
            &offline_locator(),
            &chain,
            &person,
            &garment,
            &TryOnParams::default(),
            0,
            &fast_policy(),
            None,
        );

        assert!(result.outcome.is_success());
        let calls = log.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, 0);
        assert_eq!(calls[1].0, 0);
    }

    #[test]
    fn transient_exhaustion_falls_to_the_next_spelling() {
        let log = Arc::new(CallLog::default());
        let transient = || {
            Err(TryOnError::Transient {
                provider: "scripted".to_string(),
                detail: "connect timeout".to_string(),
            })
        };
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new(
            "scripted",
            vec![
                transient(),
                transient(),
                transient(),
                Ok(url_output("https://cdn.test/n.png")),
            ],
            log.clone(),
        ));
        let chain = vec![scripted_contract(
            &[ReferenceKind::DirectBytes],
            &[("human_img", "garm_img"), ("human_image", "cloth_image")],
        )];
        let person = sample_png(16, 16, [1, 1, 1]);
        let garment = sample_png(16, 16, [2, 2, 2]);

        let result = run_single_variant(
            &adapters,
            &offline_locator(),
            &chain,
            &person,
            &garment,
            &TryOnParams::default(),
            0,
            &fast_policy(),
            None,
        );

        assert!(result.outcome.is_success());
        let spellings: Vec<usize> = log.calls.lock().unwrap().iter().map(|c| c.0).collect();
        assert_eq!(spellings, vec![0, 0, 0, 1]);
    }

    #[test]
    fn attempt_budget_caps_total_invocations() {
        let log = Arc::new(CallLog::default());
        let script: Vec<Result<RawOutput, TryOnError>> = (0..10)
            .map(|_| {
                Err(TryOnError::Transient {
                    provider: "scripted".to_string(),
                    detail: "still down".to_string(),
                })
            })
            .collect();
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new("scripted", script, log.clone()));
        let chain = vec![scripted_contract(
            &[ReferenceKind::DirectBytes],
            &[("human_img", "garm_img"), ("human_image", "cloth_image")],
        )];
        let person = sample_png(16, 16, [1, 1, 1]);
        let garment = sample_png(16, 16, [2, 2, 2]);
        let policy = RetryPolicy {
            transient_retries: 10,
            attempt_budget: 6,
            backoff_base_s: 0.0,
            backoff_multiplier: 1.0,
        };

        let result = run_single_variant(
            &adapters,
            &offline_locator(),
            &chain,
            &person,
            &garment,
            &TryOnParams::default(),
            0,
            &policy,
            None,
        );

        assert!(!result.outcome.is_success());
        assert_eq!(log.calls.lock().unwrap().len(), 6);
    }

    #[test]
    fn empty_resolution_is_terminal_for_the_variant() {
        let log = Arc::new(CallLog::default());
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new(
            "scripted",
            vec![Ok(RawOutput::Json(json!({})))],
            log.clone(),
        ));
        let chain = vec![scripted_contract(
            &[ReferenceKind::DirectBytes],
            &[("human_img", "garm_img"), ("human_image", "cloth_image")],
        )];
        let person = sample_png(16, 16, [1, 1, 1]);
        let garment = sample_png(16, 16, [2, 2, 2]);

        let result = run_single_variant(
            &adapters,
            &offline_locator(),
            &chain,
            &person,
            &garment,
            &TryOnParams::default(),
            0,
            &fast_policy(),
            None,
        );

        match result.outcome {
            VariantOutcome::Failure { stage, kind, .. } => {
                assert_eq!(stage, Stage::Resolution);
                assert_eq!(kind, FailureKind::NoResult);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(log.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn hosting_failure_falls_to_the_next_reference_kind() {
        let log = Arc::new(CallLog::default());
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new(
            "scripted",
            vec![Ok(url_output("https://cdn.test/k.png"))],
            log.clone(),
        ));
        let chain = vec![scripted_contract(
            &[ReferenceKind::RemoteUrl, ReferenceKind::InlineEncoded],
            &[("human_img", "garm_img")],
        )];
        let person = sample_png(16, 16, [1, 1, 1]);
        let garment = sample_png(16, 16, [2, 2, 2]);

        let result = run_single_variant(
            &adapters,
            &offline_locator(),
            &chain,
            &person,
            &garment,
            &TryOnParams::default(),
            0,
            &fast_policy(),
            None,
        );

        assert!(result.outcome.is_success());
        let calls = log.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, ReferenceKind::InlineEncoded);
        assert_eq!(result.attempts[0].reference_kind, ReferenceKind::InlineEncoded);
    }

    #[test]
    fn hosting_exhaustion_across_all_kinds_fails_the_variant() {
        let log = Arc::new(CallLog::default());
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new("scripted", Vec::new(), log.clone()));
        let chain = vec![scripted_contract(
            &[ReferenceKind::RemoteUrl],
            &[("human_img", "garm_img")],
        )];
        let person = sample_png(16, 16, [1, 1, 1]);
        let garment = sample_png(16, 16, [2, 2, 2]);

        let result = run_single_variant(
            &adapters,
            &offline_locator(),
            &chain,
            &person,
            &garment,
            &TryOnParams::default(),
            0,
            &fast_policy(),
            None,
        );

        match result.outcome {
            VariantOutcome::Failure { stage, kind, .. } => {
                assert_eq!(stage, Stage::Hosting);
                assert_eq!(kind, FailureKind::HostingExhausted);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(log.calls.lock().unwrap().is_empty());
        assert!(result.attempts.is_empty());
    }

    #[test]
    fn variant_seeds_offset_from_the_base() {
        assert_eq!(variant_seed(Some(7), 0), Some(7));
        assert_eq!(variant_seed(Some(7), 1), Some(8));
        assert_eq!(variant_seed(Some(7), 2), Some(9));
        assert_eq!(variant_seed(None, 2), None);
        assert_eq!(variant_seed(Some(i64::MAX), 1), Some(i64::MAX));
    }

    #[test]
    fn replicate_input_spells_fields_and_knobs_per_contract() -> anyhow::Result<()> {
        let registry = ModelRegistry::new(None);
        let contract = registry.get("idm-vton").unwrap().clone();
        let request = AdapterRequest {
            field_variant: contract.field_variants[0].clone(),
            contract,
            person: AssetReference::RemoteUrl("https://files.test/p.jpg".to_string()),
            garment: AssetReference::RemoteUrl("https://files.test/g.jpg".to_string()),
            params: TryOnParams {
                category: GarmentCategory::Dress,
                crop: false,
                steps: 25,
                guidance: None,
                seed: Some(11),
            },
        };

        let input = build_replicate_input(&request)?;
        assert_eq!(input["human_img"], "https://files.test/p.jpg");
        assert_eq!(input["garm_img"], "https://files.test/g.jpg");
        assert_eq!(input["category"], "dresses");
        assert_eq!(input["crop"], false);
        assert_eq!(input["steps"], 25);
        assert_eq!(input["seed"], 11);
        Ok(())
    }

    #[test]
    fn replicate_input_omits_seed_when_randomized() -> anyhow::Result<()> {
        let registry = ModelRegistry::new(None);
        let contract = registry.get("idm-vton").unwrap().clone();
        let request = AdapterRequest {
            field_variant: contract.field_variants[0].clone(),
            contract,
            person: AssetReference::InlineEncoded("cGVyc29u".to_string()),
            garment: AssetReference::InlineEncoded("Z2FybWVudA==".to_string()),
            params: TryOnParams::default(),
        };

        let input = build_replicate_input(&request)?;
        assert!(!input.contains_key("seed"));
        assert_eq!(input["human_img"], "data:image/jpeg;base64,cGVyc29u");
        Ok(())
    }

    #[test]
    fn replicate_version_pin_reduces_to_bare_hash() {
        assert_eq!(
            replicate_version_hash("cuuupid/idm-vton:0513734a4521"),
            "0513734a4521"
        );
        assert_eq!(replicate_version_hash("abcdef123456"), "abcdef123456");
    }

    #[test]
    fn segmind_payload_uses_service_spellings() -> anyhow::Result<()> {
        let registry = ModelRegistry::new(None);
        let contract = registry.get("try-on-diffusion").unwrap().clone();
        let request = AdapterRequest {
            field_variant: contract.field_variants[0].clone(),
            contract,
            person: AssetReference::InlineEncoded("cGVyc29u".to_string()),
            garment: AssetReference::InlineEncoded("Z2FybWVudA==".to_string()),
            params: TryOnParams {
                category: GarmentCategory::UpperBody,
                crop: true,
                steps: 35,
                guidance: Some(2.0),
                seed: None,
            },
        };

        let payload = build_segmind_payload(&request)?;
        assert_eq!(payload["model_image"], "cGVyc29u");
        assert_eq!(payload["cloth_image"], "Z2FybWVudA==");
        assert_eq!(payload["category"], "Upper body");
        assert_eq!(payload["num_inference_steps"], 35);
        assert_eq!(payload["guidance_scale"], 2.0);
        assert_eq!(payload["base64"], false);
        assert!(!payload.contains_key("seed"));
        assert!(!payload.contains_key("crop"));
        Ok(())
    }

    #[test]
    fn engine_runs_dryrun_variants_end_to_end() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let session_dir = temp.path().join("session");
        let engine = TryOnEngine::new(&EngineConfig::default(), &session_dir)?;
        let person = sample_png(64, 64, [200, 40, 40]);
        let garment = sample_png(64, 64, [40, 40, 200]);
        let params = TryOnParams {
            seed: Some(7),
            ..TryOnParams::default()
        };

        let results = engine.run_try_on(&person, &garment, Some("dryrun"), &params, 3, false)?;

        assert_eq!(results.len(), 3);
        for (index, result) in results.iter().enumerate() {
            assert_eq!(result.variant_index, index);
            assert!(result.outcome.is_success());
        }
        let seeds: Vec<Option<i64>> = results.iter().map(|result| result.seed).collect();
        assert_eq!(seeds, vec![Some(7), Some(8), Some(9)]);

        for index in 0..3 {
            let receipt_path = session_dir.join(format!("variant-{index:02}.json"));
            let receipt: Value = serde_json::from_str(&fs::read_to_string(&receipt_path)?)?;
            assert_eq!(receipt["schema_version"], 1);
            assert_eq!(receipt["model"], "dryrun");
            assert_eq!(receipt["outcome"]["status"], "success");
        }

        let raw = fs::read_to_string(session_dir.join("trace.jsonl"))?;
        let events: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("event").and_then(Value::as_str).map(str::to_string))
            .collect();

        let started_idx = events
            .iter()
            .position(|value| value == "session_started")
            .expect("missing session_started");
        let preparing_idx = events
            .iter()
            .position(|value| value == "variant_preparing")
            .expect("missing variant_preparing");
        let invoking_idx = events
            .iter()
            .position(|value| value == "variant_invoking")
            .expect("missing variant_invoking");
        let resolving_idx = events
            .iter()
            .position(|value| value == "variant_resolving")
            .expect("missing variant_resolving");
        let succeeded_idx = events
            .iter()
            .position(|value| value == "variant_succeeded")
            .expect("missing variant_succeeded");
        let finished_idx = events
            .iter()
            .position(|value| value == "session_finished")
            .expect("missing session_finished");

        assert!(started_idx < preparing_idx);
        assert!(preparing_idx < invoking_idx);
        assert!(invoking_idx < resolving_idx);
        assert!(resolving_idx < succeeded_idx);
        assert!(succeeded_idx < finished_idx);
        Ok(())
    }

    #[test]
    fn engine_leaves_randomized_seeds_unset() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let session_dir = temp.path().join("session");
        let engine = TryOnEngine::new(&EngineConfig::default(), &session_dir)?;
        let person = sample_png(64, 64, [10, 200, 10]);
        let garment = sample_png(64, 64, [200, 10, 200]);

        let results = engine.run_try_on(
            &person,
            &garment,
            Some("dryrun"),
            &TryOnParams::default(),
            2,
            false,
        )?;

        assert!(results.iter().all(|result| result.seed.is_none()));
        let receipt: Value = serde_json::from_str(&fs::read_to_string(
            session_dir.join("variant-00.json"),
        )?)?;
        assert!(receipt["seed"].is_null());
        Ok(())
    }

    #[test]
    fn engine_reports_auth_failure_without_credentials_configured() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let session_dir = temp.path().join("session");
        let mut engine = TryOnEngine::new(&EngineConfig::default(), &session_dir)?;
        engine.set_locator(offline_locator());
        engine.set_retry_policy(fast_policy());
        let person = sample_png(64, 64, [5, 5, 5]);
        let garment = sample_png(64, 64, [250, 250, 250]);

        let results = engine.run_try_on(
            &person,
            &garment,
            Some("not-a-real-model"),
            &TryOnParams::default(),
            1,
            false,
        )?;

        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            VariantOutcome::Failure { stage, kind, detail } => {
                assert_eq!(*stage, Stage::Invocation);
                assert_eq!(*kind, FailureKind::Auth);
                assert!(!detail.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(results[0].attempts.len(), 1);
        assert_eq!(results[0].attempts[0].adapter, "replicate");

        let raw = fs::read_to_string(session_dir.join("trace.jsonl"))?;
        let started: Value = serde_json::from_str(raw.lines().next().unwrap_or("{}"))?;
        assert_eq!(started["event"], "session_started");
        assert_eq!(started["model"], "idm-vton");
        assert!(started["fallback_reason"]
            .as_str()
            .unwrap_or_default()
            .contains("not-a-real-model"));
        Ok(())
    }

    #[test]
    fn engine_keeps_sibling_variants_alive_when_one_fails() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let session_dir = temp.path().join("session");
        let mut engine = TryOnEngine::new(&EngineConfig::default(), &session_dir)?;
        engine.set_locator(offline_locator());
        engine.set_retry_policy(fast_policy());
        let log = Arc::new(CallLog::default());
        let mut adapters = AdapterRegistry::new();
        adapters.register(ScriptedAdapter::new(
            "replicate",
            vec![
                Ok(url_output("https://cdn.invalid/fit-0.png")),
                Err(TryOnError::Auth {
                    provider: "replicate".to_string(),
                    detail: "key revoked".to_string(),
                }),
                Ok(url_output("https://cdn.invalid/fit-2.png")),
            ],
            log.clone(),
        ));
        engine.set_adapters(adapters);
        let person = sample_png(64, 64, [40, 40, 40]);
        let garment = sample_png(64, 64, [210, 210, 210]);

        let results = engine.run_try_on(
            &person,
            &garment,
            Some("idm-vton"),
            &TryOnParams::default(),
            3,
            false,
        )?;

        assert_eq!(results.len(), 3);
        let indices: Vec<usize> = results.iter().map(|result| result.variant_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        match &results[0].outcome {
            VariantOutcome::Success(ResultImageReference::Url(url)) => {
                assert_eq!(url, "https://cdn.invalid/fit-0.png");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        match &results[1].outcome {
            VariantOutcome::Failure { stage, kind, .. } => {
                assert_eq!(*stage, Stage::Invocation);
                assert_eq!(*kind, FailureKind::Auth);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        match &results[2].outcome {
            VariantOutcome::Success(ResultImageReference::Url(url)) => {
                assert_eq!(url, "https://cdn.invalid/fit-2.png");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(log.calls.lock().unwrap().len(), 3);
        for index in 0..3 {
            assert!(session_dir.join(format!("variant-{index:02}.json")).exists());
        }
        Ok(())
    }

    #[test]
    fn palette_of_a_flat_image_is_that_color() -> anyhow::Result<()> {
        let png = sample_png(64, 64, [255, 0, 0]);
        let palette = extract_palette(&png, 3)?;
        assert_eq!(palette.len(), 3);
        assert!(palette.iter().all(|hex| hex == "#ff0000"));
        Ok(())
    }

    #[test]
    fn palette_separates_primary_regions() -> anyhow::Result<()> {
        let png = split_png(64, 64, [255, 0, 0], [0, 0, 255]);
        let mut palette = extract_palette(&png, 2)?;
        palette.sort();
        assert_eq!(palette, vec!["#0000ff".to_string(), "#ff0000".to_string()]);
        Ok(())
    }

    #[test]
    fn palette_rejects_non_image_bytes() {
        let err = extract_palette(b"not an image", 4).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Decode);
    }

    #[test]
    fn narrator_without_key_returns_canned_note() {
        let narrator = OutfitNarrator::new(&EngineConfig::default());
        assert_eq!(
            narrator.describe("Occasion: wedding. Budget: 300 EUR."),
            "(No OpenAI key set) Showing basic suggestions."
        );
    }
}
