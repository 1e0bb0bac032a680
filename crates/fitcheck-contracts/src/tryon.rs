use serde_json::{Map, Value};

use crate::errors::{FailureKind, Stage};

pub const DEFAULT_MIN_SHORT_SIDE: u32 = 512;
pub const DEFAULT_MAX_LONG_SIDE: u32 = 1536;
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Dimension envelope for normalized images.
///
/// Short sides below `min_short_side` are upscaled; otherwise long sides
/// above `max_long_side` are downscaled. The upscale check wins when both
/// could apply (a misconfigured envelope is a caller error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEnvelope {
    pub min_short_side: u32,
    pub max_long_side: u32,
    pub jpeg_quality: u8,
}

impl SizeEnvelope {
    pub fn new(min_short_side: u32, max_long_side: u32, jpeg_quality: u8) -> Self {
        Self {
            min_short_side,
            max_long_side,
            jpeg_quality,
        }
    }
}

impl Default for SizeEnvelope {
    fn default() -> Self {
        Self {
            min_short_side: DEFAULT_MIN_SHORT_SIDE,
            max_long_side: DEFAULT_MAX_LONG_SIDE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// RGB JPEG bytes inside the envelope, plus the file-name hint transports
/// attach to uploads.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    RemoteUrl,
    InlineEncoded,
    DirectBytes,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::RemoteUrl => "remote_url",
            ReferenceKind::InlineEncoded => "inline_encoded",
            ReferenceKind::DirectBytes => "direct_bytes",
        }
    }
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A materialized image input, in the form a transport can consume.
///
/// `InlineEncoded` carries plain standard base64; adapters that need a data
/// URI wrap it themselves.
#[derive(Debug, Clone)]
pub enum AssetReference {
    DirectBytes { bytes: Vec<u8>, file_name: String },
    RemoteUrl(String),
    InlineEncoded(String),
}

impl AssetReference {
    pub fn kind(&self) -> ReferenceKind {
        match self {
            AssetReference::DirectBytes { .. } => ReferenceKind::DirectBytes,
            AssetReference::RemoteUrl(_) => ReferenceKind::RemoteUrl,
            AssetReference::InlineEncoded(_) => ReferenceKind::InlineEncoded,
        }
    }

    /// Payload-free description for traces and receipts.
    pub fn describe(&self) -> String {
        match self {
            AssetReference::DirectBytes { bytes, file_name } => {
                format!("bytes:{}({}b)", file_name, bytes.len())
            }
            AssetReference::RemoteUrl(url) => format!("url:{url}"),
            AssetReference::InlineEncoded(encoded) => format!("base64({}b)", encoded.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarmentCategory {
    UpperBody,
    LowerBody,
    Dress,
}

impl GarmentCategory {
    /// Wire spelling used by the Replicate try-on schemas.
    pub fn replicate_slug(&self) -> &'static str {
        match self {
            GarmentCategory::UpperBody => "upper_body",
            GarmentCategory::LowerBody => "lower_body",
            GarmentCategory::Dress => "dresses",
        }
    }

    /// Wire spelling used by the Segmind try-on schema.
    pub fn segmind_label(&self) -> &'static str {
        match self {
            GarmentCategory::UpperBody => "Upper body",
            GarmentCategory::LowerBody => "Lower body",
            GarmentCategory::Dress => "Dress",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "upper" | "upper_body" | "top" => Some(GarmentCategory::UpperBody),
            "lower" | "lower_body" | "bottom" => Some(GarmentCategory::LowerBody),
            "dress" | "dresses" => Some(GarmentCategory::Dress),
            _ => None,
        }
    }
}

impl Default for GarmentCategory {
    fn default() -> Self {
        GarmentCategory::UpperBody
    }
}

/// Caller-tunable synthesis knobs.
///
/// `seed` is the base seed: variant `i` of a request is seeded `seed + i`.
/// `None` randomizes every variant, and the seed field is then omitted from
/// the wire payload entirely.
#[derive(Debug, Clone)]
pub struct TryOnParams {
    pub category: GarmentCategory,
    pub crop: bool,
    pub steps: u32,
    pub guidance: Option<f64>,
    pub seed: Option<i64>,
}

impl Default for TryOnParams {
    fn default() -> Self {
        Self {
            category: GarmentCategory::UpperBody,
            crop: true,
            steps: 30,
            guidance: None,
            seed: None,
        }
    }
}

/// One wire spelling for the two logical image roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldVariant {
    pub person_field: String,
    pub garment_field: String,
}

impl FieldVariant {
    pub fn new(person_field: &str, garment_field: &str) -> Self {
        Self {
            person_field: person_field.to_string(),
            garment_field: garment_field.to_string(),
        }
    }
}

/// Static request contract for one (service, model-version) endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointContract {
    pub name: String,
    pub provider: String,
    pub version: Option<String>,
    /// Reference kinds the transport accepts, preferred first.
    pub accepts: Vec<ReferenceKind>,
    /// Wire field spellings, declared priority order.
    pub field_variants: Vec<FieldVariant>,
    pub knobs: Vec<String>,
    pub envelope: SizeEnvelope,
}

impl EndpointContract {
    pub fn supports_knob(&self, knob: &str) -> bool {
        self.knobs.iter().any(|item| item == knob)
    }
}

/// Raw service output handed to the resolver.
#[derive(Debug, Clone)]
pub enum RawOutput {
    Json(Value),
    Bytes { bytes: Vec<u8>, mime: String },
}

/// The final artifact handed back to the caller.
#[derive(Debug, Clone)]
pub enum ResultImageReference {
    Url(String),
    Bytes { bytes: Vec<u8>, mime: String },
}

impl ResultImageReference {
    pub fn describe(&self) -> String {
        match self {
            ResultImageReference::Url(url) => url.clone(),
            ResultImageReference::Bytes { bytes, mime } => {
                format!("{mime} ({} bytes)", bytes.len())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed { kind: FailureKind, detail: String },
}

/// One submitted (adapter, field-variant, reference-kind) combination.
/// Attempts are appended, never retried in place.
#[derive(Debug, Clone)]
pub struct InvocationAttempt {
    pub adapter: String,
    pub field_variant: usize,
    pub reference_kind: ReferenceKind,
    pub outcome: AttemptOutcome,
}

impl InvocationAttempt {
    pub fn to_value(&self) -> Value {
        let mut row = Map::new();
        row.insert("adapter".to_string(), Value::String(self.adapter.clone()));
        row.insert(
            "field_variant".to_string(),
            Value::Number(self.field_variant.into()),
        );
        row.insert(
            "reference_kind".to_string(),
            Value::String(self.reference_kind.as_str().to_string()),
        );
        match &self.outcome {
            AttemptOutcome::Success => {
                row.insert("outcome".to_string(), Value::String("success".to_string()));
            }
            AttemptOutcome::Failed { kind, detail } => {
                row.insert(
                    "outcome".to_string(),
                    Value::String(kind.as_str().to_string()),
                );
                row.insert("detail".to_string(), Value::String(detail.clone()));
            }
        }
        Value::Object(row)
    }
}

#[derive(Debug, Clone)]
pub enum VariantOutcome {
    Success(ResultImageReference),
    Failure {
        stage: Stage,
        kind: FailureKind,
        detail: String,
    },
}

impl VariantOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, VariantOutcome::Success(_))
    }
}

/// Outcome of one independently-seeded synthesis attempt.
#[derive(Debug, Clone)]
pub struct VariantResult {
    pub variant_index: usize,
    pub seed: Option<i64>,
    pub outcome: VariantOutcome,
    pub attempts: Vec<InvocationAttempt>,
}
