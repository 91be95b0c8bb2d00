//! Typed edit operations.
//!
//! Requests name their edits as JSON-ish `name → parameter` pairs. This module
//! turns them into a closed set of [`EditOperation`] variants, each with a
//! typed parameter, collected in an insertion-ordered [`EditMap`].
//!
//! Unknown names are dropped when the map is built, so nothing downstream
//! ever dispatches on a free-form string.
//!
//! | Key | Variant | Parameter |
//! |---|---|---|
//! | `resize` | [`EditOperation::Resize`] | width/height/fit/background/withoutEnlargement/ratio |
//! | `toFormat` | [`EditOperation::ToFormat`] | format name (`jpg` aliases `jpeg`) |
//! | `jpeg`, `png`, `webp`, `tiff`, `heif`, `gif`, `avif` | [`EditOperation::Encoder`] | `{quality, effort, lossless}` |
//! | `quality` | [`EditOperation::PendingQuality`] | quality whose format is not known yet |
//! | `rotate` | [`EditOperation::Rotate`] | degrees, or `null` |
//! | `flip`, `flop`, `grayscale`/`greyscale`, `normalize`/`normalise`, `negate` | flags | `true` / `false` |
//! | `blur`, `sharpen` | sigma | `true` or number |
//! | `tint` | [`EditOperation::Tint`] | color |
//! | `flatten` | [`EditOperation::Flatten`] | `true` or `{background}` |
//! | `convolve` | [`EditOperation::Convolve`] | `{width, height, kernel}` |
//! | `crop` | [`EditOperation::Crop`] | `{left, top, width, height}` |
//! | `overlayWith` | [`EditOperation::OverlayWith`] | `{bucket, key, alpha, wRatio, hRatio, options}` |
//! | `smartCrop` | [`EditOperation::SmartCrop`] | `true` or `{faceIndex, padding}` |
//! | `roundCrop` | [`EditOperation::RoundCrop`] | `true` or `{top, left, rx, ry}` |
//! | `contentModeration` | [`EditOperation::ContentModeration`] | `true` or `{minConfidence, blur, moderationLabels}` |
//! | `animated` | [`EditOperation::Animated`] | `true` / `false` |

use crate::imaging::calculations::RoundCropRequest;
use crate::imaging::{EncoderOptions, Kernel, Rgba};
use crate::types::{Fit, ImageFormat, QUALITY_FORMATS};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::debug;

pub const RESIZE: &str = "resize";
pub const TO_FORMAT: &str = "toFormat";
pub const PENDING_QUALITY: &str = "quality";
pub const ROTATE: &str = "rotate";
pub const FLIP: &str = "flip";
pub const FLOP: &str = "flop";
pub const GRAYSCALE: &str = "grayscale";
pub const NORMALIZE: &str = "normalize";
pub const NEGATE: &str = "negate";
pub const BLUR: &str = "blur";
pub const SHARPEN: &str = "sharpen";
pub const TINT: &str = "tint";
pub const FLATTEN: &str = "flatten";
pub const CONVOLVE: &str = "convolve";
pub const CROP: &str = "crop";
pub const OVERLAY_WITH: &str = "overlayWith";
pub const SMART_CROP: &str = "smartCrop";
pub const ROUND_CROP: &str = "roundCrop";
pub const CONTENT_MODERATION: &str = "contentModeration";
pub const ANIMATED: &str = "animated";

/// Requested resize before validation. Values stay loose (`f64`, possibly NaN)
/// until normalization rounds and checks them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResizeEdit {
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub fit: Option<Fit>,
    pub background: Option<Rgba>,
    pub without_enlargement: Option<bool>,
    /// Scale factor applied to width/height (or to the image size when unknown).
    pub ratio: Option<f64>,
    /// Injected as a default rather than requested; does not force a re-encode.
    pub implicit: bool,
}

impl ResizeEdit {
    /// The default resize injected when a request carries none.
    pub fn implicit_inside() -> Self {
        Self {
            fit: Some(Fit::Inside),
            implicit: true,
            ..Self::default()
        }
    }

    fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            width: number(obj.get("width")),
            height: number(obj.get("height")),
            fit: obj
                .get("fit")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            background: obj
                .get("background")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            without_enlargement: obj.get("withoutEnlargement").and_then(Value::as_bool),
            ratio: number(obj.get("ratio")),
            implicit: false,
        })
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        if let Some(width) = self.width {
            obj.insert("width".into(), number_value(width));
        }
        if let Some(height) = self.height {
            obj.insert("height".into(), number_value(height));
        }
        if let Some(fit) = self.fit {
            obj.insert("fit".into(), to_value(&fit));
        }
        if let Some(background) = self.background {
            obj.insert("background".into(), to_value(&background));
        }
        if let Some(flag) = self.without_enlargement {
            obj.insert("withoutEnlargement".into(), Value::Bool(flag));
        }
        if let Some(ratio) = self.ratio {
            obj.insert("ratio".into(), number_value(ratio));
        }
        Value::Object(obj)
    }
}

/// Crop rectangle as requested. Negative or oversized values are only
/// rejected when the crop is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
}

impl CropRegion {
    fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let int = |name: &str| {
            number(obj.get(name)).filter(|v| v.is_finite() && v.fract() == 0.0).map(|v| v as i64)
        };
        Some(Self {
            left: int("left")?,
            top: int("top")?,
            width: int("width")?,
            height: int("height")?,
        })
    }
}

/// Watermark placement. Positions and ratios stay textual: `"10"`, `"-20"`,
/// `"50p"` and `"-10p"` are all meaningful.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overlay {
    pub bucket: String,
    pub key: String,
    pub alpha: Option<String>,
    pub w_ratio: Option<String>,
    pub h_ratio: Option<String>,
    pub left: Option<String>,
    pub top: Option<String>,
}

impl Overlay {
    fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let options = obj.get("options").and_then(Value::as_object);
        Some(Self {
            bucket: text(obj.get("bucket")).unwrap_or_default(),
            key: text(obj.get("key")).unwrap_or_default(),
            alpha: text(obj.get("alpha")),
            w_ratio: text(obj.get("wRatio")),
            h_ratio: text(obj.get("hRatio")),
            left: options.and_then(|o| text(o.get("left"))),
            top: options.and_then(|o| text(o.get("top"))),
        })
    }

    fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("bucket".into(), Value::String(self.bucket.clone()));
        obj.insert("key".into(), Value::String(self.key.clone()));
        let optional = [
            ("alpha", &self.alpha),
            ("wRatio", &self.w_ratio),
            ("hRatio", &self.h_ratio),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                obj.insert(name.into(), Value::String(value.clone()));
            }
        }
        let mut options = Map::new();
        if let Some(left) = &self.left {
            options.insert("left".into(), Value::String(left.clone()));
        }
        if let Some(top) = &self.top {
            options.insert("top".into(), Value::String(top.clone()));
        }
        obj.insert("options".into(), Value::Object(options));
        Value::Object(obj)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SmartCropOptions {
    pub face_index: Option<f64>,
    pub padding: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModerationOptions {
    pub min_confidence: Option<f64>,
    pub blur: Option<f64>,
    pub moderation_labels: Option<Vec<String>>,
}

/// One edit, with its typed parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOperation {
    Resize(ResizeEdit),
    ToFormat(ImageFormat),
    /// Encoder options for one format; selecting them also selects the format.
    Encoder(ImageFormat, EncoderOptions),
    /// A legacy `quality()` whose target format is decided during normalization.
    PendingQuality(f64),
    /// `None` drops orientation metadata without rotating.
    Rotate(Option<f64>),
    Flip(bool),
    Flop(bool),
    Grayscale(bool),
    Normalize(bool),
    Negate(bool),
    Blur(Option<f64>),
    Sharpen(Option<f64>),
    Tint(Rgba),
    Flatten(Option<Rgba>),
    Convolve(Kernel),
    /// `None` when the request's crop could not be read as a rectangle.
    Crop(Option<CropRegion>),
    OverlayWith(Overlay),
    SmartCrop(SmartCropOptions),
    RoundCrop(RoundCropRequest),
    ContentModeration(ModerationOptions),
    Animated(bool),
}

impl EditOperation {
    /// The edit-map key this operation is stored under.
    pub fn key(&self) -> &'static str {
        match self {
            EditOperation::Resize(_) => RESIZE,
            EditOperation::ToFormat(_) => TO_FORMAT,
            EditOperation::Encoder(format, _) => format.as_str(),
            EditOperation::PendingQuality(_) => PENDING_QUALITY,
            EditOperation::Rotate(_) => ROTATE,
            EditOperation::Flip(_) => FLIP,
            EditOperation::Flop(_) => FLOP,
            EditOperation::Grayscale(_) => GRAYSCALE,
            EditOperation::Normalize(_) => NORMALIZE,
            EditOperation::Negate(_) => NEGATE,
            EditOperation::Blur(_) => BLUR,
            EditOperation::Sharpen(_) => SHARPEN,
            EditOperation::Tint(_) => TINT,
            EditOperation::Flatten(_) => FLATTEN,
            EditOperation::Convolve(_) => CONVOLVE,
            EditOperation::Crop(_) => CROP,
            EditOperation::OverlayWith(_) => OVERLAY_WITH,
            EditOperation::SmartCrop(_) => SMART_CROP,
            EditOperation::RoundCrop(_) => ROUND_CROP,
            EditOperation::ContentModeration(_) => CONTENT_MODERATION,
            EditOperation::Animated(_) => ANIMATED,
        }
    }

    /// Parse one `name → value` pair. `None` means the pair is dropped:
    /// unknown name, a `false` toggle for an optional feature, or an
    /// unreadable value.
    pub fn from_json(name: &str, value: &Value) -> Option<EditOperation> {
        let op = match name {
            RESIZE => EditOperation::Resize(ResizeEdit::from_json(value)?),
            TO_FORMAT => EditOperation::ToFormat(ImageFormat::from_name(value.as_str()?)?),
            ROTATE => match value {
                Value::Null => EditOperation::Rotate(None),
                other => EditOperation::Rotate(Some(other.as_f64()?)),
            },
            FLIP => EditOperation::Flip(value.as_bool()?),
            FLOP => EditOperation::Flop(value.as_bool()?),
            "grayscale" | "greyscale" => EditOperation::Grayscale(value.as_bool()?),
            "normalize" | "normalise" => EditOperation::Normalize(value.as_bool()?),
            NEGATE => EditOperation::Negate(value.as_bool()?),
            BLUR => EditOperation::Blur(sigma(value)?),
            SHARPEN => EditOperation::Sharpen(sigma(value)?),
            TINT => EditOperation::Tint(serde_json::from_value(value.clone()).ok()?),
            FLATTEN => match enabled_with_options(value)? {
                None => EditOperation::Flatten(None),
                Some(obj) => EditOperation::Flatten(
                    obj.get("background")
                        .and_then(|v| serde_json::from_value(v.clone()).ok()),
                ),
            },
            CONVOLVE => EditOperation::Convolve(serde_json::from_value(value.clone()).ok()?),
            CROP => EditOperation::Crop(CropRegion::from_json(value)),
            OVERLAY_WITH => EditOperation::OverlayWith(Overlay::from_json(value)?),
            SMART_CROP => {
                let opts = enabled_with_options(value)?;
                EditOperation::SmartCrop(SmartCropOptions {
                    face_index: opts.and_then(|o| number(o.get("faceIndex"))),
                    padding: opts.and_then(|o| number(o.get("padding"))),
                })
            }
            ROUND_CROP => {
                let opts = enabled_with_options(value)?;
                let field = |name: &str| opts.and_then(|o| number(o.get(name)));
                EditOperation::RoundCrop(RoundCropRequest {
                    top: field("top"),
                    left: field("left"),
                    rx: field("rx"),
                    ry: field("ry"),
                })
            }
            CONTENT_MODERATION => {
                let opts = enabled_with_options(value)?;
                EditOperation::ContentModeration(ModerationOptions {
                    min_confidence: opts.and_then(|o| number(o.get("minConfidence"))),
                    blur: opts.and_then(|o| number(o.get("blur"))),
                    moderation_labels: opts
                        .and_then(|o| o.get("moderationLabels"))
                        .and_then(|v| serde_json::from_value(v.clone()).ok()),
                })
            }
            ANIMATED => EditOperation::Animated(value.as_bool()?),
            other => {
                let format = ImageFormat::from_name(other).filter(|f| {
                    f.accepts_quality() && f.as_str() == other
                })?;
                EditOperation::Encoder(format, encoder_options(value)?)
            }
        };
        Some(op)
    }

    /// JSON form of the parameter, as it appears in a DEFAULT payload.
    pub fn to_json(&self) -> Value {
        match self {
            EditOperation::Resize(resize) => resize.to_json(),
            EditOperation::ToFormat(format) => Value::String(format.as_str().to_string()),
            EditOperation::Encoder(_, options) => to_value(options),
            EditOperation::PendingQuality(quality) => number_value(*quality),
            EditOperation::Rotate(angle) => angle.map(number_value).unwrap_or(Value::Null),
            EditOperation::Flip(flag)
            | EditOperation::Flop(flag)
            | EditOperation::Grayscale(flag)
            | EditOperation::Normalize(flag)
            | EditOperation::Negate(flag)
            | EditOperation::Animated(flag) => Value::Bool(*flag),
            EditOperation::Blur(sigma) | EditOperation::Sharpen(sigma) => {
                sigma.map(number_value).unwrap_or(Value::Bool(true))
            }
            EditOperation::Tint(color) => to_value(color),
            EditOperation::Flatten(background) => match background {
                None => Value::Bool(true),
                Some(color) => {
                    let mut obj = Map::new();
                    obj.insert("background".into(), to_value(color));
                    Value::Object(obj)
                }
            },
            EditOperation::Convolve(kernel) => to_value(kernel),
            EditOperation::Crop(region) => {
                let mut obj = Map::new();
                if let Some(r) = region {
                    obj.insert("left".into(), r.left.into());
                    obj.insert("top".into(), r.top.into());
                    obj.insert("width".into(), r.width.into());
                    obj.insert("height".into(), r.height.into());
                }
                Value::Object(obj)
            }
            EditOperation::OverlayWith(overlay) => overlay.to_json(),
            EditOperation::SmartCrop(opts) => {
                let mut obj = Map::new();
                insert_number(&mut obj, "faceIndex", opts.face_index);
                insert_number(&mut obj, "padding", opts.padding);
                options_or_true(obj)
            }
            EditOperation::RoundCrop(opts) => {
                let mut obj = Map::new();
                insert_number(&mut obj, "top", opts.top);
                insert_number(&mut obj, "left", opts.left);
                insert_number(&mut obj, "rx", opts.rx);
                insert_number(&mut obj, "ry", opts.ry);
                options_or_true(obj)
            }
            EditOperation::ContentModeration(opts) => {
                let mut obj = Map::new();
                insert_number(&mut obj, "minConfidence", opts.min_confidence);
                insert_number(&mut obj, "blur", opts.blur);
                if let Some(labels) = &opts.moderation_labels {
                    obj.insert("moderationLabels".into(), to_value(labels));
                }
                options_or_true(obj)
            }
        }
    }
}

/// Insertion-ordered edits, at most one per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditMap {
    ops: Vec<EditOperation>,
}

impl EditMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing an existing operation with the same key in place.
    pub fn insert(&mut self, op: EditOperation) -> Option<EditOperation> {
        match self.ops.iter().position(|o| o.key() == op.key()) {
            Some(i) => Some(std::mem::replace(&mut self.ops[i], op)),
            None => {
                self.ops.push(op);
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&EditOperation> {
        self.ops.iter().find(|o| o.key() == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<EditOperation> {
        let index = self.ops.iter().position(|o| o.key() == key)?;
        Some(self.ops.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EditOperation> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn resize(&self) -> Option<&ResizeEdit> {
        self.ops.iter().find_map(|o| match o {
            EditOperation::Resize(r) => Some(r),
            _ => None,
        })
    }

    /// The resize edit, created empty if absent.
    pub fn resize_entry(&mut self) -> &mut ResizeEdit {
        let index = match self.ops.iter().position(|o| o.key() == RESIZE) {
            Some(i) => i,
            None => {
                self.ops.push(EditOperation::Resize(ResizeEdit::default()));
                self.ops.len() - 1
            }
        };
        match &mut self.ops[index] {
            EditOperation::Resize(resize) => resize,
            _ => unreachable!("resize key always holds a resize edit"),
        }
    }

    pub fn to_format(&self) -> Option<ImageFormat> {
        self.ops.iter().find_map(|o| match o {
            EditOperation::ToFormat(f) => Some(*f),
            _ => None,
        })
    }

    /// First format-specific encoder entry, scanning formats in
    /// [`QUALITY_FORMATS`] order.
    pub fn quality_format(&self) -> Option<ImageFormat> {
        QUALITY_FORMATS
            .into_iter()
            .find(|format| self.contains(format.as_str()))
    }

    /// Whether any edit would change the image. The injected default resize
    /// does not count.
    pub fn has_effect(&self) -> bool {
        self.ops
            .iter()
            .any(|o| !matches!(o, EditOperation::Resize(r) if r.implicit))
    }

    /// Build from a JSON object, keeping key order and dropping unknown or
    /// unreadable entries.
    pub fn from_json_map(map: &Map<String, Value>) -> EditMap {
        let mut edits = EditMap::new();
        for (name, value) in map {
            match EditOperation::from_json(name, value) {
                Some(op) => {
                    edits.insert(op);
                }
                None => debug!(edit = %name, "dropping unsupported or disabled edit"),
            }
        }
        edits
    }

    pub fn to_json_map(&self) -> Map<String, Value> {
        self.ops
            .iter()
            .map(|op| (op.key().to_string(), op.to_json()))
            .collect()
    }
}

impl FromIterator<EditOperation> for EditMap {
    fn from_iter<I: IntoIterator<Item = EditOperation>>(iter: I) -> Self {
        let mut edits = EditMap::new();
        for op in iter {
            edits.insert(op);
        }
        edits
    }
}

impl<'a> IntoIterator for &'a EditMap {
    type Item = &'a EditOperation;
    type IntoIter = std::slice::Iter<'a, EditOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}

impl IntoIterator for EditMap {
    type Item = EditOperation;
    type IntoIter = std::vec::IntoIter<EditOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

impl Serialize for EditMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EditMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Ok(EditMap::from_json_map(&map))
    }
}

/// Clamp a loose quality value to an encoder quality.
pub fn quality_value(raw: f64) -> Option<u8> {
    raw.is_finite().then(|| raw.round().clamp(1.0, 100.0) as u8)
}

// --- loose JSON helpers --------------------------------------------------

/// Numbers and numeric-like strings. Anything else present becomes NaN so
/// validation can reject it; `null` and absence are `None`.
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Null => None,
        Value::Number(n) => n.as_f64(),
        Value::String(s) => Some(s.trim().parse().unwrap_or(f64::NAN)),
        _ => Some(f64::NAN),
    }
}

/// Strings, with numbers rendered as text.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `true` → `Some(None)`, object → `Some(Some(obj))`, anything else → `None`.
fn enabled_with_options(value: &Value) -> Option<Option<&Map<String, Value>>> {
    match value {
        Value::Bool(true) => Some(None),
        Value::Object(obj) => Some(Some(obj)),
        _ => None,
    }
}

fn sigma(value: &Value) -> Option<Option<f64>> {
    match value {
        Value::Bool(true) => Some(None),
        Value::Number(n) => Some(n.as_f64()),
        _ => None,
    }
}

fn encoder_options(value: &Value) -> Option<EncoderOptions> {
    match enabled_with_options(value)? {
        None => Some(EncoderOptions::default()),
        Some(obj) => Some(EncoderOptions {
            quality: number(obj.get("quality")).and_then(quality_value),
            effort: number(obj.get("effort"))
                .filter(|e| e.is_finite())
                .map(|e| e.trunc().clamp(0.0, 10.0) as u8),
            lossless: obj.get("lossless").and_then(Value::as_bool),
        }),
    }
}

/// Whole numbers serialize as integers, so `100.0` reads back as `100`.
fn number_value(v: f64) -> Value {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 {
        Value::from(v as i64)
    } else {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn insert_number(obj: &mut Map<String, Value>, name: &str, value: Option<f64>) {
    if let Some(v) = value {
        obj.insert(name.into(), number_value(v));
    }
}

fn options_or_true(obj: Map<String, Value>) -> Value {
    if obj.is_empty() {
        Value::Bool(true)
    } else {
        Value::Object(obj)
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
