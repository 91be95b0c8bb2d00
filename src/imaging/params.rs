//! Parameter types for image operations.
//!
//! These structs describe *what* to do, not *how* to do it. They are the
//! interface between the [`operations`](super::operations) sequencer (which
//! decides what happens to the image) and the [`backend`](super::backend)
//! (which does the actual pixel work).
//!
//! ## Types
//!
//! - [`Rgba`] — A color parsed from CSS names, hex strings or `{r,g,b,alpha}` objects.
//! - [`ResizeOptions`] — Resolved resize request: target box, fit mode, padding color.
//! - [`EncoderOptions`] — Per-format encoder settings (quality, effort, lossless).
//! - [`Kernel`] — Convolution matrix.
//! - [`CropArea`] — Pixel rectangle for extract.
//! - [`BoundingBox`] — Fractional rectangle in the unit square.
//! - [`Ellipse`] — Round-crop mask geometry.
//! - [`CompositeLayer`] — One layer of a composite call.
//! - [`PixelOp`] — A single named operation forwarded to the backend.

use crate::types::{Fit, ImageFormat};
use serde::{Deserialize, Deserializer, Serialize};
use std::ops::RangeInclusive;

/// An RGBA color. `alpha` is in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub alpha: f64,
}

impl Rgba {
    pub const BLACK: Rgba = Rgba::rgb(0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, alpha: 1.0 }
    }

    /// Build from floating channel values, rounding and clamping to `0..=255`.
    pub fn from_channels(r: f64, g: f64, b: f64) -> Self {
        let channel = |v: f64| if v.is_nan() { 0 } else { v.round().clamp(0.0, 255.0) as u8 };
        Self::rgb(channel(r), channel(g), channel(b))
    }

    /// Parse a CSS color name or a hex string (`#` optional; 3, 4, 6 or 8 digits).
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if let Some(named) = css_named_color(&input.to_ascii_lowercase()) {
            return Some(named);
        }
        let hex = input.strip_prefix('#').unwrap_or(input);
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let nibble = |i: usize| u8::from_str_radix(&hex[i..=i], 16).ok().map(|v| v * 17);
        let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        let (r, g, b, a) = match hex.len() {
            3 => (nibble(0)?, nibble(1)?, nibble(2)?, 255),
            4 => (nibble(0)?, nibble(1)?, nibble(2)?, nibble(3)?),
            6 => (byte(0)?, byte(2)?, byte(4)?, 255),
            8 => (byte(0)?, byte(2)?, byte(4)?, byte(6)?),
            _ => return None,
        };
        Some(Self {
            r,
            g,
            b,
            alpha: f64::from(a) / 255.0,
        })
    }

    /// Alpha as an 8-bit channel value.
    pub fn alpha_u8(&self) -> u8 {
        (self.alpha.clamp(0.0, 1.0) * 255.0).round() as u8
    }

    pub fn to_array(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.alpha_u8()]
    }
}

impl<'de> Deserialize<'de> for Rgba {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Object {
                #[serde(default)]
                r: f64,
                #[serde(default)]
                g: f64,
                #[serde(default)]
                b: f64,
                alpha: Option<f64>,
            },
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Rgba::parse(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown color: {text}"))),
            Repr::Object { r, g, b, alpha } => {
                let mut color = Rgba::from_channels(r, g, b);
                color.alpha = alpha.unwrap_or(1.0).clamp(0.0, 1.0);
                Ok(color)
            }
        }
    }
}

/// Resolved resize request handed to the backend.
///
/// `None` on either side means "derive from the aspect ratio"; both `None`
/// leaves the image untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Fit,
    /// Padding color for [`Fit::Contain`].
    pub background: Rgba,
    pub without_enlargement: bool,
}

impl Default for ResizeOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            fit: Fit::Inside,
            background: Rgba::BLACK,
            without_enlargement: false,
        }
    }
}

/// Encoder settings. Unset fields keep whatever the image already carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lossless: Option<bool>,
}

impl EncoderOptions {
    pub fn with_quality(quality: u8) -> Self {
        Self {
            quality: Some(quality),
            ..Self::default()
        }
    }

    /// Overlay `other` onto `self`: fields set in `other` win.
    pub fn merged(self, other: EncoderOptions) -> Self {
        Self {
            quality: other.quality.or(self.quality),
            effort: other.effort.or(self.effort),
            lossless: other.lossless.or(self.lossless),
        }
    }
}

/// Convolution kernel. `kernel.len()` should equal `width * height`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub width: u32,
    pub height: u32,
    pub kernel: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
}

/// Pixel rectangle. Valid for an image when it fits entirely inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropArea {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl CropArea {
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && u64::from(self.left) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.top) + u64::from(self.height) <= u64::from(height)
    }
}

/// Fractional rectangle in the unit square, as returned by face detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// The whole image.
    pub const FULL: BoundingBox = BoundingBox {
        left: 0.0,
        top: 0.0,
        width: 1.0,
        height: 1.0,
    };
}

/// Ellipse mask in image pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    pub cx: f64,
    pub cy: f64,
    pub rx: f64,
    pub ry: f64,
    /// Canvas size the mask covers.
    pub width: u32,
    pub height: u32,
}

impl Ellipse {
    /// SVG rendering of the mask.
    pub fn to_svg(&self) -> String {
        format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}"> <ellipse cx="{}" cy="{}" rx="{}" ry="{}" /></svg>"#,
            self.width, self.height, self.cx, self.cy, self.rx, self.ry
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blend {
    /// Layer drawn over the image.
    Over,
    /// Keep the image only where the layer is opaque.
    DestIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerInput {
    /// Encoded image bytes.
    Image(Vec<u8>),
    Ellipse(Ellipse),
    /// A single pixel of this color.
    Solid(Rgba),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeLayer {
    pub input: LayerInput,
    pub blend: Blend,
    /// `None` centers the layer on that axis.
    pub left: Option<i64>,
    pub top: Option<i64>,
    /// Repeat the layer across the whole image.
    pub tile: bool,
}

impl CompositeLayer {
    pub fn over(input: LayerInput, left: Option<i64>, top: Option<i64>) -> Self {
        Self {
            input,
            blend: Blend::Over,
            left,
            top,
            tile: false,
        }
    }

    pub fn mask(input: LayerInput, tile: bool) -> Self {
        Self {
            input,
            blend: Blend::DestIn,
            left: None,
            top: None,
            tile,
        }
    }
}

/// Options applied when the backend decodes source bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Decode every frame of an animated source.
    pub animated: bool,
}

/// Gaussian blur sigmas a backend accepts.
pub const BLUR_SIGMA_RANGE: RangeInclusive<f64> = 0.3..=1000.0;
/// Sharpen sigmas a backend accepts.
pub const SHARPEN_SIGMA_RANGE: RangeInclusive<f64> = 0.000001..=10.0;

/// Operations forwarded to the backend without special handling.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelOp {
    Resize(ResizeOptions),
    /// Degrees clockwise; `None` only drops orientation metadata.
    Rotate(Option<f64>),
    Flip,
    Flop,
    Grayscale,
    Normalize,
    Negate,
    /// Gaussian sigma; `None` is a mild fixed blur.
    Blur(Option<f64>),
    /// Sharpen sigma; `None` is a mild fixed sharpen.
    Sharpen(Option<f64>),
    Tint(Rgba),
    Flatten(Rgba),
    Convolve(Kernel),
    /// Switch the output encoder, merging options into the current ones.
    ToFormat(ImageFormat, EncoderOptions),
}

/// Named CSS colors (CSS Color Module Level 4).
fn css_named_color(name: &str) -> Option<Rgba> {
    let (r, g, b) = match name {
        "aliceblue" => (240, 248, 255),
        "antiquewhite" => (250, 235, 215),
        "aqua" | "cyan" => (0, 255, 255),
        "aquamarine" => (127, 255, 212),
        "azure" => (240, 255, 255),
        "beige" => (245, 245, 220),
        "bisque" => (255, 228, 196),
        "black" => (0, 0, 0),
        "blanchedalmond" => (255, 235, 205),
        "blue" => (0, 0, 255),
        "blueviolet" => (138, 43, 226),
        "brown" => (165, 42, 42),
        "burlywood" => (222, 184, 135),
        "cadetblue" => (95, 158, 160),
        "chartreuse" => (127, 255, 0),
        "chocolate" => (210, 105, 30),
        "coral" => (255, 127, 80),
        "cornflowerblue" => (100, 149, 237),
        "cornsilk" => (255, 248, 220),
        "crimson" => (220, 20, 60),
        "darkblue" => (0, 0, 139),
        "darkcyan" => (0, 139, 139),
        "darkgoldenrod" => (184, 134, 11),
        "darkgray" | "darkgrey" => (169, 169, 169),
        "darkgreen" => (0, 100, 0),
        "darkkhaki" => (189, 183, 107),
        "darkmagenta" => (139, 0, 139),
        "darkolivegreen" => (85, 107, 47),
        "darkorange" => (255, 140, 0),
        "darkorchid" => (153, 50, 204),
        "darkred" => (139, 0, 0),
        "darksalmon" => (233, 150, 122),
        "darkseagreen" => (143, 188, 143),
        "darkslateblue" => (72, 61, 139),
        "darkslategray" | "darkslategrey" => (47, 79, 79),
        "darkturquoise" => (0, 206, 209),
        "darkviolet" => (148, 0, 211),
        "deeppink" => (255, 20, 147),
        "deepskyblue" => (0, 191, 255),
        "dimgray" | "dimgrey" => (105, 105, 105),
        "dodgerblue" => (30, 144, 255),
        "firebrick" => (178, 34, 34),
        "floralwhite" => (255, 250, 240),
        "forestgreen" => (34, 139, 34),
        "fuchsia" | "magenta" => (255, 0, 255),
        "gainsboro" => (220, 220, 220),
        "ghostwhite" => (248, 248, 255),
        "gold" => (255, 215, 0),
        "goldenrod" => (218, 165, 32),
        "gray" | "grey" => (128, 128, 128),
        "green" => (0, 128, 0),
        "greenyellow" => (173, 255, 47),
        "honeydew" => (240, 255, 240),
        "hotpink" => (255, 105, 180),
        "indianred" => (205, 92, 92),
        "indigo" => (75, 0, 130),
        "ivory" => (255, 255, 240),
        "khaki" => (240, 230, 140),
        "lavender" => (230, 230, 250),
        "lavenderblush" => (255, 240, 245),
        "lawngreen" => (124, 252, 0),
        "lemonchiffon" => (255, 250, 205),
        "lightblue" => (173, 216, 230),
        "lightcoral" => (240, 128, 128),
        "lightcyan" => (224, 255, 255),
        "lightgoldenrodyellow" => (250, 250, 210),
        "lightgray" | "lightgrey" => (211, 211, 211),
        "lightgreen" => (144, 238, 144),
        "lightpink" => (255, 182, 193),
        "lightsalmon" => (255, 160, 122),
        "lightseagreen" => (32, 178, 170),
        "lightskyblue" => (135, 206, 250),
        "lightslategray" | "lightslategrey" => (119, 136, 153),
        "lightsteelblue" => (176, 196, 222),
        "lightyellow" => (255, 255, 224),
        "lime" => (0, 255, 0),
        "limegreen" => (50, 205, 50),
        "linen" => (250, 240, 230),
        "maroon" => (128, 0, 0),
        "mediumaquamarine" => (102, 205, 170),
        "mediumblue" => (0, 0, 205),
        "mediumorchid" => (186, 85, 211),
        "mediumpurple" => (147, 112, 219),
        "mediumseagreen" => (60, 179, 113),
        "mediumslateblue" => (123, 104, 238),
        "mediumspringgreen" => (0, 250, 154),
        "mediumturquoise" => (72, 209, 204),
        "mediumvioletred" => (199, 21, 133),
        "midnightblue" => (25, 25, 112),
        "mintcream" => (245, 255, 250),
        "mistyrose" => (255, 228, 225),
        "moccasin" => (255, 228, 181),
        "navajowhite" => (255, 222, 173),
        "navy" => (0, 0, 128),
        "oldlace" => (253, 245, 230),
        "olive" => (128, 128, 0),
        "olivedrab" => (107, 142, 35),
        "orange" => (255, 165, 0),
        "orangered" => (255, 69, 0),
        "orchid" => (218, 112, 214),
        "palegoldenrod" => (238, 232, 170),
        "palegreen" => (152, 251, 152),
        "paleturquoise" => (175, 238, 238),
        "palevioletred" => (219, 112, 147),
        "papayawhip" => (255, 239, 213),
        "peachpuff" => (255, 218, 185),
        "peru" => (205, 133, 63),
        "pink" => (255, 192, 203),
        "plum" => (221, 160, 221),
        "powderblue" => (176, 224, 230),
        "purple" => (128, 0, 128),
        "rebeccapurple" => (102, 51, 153),
        "red" => (255, 0, 0),
        "rosybrown" => (188, 143, 143),
        "royalblue" => (65, 105, 225),
        "saddlebrown" => (139, 69, 19),
        "salmon" => (250, 128, 114),
        "sandybrown" => (244, 164, 96),
        "seagreen" => (46, 139, 87),
        "seashell" => (255, 245, 238),
        "sienna" => (160, 82, 45),
        "silver" => (192, 192, 192),
        "skyblue" => (135, 206, 235),
        "slateblue" => (106, 90, 205),
        "slategray" | "slategrey" => (112, 128, 144),
        "snow" => (255, 250, 250),
        "springgreen" => (0, 255, 127),
        "steelblue" => (70, 130, 180),
        "tan" => (210, 180, 140),
        "teal" => (0, 128, 128),
        "thistle" => (216, 191, 216),
        "tomato" => (255, 99, 71),
        "turquoise" => (64, 224, 208),
        "violet" => (238, 130, 238),
        "wheat" => (245, 222, 179),
        "white" => (255, 255, 255),
        "whitesmoke" => (245, 245, 245),
        "yellow" => (255, 255, 0),
        "yellowgreen" => (154, 205, 50),
        "transparent" => {
            return Some(Rgba {
                r: 0,
                g: 0,
                b: 0,
                alpha: 0.0,
            });
        }
        _ => return None,
    };
    Some(Rgba::rgb(r, g, b))
}
