//! Pure Rust image processing backend.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, TIFF, WebP, GIF) | `image::load_from_memory` |
//! | Decode animated GIF | `image::codecs::gif::GifDecoder` frames |
//! | Decode AVIF | `avif-parse` (container) + `rav1d` (AV1 decode) + YUV→RGB |
//! | Decode SVG, ellipse masks | `resvg` |
//! | Resize | `resize_exact` with `Lanczos3`, then crop or pad per fit |
//! | Rotate | `rotate90`/`rotate180`/`rotate270`; other angles sample onto a grown transparent canvas |
//! | Sharpen / blur | `unsharpen` / `blur` |
//! | Encode JPEG, PNG, TIFF, GIF | `image` encoders |
//! | Encode WebP | `WebPEncoder::new_lossless` |
//! | Encode AVIF | `AvifEncoder` (rav1e) |
//!
//! HEIF, HEIC and RAW have no encoder here and report
//! [`BackendError::UnsupportedFormat`].

use super::backend::{BackendError, ImageBackend, ImageInfo};
use super::calculations::plan_resize;
use super::params::{
    BLUR_SIGMA_RANGE, Blend, CompositeLayer, CropArea, Ellipse, EncoderOptions, Kernel,
    LayerInput, LoadOptions, PixelOp, ResizeOptions, Rgba, SHARPEN_SIGMA_RANGE,
};
use crate::types::{ImageFormat, infer_content_type};
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::imageops::FilterType;
use image::{AnimationDecoder, Delay, DynamicImage, RgbImage, RgbaImage};
use std::io::Cursor;
use std::ops::RangeInclusive;
use tracing::debug;

/// JPEG quality when none is requested.
const DEFAULT_JPEG_QUALITY: u8 = 80;
/// AVIF quality when none is requested.
const DEFAULT_AVIF_QUALITY: u8 = 50;
/// rav1e speed when no effort is requested.
const DEFAULT_AVIF_SPEED: u8 = 6;

/// Backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

/// One decoded frame.
#[derive(Clone)]
struct Page {
    pixels: DynamicImage,
    delay: Delay,
}

impl Page {
    fn still(pixels: DynamicImage) -> Self {
        Self {
            pixels,
            delay: Delay::from_numer_denom_ms(100, 1),
        }
    }
}

/// Decoded image plus the output settings chosen so far.
#[derive(Clone)]
pub struct RustImage {
    pages: Vec<Page>,
    format: Option<ImageFormat>,
    encoder: EncoderOptions,
}

impl RustImage {
    fn first(&self) -> &DynamicImage {
        &self.pages[0].pixels
    }

    fn map_pages(
        &mut self,
        mut f: impl FnMut(&DynamicImage) -> Result<DynamicImage, BackendError>,
    ) -> Result<(), BackendError> {
        for page in &mut self.pages {
            page.pixels = f(&page.pixels)?;
        }
        Ok(())
    }
}

fn decode_error(e: impl std::fmt::Display) -> BackendError {
    BackendError::ProcessingFailed(format!("Failed to decode image: {e}"))
}

fn encode_error(format: ImageFormat, e: impl std::fmt::Display) -> BackendError {
    BackendError::ProcessingFailed(format!("{format} encode failed: {e}"))
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]);
    let text = head.trim_start();
    text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg"))
}

/// Rasterize an SVG document at its own size.
fn rasterize_svg(bytes: &[u8]) -> Result<RgbaImage, BackendError> {
    use resvg::{tiny_skia, usvg};

    let tree = usvg::Tree::from_data(bytes, &usvg::Options::default()).map_err(decode_error)?;
    let size = tree.size().to_int_size();
    let mut pixmap = tiny_skia::Pixmap::new(size.width(), size.height())
        .ok_or_else(|| decode_error("empty SVG canvas"))?;
    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

    let data: Vec<u8> = pixmap
        .pixels()
        .iter()
        .flat_map(|p| {
            let c = p.demultiply();
            [c.red(), c.green(), c.blue(), c.alpha()]
        })
        .collect();
    RgbaImage::from_raw(size.width(), size.height(), data)
        .ok_or_else(|| decode_error("SVG raster size mismatch"))
}

fn ellipse_mask(ellipse: &Ellipse) -> Result<RgbaImage, BackendError> {
    rasterize_svg(ellipse.to_svg().as_bytes())
}

fn decode_gif_frames(bytes: &[u8]) -> Result<Vec<Page>, BackendError> {
    let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(decode_error)?;
    let frames = decoder.into_frames().collect_frames().map_err(decode_error)?;
    Ok(frames
        .into_iter()
        .map(|frame| Page {
            delay: frame.delay(),
            pixels: DynamicImage::ImageRgba8(frame.into_buffer()),
        })
        .collect())
}

/// Decode an AVIF file using avif-parse (container) + rav1d (AV1 decode).
///
/// The `image` crate's `"avif"` feature only provides the encoder.
fn decode_avif(bytes: &[u8]) -> Result<DynamicImage, BackendError> {
    use rav1d::include::dav1d::data::Dav1dData;
    use rav1d::include::dav1d::dav1d::Dav1dSettings;
    use rav1d::include::dav1d::headers::{
        DAV1D_PIXEL_LAYOUT_I400, DAV1D_PIXEL_LAYOUT_I420, DAV1D_PIXEL_LAYOUT_I422,
        DAV1D_PIXEL_LAYOUT_I444,
    };
    use rav1d::include::dav1d::picture::Dav1dPicture;
    use rav1d::src::lib as dav1d;
    use std::ptr::NonNull;

    let avif = avif_parse::read_avif(&mut Cursor::new(bytes))
        .map_err(|e| decode_error(format!("AVIF container: {e:?}")))?;
    let av1: &[u8] = &avif.primary_item;

    let mut settings = std::mem::MaybeUninit::<Dav1dSettings>::uninit();
    let settings_ptr =
        NonNull::new(settings.as_mut_ptr()).ok_or_else(|| decode_error("rav1d settings"))?;
    unsafe { dav1d::dav1d_default_settings(settings_ptr) };
    let mut settings = unsafe { settings.assume_init() };
    settings.n_threads = 1;
    settings.max_frame_delay = 1;

    let mut ctx = None;
    let rc = unsafe { dav1d::dav1d_open(NonNull::new(&mut ctx), NonNull::new(&mut settings)) };
    if rc.0 != 0 {
        return Err(decode_error(format!("rav1d open failed ({})", rc.0)));
    }

    let mut data = Dav1dData::default();
    let buf = unsafe { dav1d::dav1d_data_create(NonNull::new(&mut data), av1.len()) };
    if buf.is_null() {
        unsafe { dav1d::dav1d_close(NonNull::new(&mut ctx)) };
        return Err(decode_error("rav1d data_create failed"));
    }
    unsafe { std::ptr::copy_nonoverlapping(av1.as_ptr(), buf, av1.len()) };

    let rc = unsafe { dav1d::dav1d_send_data(ctx, NonNull::new(&mut data)) };
    if rc.0 != 0 {
        unsafe {
            dav1d::dav1d_data_unref(NonNull::new(&mut data));
            dav1d::dav1d_close(NonNull::new(&mut ctx));
        }
        return Err(decode_error(format!("rav1d send_data failed ({})", rc.0)));
    }

    let mut pic: Dav1dPicture = unsafe { std::mem::zeroed() };
    let rc = unsafe { dav1d::dav1d_get_picture(ctx, NonNull::new(&mut pic)) };
    if rc.0 != 0 {
        unsafe { dav1d::dav1d_close(NonNull::new(&mut ctx)) };
        return Err(decode_error(format!("rav1d get_picture failed ({})", rc.0)));
    }

    let layout = pic.p.layout;
    let subsampling = match layout {
        DAV1D_PIXEL_LAYOUT_I400 => None,
        DAV1D_PIXEL_LAYOUT_I420 => Some((true, true)),
        DAV1D_PIXEL_LAYOUT_I422 => Some((true, false)),
        DAV1D_PIXEL_LAYOUT_I444 => Some((false, false)),
        _ => {
            unsafe {
                dav1d::dav1d_picture_unref(NonNull::new(&mut pic));
                dav1d::dav1d_close(NonNull::new(&mut ctx));
            }
            return Err(decode_error(format!("unsupported AVIF pixel layout {layout}")));
        }
    };
    let data = pic.data;
    let plane = |i: usize| data[i].map(|p| p.as_ptr() as *const u8);
    let Some(luma) = plane(0) else {
        unsafe {
            dav1d::dav1d_picture_unref(NonNull::new(&mut pic));
            dav1d::dav1d_close(NonNull::new(&mut ctx));
        }
        return Err(decode_error("AVIF picture without luma plane"));
    };
    let chroma = match subsampling {
        Some(ss) => match (plane(1), plane(2)) {
            (Some(u), Some(v)) => Some((u, v, ss)),
            _ => {
                unsafe {
                    dav1d::dav1d_picture_unref(NonNull::new(&mut pic));
                    dav1d::dav1d_close(NonNull::new(&mut ctx));
                }
                return Err(decode_error("AVIF picture without chroma planes"));
            }
        },
        None => None,
    };

    let planes = Planes {
        luma,
        chroma,
        luma_stride: pic.stride[0],
        chroma_stride: pic.stride[1],
        width: pic.p.w as u32,
        height: pic.p.h as u32,
        bits: pic.p.bpc as u32,
    };
    let rgb = planes.to_rgb8();
    let (width, height) = (planes.width, planes.height);
    unsafe {
        dav1d::dav1d_picture_unref(NonNull::new(&mut pic));
        dav1d::dav1d_close(NonNull::new(&mut ctx));
    }

    RgbImage::from_raw(width, height, rgb)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| decode_error("AVIF raster size mismatch"))
}

/// Borrowed YUV planes of a decoded AV1 picture.
struct Planes {
    luma: *const u8,
    /// U and V planes plus horizontal/vertical subsampling; `None` for monochrome.
    chroma: Option<(*const u8, *const u8, (bool, bool))>,
    luma_stride: isize,
    chroma_stride: isize,
    width: u32,
    height: u32,
    bits: u32,
}

impl Planes {
    /// Interleaved RGB8 using BT.601 coefficients.
    fn to_rgb8(&self) -> Vec<u8> {
        let max = ((1u32 << self.bits) - 1) as f32;
        let center = (1u32 << (self.bits - 1)) as f32;
        let scale = 255.0 / max;
        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);

        for row in 0..self.height {
            for col in 0..self.width {
                let y = sample(self.luma, self.luma_stride, col, row, self.bits);
                let (r, g, b) = match self.chroma {
                    None => (y, y, y),
                    Some((u, v, (ss_x, ss_y))) => {
                        let cx = if ss_x { col / 2 } else { col };
                        let cy = if ss_y { row / 2 } else { row };
                        let cb = sample(u, self.chroma_stride, cx, cy, self.bits) - center;
                        let cr = sample(v, self.chroma_stride, cx, cy, self.bits) - center;
                        (
                            y + 1.402 * cr,
                            y - 0.344136 * cb - 0.714136 * cr,
                            y + 1.772 * cb,
                        )
                    }
                };
                for channel in [r, g, b] {
                    rgb.push((channel * scale).clamp(0.0, 255.0) as u8);
                }
            }
        }
        rgb
    }
}

/// One plane sample; 10- and 12-bit pictures store `u16` per sample.
#[inline]
fn sample(ptr: *const u8, stride: isize, x: u32, y: u32, bits: u32) -> f32 {
    if bits <= 8 {
        (unsafe { *ptr.offset(y as isize * stride + x as isize) }) as f32
    } else {
        let offset = y as isize * stride + x as isize * 2;
        (unsafe { (ptr.offset(offset) as *const u16).read_unaligned() }) as f32
    }
}

fn decode_pages(bytes: &[u8], options: LoadOptions) -> Result<(Vec<Page>, Option<ImageFormat>), BackendError> {
    let format = ImageFormat::from_content_type(&infer_content_type(bytes));
    let pages = match format {
        Some(ImageFormat::Avif) => vec![Page::still(decode_avif(bytes)?)],
        Some(ImageFormat::Gif) if options.animated => decode_gif_frames(bytes)?,
        None if looks_like_svg(bytes) => {
            vec![Page::still(DynamicImage::ImageRgba8(rasterize_svg(bytes)?))]
        }
        _ => vec![Page::still(
            image::load_from_memory(bytes).map_err(decode_error)?,
        )],
    };
    if pages.is_empty() {
        return Err(decode_error("no frames"));
    }
    Ok((pages, format))
}

// --- pixel operations ----------------------------------------------------

fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.2126 * f32::from(r) + 0.7152 * f32::from(g) + 0.0722 * f32::from(b)
}

fn resize(img: &DynamicImage, opts: &ResizeOptions) -> DynamicImage {
    let plan = plan_resize(
        (img.width(), img.height()),
        opts.width,
        opts.height,
        opts.fit,
        opts.without_enlargement,
    );
    let (w, h) = plan.scaled;
    let scaled = if (w, h) == (img.width(), img.height()) {
        img.clone()
    } else {
        img.resize_exact(w, h, FilterType::Lanczos3)
    };

    if let Some((cw, ch)) = plan.crop {
        let (x, y) = ((w.saturating_sub(cw)) / 2, (h.saturating_sub(ch)) / 2);
        return scaled.crop_imm(x, y, cw.min(w), ch.min(h));
    }
    if let Some((cw, ch)) = plan.canvas {
        let mut canvas = RgbaImage::from_pixel(cw, ch, image::Rgba(opts.background.to_array()));
        let (x, y) = ((cw.saturating_sub(w)) / 2, (ch.saturating_sub(h)) / 2);
        image::imageops::overlay(&mut canvas, &scaled.to_rgba8(), i64::from(x), i64::from(y));
        return DynamicImage::ImageRgba8(canvas);
    }
    scaled
}

fn rotate(img: &DynamicImage, angle: f64) -> Result<DynamicImage, BackendError> {
    if !angle.is_finite() {
        return Err(BackendError::ProcessingFailed(format!(
            "rotation angle {angle} is not finite"
        )));
    }
    let turns = angle.rem_euclid(360.0);
    Ok(match turns {
        t if t == 0.0 => img.clone(),
        t if t == 90.0 => img.rotate90(),
        t if t == 180.0 => img.rotate180(),
        t if t == 270.0 => img.rotate270(),
        t => rotate_free(img, t),
    })
}

/// Clockwise rotation by any angle onto a canvas grown to hold the rotated
/// corners. Uncovered pixels are transparent.
fn rotate_free(img: &DynamicImage, degrees: f64) -> DynamicImage {
    let src = img.to_rgba8();
    let (w, h) = (f64::from(src.width()), f64::from(src.height()));
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cw = (w * cos.abs() + h * sin.abs()).round().max(1.0) as u32;
    let ch = (w * sin.abs() + h * cos.abs()).round().max(1.0) as u32;
    let (dcx, dcy) = (f64::from(cw) / 2.0, f64::from(ch) / 2.0);

    let out = RgbaImage::from_fn(cw, ch, |x, y| {
        let dx = f64::from(x) + 0.5 - dcx;
        let dy = f64::from(y) + 0.5 - dcy;
        let sx = dx * cos + dy * sin + w / 2.0;
        let sy = dy * cos - dx * sin + h / 2.0;
        if sx >= 0.0 && sy >= 0.0 && sx < w && sy < h {
            *src.get_pixel(sx as u32, sy as u32)
        } else {
            image::Rgba([0, 0, 0, 0])
        }
    });
    DynamicImage::ImageRgba8(out)
}

/// Stretch luminance to the full 0..=255 range.
fn normalize(img: &DynamicImage) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    let (lo, hi) = rgba.pixels().fold((255.0f32, 0.0f32), |(lo, hi), p| {
        let l = luma(p[0], p[1], p[2]);
        (lo.min(l), hi.max(l))
    });
    if hi - lo < 1.0 {
        return img.clone();
    }
    let scale = 255.0 / (hi - lo);
    for p in rgba.pixels_mut() {
        for c in 0..3 {
            p[c] = ((f32::from(p[c]) - lo) * scale).round().clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

/// Keep each pixel's luminance, take chroma from `color`.
fn tint(img: &DynamicImage, color: Rgba) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    let tint = [color.r, color.g, color.b];
    let tint_luma = luma(color.r, color.g, color.b);
    for p in rgba.pixels_mut() {
        let l = luma(p[0], p[1], p[2]);
        for c in 0..3 {
            p[c] = (l + f32::from(tint[c]) - tint_luma).round().clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

fn flatten(img: &DynamicImage, background: Rgba) -> DynamicImage {
    let rgba = img.to_rgba8();
    let bg = [background.r, background.g, background.b];
    let out = RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let p = rgba.get_pixel(x, y);
        let a = f32::from(p[3]) / 255.0;
        let mix = |c: usize| (f32::from(p[c]) * a + f32::from(bg[c]) * (1.0 - a)).round() as u8;
        image::Rgb([mix(0), mix(1), mix(2)])
    });
    DynamicImage::ImageRgb8(out)
}

fn convolve(img: &DynamicImage, kernel: &Kernel) -> Result<DynamicImage, BackendError> {
    let (kw, kh) = (kernel.width as i64, kernel.height as i64);
    if kw == 0 || kh == 0 || kernel.kernel.len() as i64 != kw * kh {
        return Err(BackendError::ProcessingFailed(format!(
            "kernel of {} values does not match {}x{}",
            kernel.kernel.len(),
            kw,
            kh
        )));
    }
    let sum: f64 = kernel.kernel.iter().sum();
    let scale = kernel.scale.unwrap_or(if sum == 0.0 { 1.0 } else { sum });
    let offset = kernel.offset.unwrap_or(0.0);

    let src = img.to_rgba8();
    let (w, h) = (i64::from(src.width()), i64::from(src.height()));
    let out = RgbaImage::from_fn(src.width(), src.height(), |x, y| {
        let mut acc = [0.0f64; 3];
        for ky in 0..kh {
            for kx in 0..kw {
                let sx = (i64::from(x) + kx - kw / 2).clamp(0, w - 1) as u32;
                let sy = (i64::from(y) + ky - kh / 2).clamp(0, h - 1) as u32;
                let weight = kernel.kernel[(ky * kw + kx) as usize];
                let p = src.get_pixel(sx, sy);
                for c in 0..3 {
                    acc[c] += f64::from(p[c]) * weight;
                }
            }
        }
        let channel = |c: usize| (acc[c] / scale + offset).round().clamp(0.0, 255.0) as u8;
        image::Rgba([channel(0), channel(1), channel(2), src.get_pixel(x, y)[3]])
    });
    Ok(DynamicImage::ImageRgba8(out))
}

fn checked_sigma(sigma: f64, range: &RangeInclusive<f64>) -> Result<f32, BackendError> {
    if range.contains(&sigma) {
        Ok(sigma as f32)
    } else {
        Err(BackendError::ProcessingFailed(format!(
            "sigma {sigma} outside {}..={}",
            range.start(),
            range.end()
        )))
    }
}

fn apply_pixel_op(img: &DynamicImage, op: &PixelOp) -> Result<DynamicImage, BackendError> {
    let out = match op {
        PixelOp::Resize(opts) => resize(img, opts),
        PixelOp::Rotate(None) => img.clone(),
        PixelOp::Rotate(Some(angle)) => rotate(img, *angle)?,
        PixelOp::Flip => img.flipv(),
        PixelOp::Flop => img.fliph(),
        PixelOp::Grayscale => img.grayscale(),
        PixelOp::Normalize => normalize(img),
        PixelOp::Negate => {
            let mut inverted = img.clone();
            inverted.invert();
            inverted
        }
        PixelOp::Blur(None) => img.blur(1.0),
        PixelOp::Blur(Some(sigma)) => img.blur(checked_sigma(*sigma, &BLUR_SIGMA_RANGE)?),
        PixelOp::Sharpen(None) => img.unsharpen(0.5, 0),
        PixelOp::Sharpen(Some(sigma)) => {
            img.unsharpen(checked_sigma(*sigma, &SHARPEN_SIGMA_RANGE)?, 0)
        }
        PixelOp::Tint(color) => tint(img, *color),
        PixelOp::Flatten(background) => flatten(img, *background),
        PixelOp::Convolve(kernel) => convolve(img, kernel)?,
        PixelOp::ToFormat(..) => img.clone(),
    };
    Ok(out)
}

// --- compositing ---------------------------------------------------------

fn layer_pixels(input: &LayerInput) -> Result<RgbaImage, BackendError> {
    match input {
        LayerInput::Image(bytes) => {
            let (pages, _) = decode_pages(bytes, LoadOptions::default())?;
            Ok(pages[0].pixels.to_rgba8())
        }
        LayerInput::Ellipse(ellipse) => ellipse_mask(ellipse),
        LayerInput::Solid(color) => Ok(RgbaImage::from_pixel(1, 1, image::Rgba(color.to_array()))),
    }
}

fn composite_page(base: &DynamicImage, layer: &CompositeLayer) -> Result<DynamicImage, BackendError> {
    let mut canvas = base.to_rgba8();
    let (w, h) = canvas.dimensions();
    let mut pixels = layer_pixels(&layer.input)?;
    if layer.tile && pixels.width() > 0 && pixels.height() > 0 {
        let tile = pixels;
        pixels = RgbaImage::from_fn(w, h, |x, y| *tile.get_pixel(x % tile.width(), y % tile.height()));
    }
    let centered = |outer: u32, inner: u32| (i64::from(outer) - i64::from(inner)) / 2;
    let x = layer.left.unwrap_or_else(|| centered(w, pixels.width()));
    let y = layer.top.unwrap_or_else(|| centered(h, pixels.height()));

    match layer.blend {
        Blend::Over => image::imageops::overlay(&mut canvas, &pixels, x, y),
        Blend::DestIn => {
            for (px, py, pixel) in canvas.enumerate_pixels_mut() {
                let (lx, ly) = (i64::from(px) - x, i64::from(py) - y);
                let inside = lx >= 0
                    && ly >= 0
                    && lx < i64::from(pixels.width())
                    && ly < i64::from(pixels.height());
                let mask = if inside {
                    pixels.get_pixel(lx as u32, ly as u32)[3]
                } else {
                    0
                };
                pixel[3] = ((u16::from(pixel[3]) * u16::from(mask) + 127) / 255) as u8;
            }
        }
    }
    Ok(DynamicImage::ImageRgba8(canvas))
}

// --- encoding ------------------------------------------------------------

fn encode_still(
    img: &DynamicImage,
    format: ImageFormat,
    options: EncoderOptions,
) -> Result<Vec<u8>, BackendError> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let quality = options.quality.unwrap_or(DEFAULT_JPEG_QUALITY);
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
            img.to_rgb8()
                .write_with_encoder(encoder)
                .map_err(|e| encode_error(format, e))?;
        }
        ImageFormat::Png => {
            let encoder = image::codecs::png::PngEncoder::new(&mut buf);
            img.write_with_encoder(encoder)
                .map_err(|e| encode_error(format, e))?;
        }
        ImageFormat::Webp => {
            if options.quality.is_some() {
                debug!("webp encoder is lossless; quality ignored");
            }
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut buf);
            img.to_rgba8()
                .write_with_encoder(encoder)
                .map_err(|e| encode_error(format, e))?;
        }
        ImageFormat::Tiff => {
            let mut cursor = Cursor::new(&mut buf);
            img.write_to(&mut cursor, image::ImageFormat::Tiff)
                .map_err(|e| encode_error(format, e))?;
        }
        ImageFormat::Gif => {
            let mut cursor = Cursor::new(&mut buf);
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut cursor, image::ImageFormat::Gif)
                .map_err(|e| encode_error(format, e))?;
        }
        ImageFormat::Avif => {
            let quality = options.quality.unwrap_or(DEFAULT_AVIF_QUALITY);
            let speed = options
                .effort
                .map(|e| 10u8.saturating_sub(e).clamp(1, 10))
                .unwrap_or(DEFAULT_AVIF_SPEED);
            let encoder =
                image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut buf, speed, quality);
            img.to_rgba8()
                .write_with_encoder(encoder)
                .map_err(|e| encode_error(format, e))?;
        }
        ImageFormat::Heif | ImageFormat::Heic | ImageFormat::Raw => {
            return Err(BackendError::UnsupportedFormat(format));
        }
    }
    Ok(buf)
}

fn encode_animated_gif(pages: &[Page]) -> Result<Vec<u8>, BackendError> {
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|e| encode_error(ImageFormat::Gif, e))?;
        let frames = pages
            .iter()
            .map(|page| image::Frame::from_parts(page.pixels.to_rgba8(), 0, 0, page.delay));
        encoder
            .encode_frames(frames)
            .map_err(|e| encode_error(ImageFormat::Gif, e))?;
    }
    Ok(buf)
}

impl ImageBackend for RustBackend {
    type Image = RustImage;

    fn load(&self, bytes: &[u8], options: LoadOptions) -> Result<RustImage, BackendError> {
        let (pages, format) = decode_pages(bytes, options)?;
        Ok(RustImage {
            pages,
            format,
            encoder: EncoderOptions::default(),
        })
    }

    fn info(&self, image: &RustImage) -> ImageInfo {
        ImageInfo {
            width: image.first().width(),
            height: image.first().height(),
            format: image.format,
            pages: image.pages.len() as u32,
        }
    }

    fn apply(&self, image: &mut RustImage, op: &PixelOp) -> Result<(), BackendError> {
        if let PixelOp::ToFormat(format, options) = op {
            image.format = Some(*format);
            image.encoder = image.encoder.merged(*options);
            return Ok(());
        }
        image.map_pages(|page| apply_pixel_op(page, op))
    }

    fn extract(&self, image: &mut RustImage, area: &CropArea) -> Result<(), BackendError> {
        let (w, h) = (image.first().width(), image.first().height());
        if !area.fits_within(w, h) {
            return Err(BackendError::ProcessingFailed(format!(
                "extract area {area:?} outside {w}x{h} image"
            )));
        }
        image.map_pages(|page| Ok(page.crop_imm(area.left, area.top, area.width, area.height)))
    }

    fn composite(
        &self,
        image: &mut RustImage,
        layers: &[CompositeLayer],
    ) -> Result<(), BackendError> {
        for layer in layers {
            image.map_pages(|page| composite_page(page, layer))?;
        }
        Ok(())
    }

    fn encode(&self, image: &RustImage) -> Result<Vec<u8>, BackendError> {
        let format = image.format.unwrap_or(ImageFormat::Png);
        if image.pages.len() > 1 {
            if format == ImageFormat::Gif {
                return encode_animated_gif(&image.pages);
            }
            debug!(%format, "animated output not supported for format; keeping first frame");
        }
        encode_still(image.first(), format, image.encoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fit;
    use image::ImageEncoder;

    /// Encode a gradient as the given format.
    fn sample_bytes(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut buf = Vec::new();
        match format {
            image::ImageFormat::Jpeg => image::codecs::jpeg::JpegEncoder::new(&mut buf)
                .write_image(img.as_raw(), width, height, image::ExtendedColorType::Rgb8)
                .unwrap(),
            other => DynamicImage::ImageRgb8(img)
                .write_to(&mut Cursor::new(&mut buf), other)
                .unwrap(),
        }
        buf
    }

    fn load(bytes: &[u8]) -> RustImage {
        RustBackend::new().load(bytes, LoadOptions::default()).unwrap()
    }

    #[test]
    fn load_reports_format_and_size() {
        let backend = RustBackend::new();
        let image = load(&sample_bytes(40, 30, image::ImageFormat::Png));
        let info = backend.info(&image);
        assert_eq!((info.width, info.height, info.pages), (40, 30, 1));
        assert_eq!(info.format, Some(ImageFormat::Png));
    }

    #[test]
    fn load_garbage_errors() {
        assert!(RustBackend::new().load(b"not an image", LoadOptions::default()).is_err());
    }

    #[test]
    fn resize_cover_is_exact() {
        let backend = RustBackend::new();
        let mut image = load(&sample_bytes(400, 300, image::ImageFormat::Jpeg));
        backend
            .apply(
                &mut image,
                &PixelOp::Resize(ResizeOptions {
                    width: Some(100),
                    height: Some(100),
                    fit: Fit::Cover,
                    ..ResizeOptions::default()
                }),
            )
            .unwrap();
        let info = backend.info(&image);
        assert_eq!((info.width, info.height), (100, 100));
    }

    #[test]
    fn resize_contain_pads_with_background() {
        let backend = RustBackend::new();
        let mut image = load(&sample_bytes(200, 100, image::ImageFormat::Png));
        backend
            .apply(
                &mut image,
                &PixelOp::Resize(ResizeOptions {
                    width: Some(100),
                    height: Some(100),
                    fit: Fit::Contain,
                    background: Rgba::rgb(255, 0, 0),
                    without_enlargement: false,
                }),
            )
            .unwrap();
        let corner = image.first().to_rgba8().get_pixel(0, 0).0;
        assert_eq!(corner, [255, 0, 0, 255]);
        assert_eq!(image.first().height(), 100);
    }

    #[test]
    fn rotate_right_angle_swaps_dimensions() {
        let backend = RustBackend::new();
        let mut image = load(&sample_bytes(40, 20, image::ImageFormat::Png));
        backend.apply(&mut image, &PixelOp::Rotate(Some(-90.0))).unwrap();
        assert_eq!((image.first().width(), image.first().height()), (20, 40));
    }

    #[test]
    fn rotate_any_angle_grows_canvas() {
        let backend = RustBackend::new();
        let mut image = load(&sample_bytes(40, 20, image::ImageFormat::Png));
        backend.apply(&mut image, &PixelOp::Rotate(Some(45.0))).unwrap();
        // 60 / sqrt(2) on each side
        assert_eq!((image.first().width(), image.first().height()), (42, 42));
        let rgba = image.first().to_rgba8();
        assert_eq!(rgba.get_pixel(0, 0)[3], 0, "corner is uncovered");
        assert_eq!(rgba.get_pixel(21, 21)[3], 255, "center keeps the source");
    }

    #[test]
    fn sigma_outside_range_errors() {
        let backend = RustBackend::new();
        let mut image = load(&sample_bytes(20, 20, image::ImageFormat::Png));
        assert!(backend.apply(&mut image, &PixelOp::Blur(Some(1e12))).is_err());
        assert!(backend.apply(&mut image, &PixelOp::Sharpen(Some(50.0))).is_err());
        backend.apply(&mut image, &PixelOp::Blur(Some(1.0))).unwrap();
    }

    #[test]
    fn extract_outside_errors() {
        let backend = RustBackend::new();
        let mut image = load(&sample_bytes(50, 50, image::ImageFormat::Png));
        let area = CropArea {
            left: 40,
            top: 0,
            width: 20,
            height: 10,
        };
        assert!(backend.extract(&mut image, &area).is_err());
        let area = CropArea {
            left: 10,
            top: 10,
            width: 20,
            height: 10,
        };
        backend.extract(&mut image, &area).unwrap();
        assert_eq!((image.first().width(), image.first().height()), (20, 10));
    }

    #[test]
    fn convolve_identity_kernel_keeps_pixels() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(5, 5, |x, y| {
            image::Rgba([(x * 40) as u8, (y * 40) as u8, 7, 255])
        }));
        let kernel = Kernel {
            width: 3,
            height: 3,
            kernel: vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            scale: None,
            offset: None,
        };
        let out = convolve(&img, &kernel).unwrap();
        assert_eq!(out.to_rgba8(), img.to_rgba8());
    }

    #[test]
    fn convolve_rejects_mismatched_kernel() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(2, 2));
        let kernel = Kernel {
            width: 3,
            height: 3,
            kernel: vec![1.0; 4],
            scale: None,
            offset: None,
        };
        assert!(convolve(&img, &kernel).is_err());
    }

    #[test]
    fn flatten_drops_alpha_onto_background() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 0])));
        let out = flatten(&img, Rgba::rgb(10, 20, 30));
        assert_eq!(out.to_rgb8().get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn dest_in_solid_mask_scales_alpha() {
        let base = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, image::Rgba([9, 9, 9, 255])));
        let mask = Rgba {
            alpha: 0.5,
            ..Rgba::BLACK
        };
        let out = composite_page(&base, &CompositeLayer::mask(LayerInput::Solid(mask), true)).unwrap();
        let alpha = out.to_rgba8().get_pixel(3, 3)[3];
        assert!((127..=128).contains(&alpha));
    }

    #[test]
    fn round_crop_clears_corners() {
        let base = DynamicImage::ImageRgba8(RgbaImage::from_pixel(20, 20, image::Rgba([9, 9, 9, 255])));
        let ellipse = Ellipse {
            cx: 10.0,
            cy: 10.0,
            rx: 10.0,
            ry: 10.0,
            width: 20,
            height: 20,
        };
        let out = composite_page(&base, &CompositeLayer::mask(LayerInput::Ellipse(ellipse), false))
            .unwrap()
            .to_rgba8();
        assert_eq!(out.get_pixel(0, 0)[3], 0);
        assert_eq!(out.get_pixel(10, 10)[3], 255);
    }

    #[test]
    fn encode_jpeg_and_png() {
        let backend = RustBackend::new();
        let mut image = load(&sample_bytes(16, 16, image::ImageFormat::Png));
        backend
            .apply(
                &mut image,
                &PixelOp::ToFormat(ImageFormat::Jpeg, EncoderOptions::with_quality(70)),
            )
            .unwrap();
        let jpeg = backend.encode(&image).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(image.encoder.quality, Some(70));
    }

    #[test]
    fn encode_heif_is_unsupported() {
        let backend = RustBackend::new();
        let mut image = load(&sample_bytes(8, 8, image::ImageFormat::Png));
        backend
            .apply(&mut image, &PixelOp::ToFormat(ImageFormat::Heif, EncoderOptions::default()))
            .unwrap();
        assert!(matches!(
            backend.encode(&image),
            Err(BackendError::UnsupportedFormat(ImageFormat::Heif))
        ));
    }

    #[test]
    fn svg_sources_rasterize() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="30" height="10"><rect width="30" height="10" fill="red"/></svg>"#;
        let backend = RustBackend::new();
        let image = load(svg);
        let info = backend.info(&image);
        assert_eq!((info.width, info.height), (30, 10));
        assert_eq!(info.format, None);
    }

    #[test]
    fn avif_round_trip() {
        let backend = RustBackend::new();
        let mut image = load(&sample_bytes(32, 24, image::ImageFormat::Png));
        backend
            .apply(&mut image, &PixelOp::ToFormat(ImageFormat::Avif, EncoderOptions::default()))
            .unwrap();
        let avif = backend.encode(&image).unwrap();
        let decoded = load(&avif);
        assert_eq!(backend.info(&decoded).format, Some(ImageFormat::Avif));
        assert_eq!((decoded.first().width(), decoded.first().height()), (32, 24));
    }
}
