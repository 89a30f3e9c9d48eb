use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use ndarray::Array1;
use tracing::warn;

use crate::error::SwapError;

/// 支持的输入图片扩展名，HEIC/HEIF 在边界直接拒绝
const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "webp", "bmp", "tif", "tiff"];

const JPEG_QUALITY: u8 = 95;

pub fn is_supported_image_ext(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)),
        None => false,
    }
}

/// ISO BMFF 容器的 ftyp 品牌判断，image crate 无法解码 HEIC，
/// 在这里识别出来并给出明确的错误码
fn is_heif(bytes: &[u8]) -> bool {
    if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return false;
    }
    matches!(
        &bytes[8..12],
        b"heic" | b"heix" | b"heif" | b"hevc" | b"mif1" | b"msf1"
    )
}

/// 从字节解码为 8 位 RGB 三通道图像。
/// 16 位 PNG/TIFF、灰度图、带 Alpha 的 PNG 统一转换成 8 位 3 通道。
pub fn read_image_bytes(bytes: &[u8]) -> Result<RgbImage, SwapError> {
    if is_heif(bytes) {
        return Err(SwapError::UnsupportedImageFormat);
    }
    let format =
        image::guess_format(bytes).map_err(|_| SwapError::UnsupportedImageFormat)?;
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| SwapError::ImageDecodeFailed(e.to_string()))?;
    Ok(img.to_rgb8())
}

/// 从文件读取图片，边界检查：存在性 + 扩展名白名单
pub fn read_image(path: &Path) -> Result<RgbImage, SwapError> {
    if !path.exists() {
        return Err(SwapError::FileNotFound(path.to_path_buf()));
    }
    if !is_supported_image_ext(path) {
        return Err(SwapError::UnsupportedImageFormat);
    }
    let bytes = std::fs::read(path)
        .map_err(|e| SwapError::ImageDecodeFailed(e.to_string()))?;
    read_image_bytes(&bytes)
}

fn encode_to(img: &RgbImage, format: ImageFormat) -> Result<Vec<u8>, SwapError> {
    let mut buf = Vec::new();
    if format == ImageFormat::Jpeg {
        let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buf), JPEG_QUALITY);
        img.write_with_encoder(encoder)
            .map_err(|e| SwapError::OutputWriteFailed(e.to_string()))?;
    } else {
        img.write_to(&mut Cursor::new(&mut buf), format)
            .map_err(|e| SwapError::OutputWriteFailed(e.to_string()))?;
    }
    Ok(buf)
}

/// 按给定格式编码，编码失败回退 PNG。返回 (字节, 实际使用的格式)。
pub fn encode_image(
    img: &RgbImage,
    format: ImageFormat,
) -> Result<(Vec<u8>, ImageFormat), SwapError> {
    match encode_to(img, format) {
        Ok(buf) => Ok((buf, format)),
        Err(e) => {
            if format == ImageFormat::Png {
                return Err(e);
            }
            warn!("按 {:?} 编码失败，回退 PNG: {}", format, e);
            let buf = encode_to(img, ImageFormat::Png)?;
            Ok((buf, ImageFormat::Png))
        }
    }
}

/// 保存图片：优先按原扩展名写，失败或扩展名未知时回退 PNG。
/// 返回实际写入的路径（回退时扩展名会变成 .png）。
pub fn write_image(img: &RgbImage, path: &Path) -> Result<PathBuf, SwapError> {
    let ext_format = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ImageFormat::from_extension);
    let (bytes, used) = encode_image(img, ext_format.unwrap_or(ImageFormat::Png))?;
    let out_path = if ext_format == Some(used) {
        path.to_path_buf()
    } else {
        path.with_extension("png")
    };
    std::fs::write(&out_path, bytes)
        .map_err(|e| SwapError::OutputWriteFailed(e.to_string()))?;
    Ok(out_path)
}

/// 输出文件路径：`<stem>_output.<ext>`
pub fn output_image_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let ext = input.extension().and_then(|e| e.to_str()).unwrap_or("png");
    input.with_file_name(format!("{stem}_output.{ext}"))
}

/// 视频输出路径统一为 `<stem>_output.mp4`
pub fn output_video_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    input.with_file_name(format!("{stem}_output.mp4"))
}

/// L2 归一化，零向量原样返回
pub fn l2_normalize(v: Array1<f32>) -> Array1<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < 1e-10 {
        return v;
    }
    v / norm
}
