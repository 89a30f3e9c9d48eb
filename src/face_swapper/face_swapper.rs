use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayViewD, Axis};
use ort::session::Session;
use ort::value::{Tensor, TensorRef};
use tracing::{info, warn};

use crate::error::SwapError;
use crate::face_detect::face_detect::DetectedFace;
use crate::face_recognition::face_recognition::Embedding;
use crate::face_swapper::emap::{apply_emap, extract_emap, EmapStatus};
use crate::geometry::geometry::{
    align_matrix, composite_masked, feather_mask, warp_affine_gray, warp_affine_rgb,
};

pub const SWAP_INPUT_SIZE: u32 = 128;
/// 贴回遮罩的渐变边宽（边长比例）
const FEATHER_FRAC: f32 = 0.12;

/// InSwapper 128 人脸替换器。
///
/// 模型输入是 128x128 对齐人脸（BGR，[0,255] 原始像素值的 float32）和
/// 经过 emap 变换的身份向量；裸输出不能直接用，必须经过颜色校正、
/// 羽化遮罩和逆仿射贴回才能得到可用的帧。
pub struct FaceSwapper {
    model: Session,
    target_name: String,
    source_name: String,
    output_name: String,
    emap: EmapStatus,
    /// 颜色迁移与原始输出的混合比例，默认 0.5，
    /// 通过任务请求的 color_blend 字段调整
    pub color_blend: f32,
}

impl FaceSwapper {
    /// `model_bytes` 是模型文件原始字节，用于在会话之外扫描 emap
    pub fn new(model: Session, model_bytes: &[u8]) -> Result<Self, SwapError> {
        if model.inputs.len() < 2 {
            return Err(SwapError::ModelLoadFailed(format!(
                "换脸模型输入数异常: {}",
                model.inputs.len()
            )));
        }
        let target_name = model.inputs[0].name.clone();
        let source_name = model.inputs[1].name.clone();
        let output_name = model
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| SwapError::ModelLoadFailed("换脸模型没有输出".into()))?;

        let emap = extract_emap(model_bytes);
        match &emap {
            EmapStatus::Loaded(_) => info!("成功从模型中提取 emap 矩阵 [512x512]"),
            EmapStatus::Missing => {
                warn!("模型中未找到 emap initializer，直接使用原始身份向量，画质会下降")
            }
            EmapStatus::Corrupt => {
                warn!("emap 数据未通过校验，直接使用原始身份向量，画质会下降")
            }
        }

        Ok(Self {
            model,
            target_name,
            source_name,
            output_name,
            emap,
            color_blend: 0.5,
        })
    }

    pub fn emap_loaded(&self) -> bool {
        matches!(self.emap, EmapStatus::Loaded(_))
    }

    /// 身份向量 → 模型隐向量。emap 缺失或损坏时原样传入
    fn latent(&self, identity: &Embedding) -> Embedding {
        match &self.emap {
            EmapStatus::Loaded(m) => apply_emap(m, identity),
            _ => identity.clone(),
        }
    }

    /// 用给定身份替换帧中一张人脸，返回新的帧（原帧不变）
    pub fn swap_face(
        &mut self,
        frame: &RgbImage,
        face: &DetectedFace,
        identity: &Embedding,
    ) -> Result<RgbImage, SwapError> {
        let lm = face.landmarks_or_estimate();
        let m = align_matrix(&lm, SWAP_INPUT_SIZE);
        let inv = m
            .invert()
            .ok_or_else(|| SwapError::SwapFailed("对齐矩阵不可逆".into()))?;
        let aligned = warp_affine_rgb(frame, &inv, SWAP_INPUT_SIZE, SWAP_INPUT_SIZE);

        // BGR，不归一化
        let size = SWAP_INPUT_SIZE as usize;
        let mut input = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, p) in aligned.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = p[2] as f32;
            input[[0, 1, y as usize, x as usize]] = p[1] as f32;
            input[[0, 2, y as usize, x as usize]] = p[0] as f32;
        }

        let latent = self.latent(identity).insert_axis(Axis(0));
        let face_tensor = TensorRef::from_array_view(input.view())?;
        let latent_tensor = Tensor::from_array(latent)?;

        let outputs = self.model.run(ort::inputs![
            self.target_name.as_str() => face_tensor,
            self.source_name.as_str() => latent_tensor,
        ])?;
        let output = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let swapped = bgr_tensor_to_image(output)?;

        // 贴回：颜色校正 → 羽化遮罩 → 逆变换到原帧空间 → alpha 合成。
        // 合成在原帧分辨率完成，避免一次多余的重采样。
        let corrected = color_transfer(&swapped, &aligned, self.color_blend);
        let mask = feather_mask(SWAP_INPUT_SIZE, FEATHER_FRAC);
        let (fw, fh) = frame.dimensions();
        let warped_face = warp_affine_rgb(&corrected, &m, fw, fh);
        let warped_mask = warp_affine_gray(&mask, &m, fw, fh);

        let mut out = frame.clone();
        composite_masked(&mut out, &warped_face, &warped_mask);
        Ok(out)
    }
}

/// [1, 3, H, W] BGR 像素值张量 → RgbImage
fn bgr_tensor_to_image(output: ArrayViewD<'_, f32>) -> Result<RgbImage, SwapError> {
    let shape = output.shape();
    let (h, w) = match shape {
        [1, 3, h, w] => (*h, *w),
        _ => {
            return Err(SwapError::SwapFailed(format!(
                "换脸输出形状异常: {shape:?}"
            )))
        }
    };
    let mut img = RgbImage::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let b = output[[0, 0, y, x]].round().clamp(0.0, 255.0) as u8;
            let g = output[[0, 1, y, x]].round().clamp(0.0, 255.0) as u8;
            let r = output[[0, 2, y, x]].round().clamp(0.0, 255.0) as u8;
            img.put_pixel(x as u32, y as u32, Rgb([r, g, b]));
        }
    }
    Ok(img)
}

/// 逐通道均值/标准差，只统计内缩 margin 之后的中心区域，避免背景污染
fn region_stats(img: &RgbImage, margin: u32) -> ([f32; 3], [f32; 3]) {
    let (w, h) = img.dimensions();
    let (x0, x1) = (margin, w.saturating_sub(margin));
    let (y0, y1) = (margin, h.saturating_sub(margin));
    let mut mean = [0.0f32; 3];
    let mut count = 0u32;
    for y in y0..y1 {
        for x in x0..x1 {
            let p = img.get_pixel(x, y);
            for c in 0..3 {
                mean[c] += p[c] as f32;
            }
            count += 1;
        }
    }
    let count = count.max(1) as f32;
    for m in &mut mean {
        *m /= count;
    }
    let mut var = [0.0f32; 3];
    for y in y0..y1 {
        for x in x0..x1 {
            let p = img.get_pixel(x, y);
            for c in 0..3 {
                let d = p[c] as f32 - mean[c];
                var[c] += d * d;
            }
        }
    }
    let std = [
        (var[0] / count).sqrt(),
        (var[1] / count).sqrt(),
        (var[2] / count).sqrt(),
    ];
    (mean, std)
}

/// 把模型输出的颜色分布朝对齐原图拉近：
/// c' = (c − μ_tgt)·(σ_src/σ_tgt) + μ_src，σ 下限 1.0，
/// 再与原始输出按 blend 混合，防止过饱和
pub fn color_transfer(swapped: &RgbImage, reference: &RgbImage, blend: f32) -> RgbImage {
    let size = swapped.width().min(swapped.height());
    let margin = size / 6;
    let (src_mean, src_std) = region_stats(reference, margin);
    let (tgt_mean, tgt_std) = region_stats(swapped, margin);

    let mut out = swapped.clone();
    for pixel in out.pixels_mut() {
        for c in 0..3 {
            let v = pixel[c] as f32;
            let t_std = tgt_std[c].max(1.0);
            let s_std = src_std[c].max(1.0);
            let transferred = (v - tgt_mean[c]) * (s_std / t_std) + src_mean[c];
            let blended = v * (1.0 - blend) + transferred * blend;
            pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn region_stats_of_uniform_image() {
        let img = RgbImage::from_pixel(60, 60, Rgb([80, 120, 200]));
        let (mean, std) = region_stats(&img, 10);
        assert!((mean[0] - 80.0).abs() < 1e-3);
        assert!((mean[2] - 200.0).abs() < 1e-3);
        assert!(std[0] < 1e-3);
    }

    #[test]
    fn region_stats_ignores_border() {
        // 边框涂黑，内部常数：margin 内统计不受边框影响
        let mut img = RgbImage::from_pixel(60, 60, Rgb([100, 100, 100]));
        for x in 0..60 {
            for y in 0..5 {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let (mean, _) = region_stats(&img, 10);
        assert!((mean[0] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn color_transfer_moves_halfway_to_reference() {
        let swapped = RgbImage::from_pixel(36, 36, Rgb([100, 100, 100]));
        let reference = RgbImage::from_pixel(36, 36, Rgb([200, 150, 50]));
        let out = color_transfer(&swapped, &reference, 0.5);
        let p = out.get_pixel(18, 18);
        // 0.5 混合：(100 + 迁移值)/2
        assert_eq!(p[0], 150);
        assert_eq!(p[1], 125);
        assert_eq!(p[2], 75);
    }

    #[test]
    fn color_transfer_zero_blend_is_identity() {
        let swapped = RgbImage::from_pixel(36, 36, Rgb([90, 91, 92]));
        let reference = RgbImage::from_pixel(36, 36, Rgb([10, 20, 30]));
        let out = color_transfer(&swapped, &reference, 0.0);
        assert_eq!(*out.get_pixel(0, 0), Rgb([90, 91, 92]));
    }

    #[test]
    fn bgr_tensor_converts_channel_order() {
        let mut t = ArrayD::<f32>::zeros(vec![1, 3, 2, 2]);
        t[[0, 0, 0, 0]] = 255.0; // B
        t[[0, 2, 0, 0]] = 10.0; // R
        t[[0, 1, 1, 1]] = 300.0; // G，越界值被截断
        let img = bgr_tensor_to_image(t.view()).unwrap();
        assert_eq!(*img.get_pixel(0, 0), Rgb([10, 0, 255]));
        assert_eq!(*img.get_pixel(1, 1), Rgb([0, 255, 0]));
    }

    #[test]
    fn bgr_tensor_rejects_bad_shape() {
        let t = ArrayD::<f32>::zeros(vec![1, 4, 2, 2]);
        assert!(bgr_tensor_to_image(t.view()).is_err());
    }
}
