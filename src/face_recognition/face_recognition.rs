use image::RgbImage;
use ndarray::{Array1, Array4};
use ort::session::Session;
use ort::value::TensorRef;

use crate::error::SwapError;
use crate::face_detect::face_detect::DetectedFace;
use crate::geometry::geometry::{align_matrix, warp_affine_rgb};
use crate::utils::process_img::l2_normalize;

pub const EMBED_INPUT_SIZE: u32 = 112;
pub const EMBEDDING_DIM: usize = 512;

/// 512 维身份向量，提取后始终是 L2 单位向量
pub type Embedding = Array1<f32>;

/// ArcFace r50 特征提取器。
/// 输入：对齐到 112x112 的人脸，BGR，(p − 127.5)/127.5；
/// 输出：L2 归一化的 512 维向量，不做其它后处理。
pub struct FaceRecognition {
    model: Session,
    input_name: String,
    output_name: String,
}

impl FaceRecognition {
    pub fn new(model: Session) -> Result<Self, SwapError> {
        let input_name = model
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| SwapError::ModelLoadFailed("识别模型没有输入".into()))?;
        let output_name = model
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| SwapError::ModelLoadFailed("识别模型没有输出".into()))?;
        Ok(Self {
            model,
            input_name,
            output_name,
        })
    }

    /// 从原图和五点关键点提取身份向量（对齐 → 推理 → L2 归一化）
    pub fn embed(&mut self, img: &RgbImage, face: &DetectedFace) -> Result<Embedding, SwapError> {
        let lm = face.landmarks_or_estimate();
        let m = align_matrix(&lm, EMBED_INPUT_SIZE);
        let inv = m
            .invert()
            .ok_or_else(|| SwapError::SwapFailed("对齐矩阵不可逆".into()))?;
        let aligned = warp_affine_rgb(img, &inv, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE);

        let input = preprocess_aligned(&aligned);
        let tensor = TensorRef::from_array_view(input.view())?;
        let outputs = self
            .model
            .run(ort::inputs![self.input_name.as_str() => tensor])?;
        let out = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;

        let flat: Array1<f32> = out.iter().copied().collect();
        if flat.len() != EMBEDDING_DIM {
            return Err(SwapError::SwapFailed(format!(
                "识别输出维度异常: {}",
                flat.len()
            )));
        }
        Ok(l2_normalize(flat))
    }
}

/// BGR 通道顺序，归一化到 [-1, 1]
fn preprocess_aligned(aligned: &RgbImage) -> Array4<f32> {
    let w = aligned.width() as usize;
    let h = aligned.height() as usize;
    let mut input = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, p) in aligned.enumerate_pixels() {
        input[[0, 0, y as usize, x as usize]] = (p[2] as f32 - 127.5) / 127.5;
        input[[0, 1, y as usize, x as usize]] = (p[1] as f32 - 127.5) / 127.5;
        input[[0, 2, y as usize, x as usize]] = (p[0] as f32 - 127.5) / 127.5;
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn preprocess_is_bgr_in_unit_range() {
        let mut img = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        img.put_pixel(1, 2, Rgb([255, 127, 0]));
        let t = preprocess_aligned(&img);
        // 黑色像素 → -1
        assert!((t[[0, 0, 0, 0]] - (-1.0)).abs() < 1e-3);
        // 通道 0 是 B：该像素 B=0 → -1；通道 2 是 R：255 → 1
        assert!((t[[0, 0, 2, 1]] - (-1.0)).abs() < 1e-3);
        assert!((t[[0, 2, 2, 1]] - 1.0).abs() < 1e-3);
        // 全部落在 [-1, 1]
        for v in t.iter() {
            assert!(*v >= -1.0 && *v <= 1.0);
        }
    }
}
