use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayViewD};
use ort::session::Session;
use ort::value::TensorRef;
use tracing::debug;

use crate::error::SwapError;
use crate::face_detect::face_detect::DetectedFace;
use crate::geometry::geometry::{
    align_matrix, composite_masked, feather_mask, warp_affine_gray, warp_affine_rgb,
};

pub const ENHANCE_INPUT_SIZE: u32 = 512;
/// 增强贴回用 10% 渐变边，比换脸的 12% 稍窄
const FEATHER_FRAC: f32 = 0.10;

/// GFPGAN 1.4 人脸增强器，可选阶段。
/// 对齐到 512x512 → 推理 → 与换脸相同的羽化贴回；模型本身保持颜色，
/// 不再做颜色迁移。
pub struct FaceEnhancer {
    model: Session,
    input_name: String,
    output_name: String,
}

impl FaceEnhancer {
    pub fn new(model: Session) -> Result<Self, SwapError> {
        let input_name = model
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| SwapError::ModelLoadFailed("增强模型没有输入".into()))?;
        let output_name = model
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| SwapError::ModelLoadFailed("增强模型没有输出".into()))?;
        Ok(Self {
            model,
            input_name,
            output_name,
        })
    }

    /// 增强帧中的一张人脸。没有模型关键点的人脸静默跳过（返回原帧的拷贝）。
    pub fn enhance(
        &mut self,
        frame: &RgbImage,
        face: &DetectedFace,
    ) -> Result<RgbImage, SwapError> {
        let Some(lm) = face.landmarks else {
            debug!("人脸缺少模型关键点，跳过增强");
            return Ok(frame.clone());
        };

        let m = align_matrix(&lm, ENHANCE_INPUT_SIZE);
        let Some(inv) = m.invert() else {
            debug!("对齐矩阵不可逆，跳过增强");
            return Ok(frame.clone());
        };
        let aligned = warp_affine_rgb(frame, &inv, ENHANCE_INPUT_SIZE, ENHANCE_INPUT_SIZE);

        // BGR，(p/255 − 0.5)/0.5 归一化到 [-1, 1]
        let size = ENHANCE_INPUT_SIZE as usize;
        let mut input = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, p) in aligned.enumerate_pixels() {
            input[[0, 0, y as usize, x as usize]] = (p[2] as f32 / 255.0 - 0.5) / 0.5;
            input[[0, 1, y as usize, x as usize]] = (p[1] as f32 / 255.0 - 0.5) / 0.5;
            input[[0, 2, y as usize, x as usize]] = (p[0] as f32 / 255.0 - 0.5) / 0.5;
        }

        let tensor = TensorRef::from_array_view(input.view())?;
        let outputs = self
            .model
            .run(ort::inputs![self.input_name.as_str() => tensor])?;
        let output = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        let enhanced = postprocess_output(output)?;

        let mask = feather_mask(ENHANCE_INPUT_SIZE, FEATHER_FRAC);
        let (fw, fh) = frame.dimensions();
        let warped_face = warp_affine_rgb(&enhanced, &m, fw, fh);
        let warped_mask = warp_affine_gray(&mask, &m, fw, fh);

        let mut out = frame.clone();
        composite_masked(&mut out, &warped_face, &warped_mask);
        Ok(out)
    }

    /// 依次增强多张人脸，单张失败跳过不影响其余
    pub fn enhance_all(
        &mut self,
        frame: &RgbImage,
        faces: &[DetectedFace],
    ) -> Result<RgbImage, SwapError> {
        let mut out = frame.clone();
        for face in faces {
            match self.enhance(&out, face) {
                Ok(enhanced) => out = enhanced,
                Err(e) => debug!("增强单张人脸失败，跳过: {e}"),
            }
        }
        Ok(out)
    }
}

/// [-1, 1] BGR 输出反归一化：(o·0.5 + 0.5)·255
fn postprocess_output(output: ArrayViewD<'_, f32>) -> Result<RgbImage, SwapError> {
    let shape = output.shape();
    let (h, w) = match shape {
        [1, 3, h, w] => (*h, *w),
        _ => {
            return Err(SwapError::SwapFailed(format!(
                "增强输出形状异常: {shape:?}"
            )))
        }
    };
    let mut img = RgbImage::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let b = ((output[[0, 0, y, x]].clamp(-1.0, 1.0) * 0.5 + 0.5) * 255.0) as u8;
            let g = ((output[[0, 1, y, x]].clamp(-1.0, 1.0) * 0.5 + 0.5) * 255.0) as u8;
            let r = ((output[[0, 2, y, x]].clamp(-1.0, 1.0) * 0.5 + 0.5) * 255.0) as u8;
            img.put_pixel(x as u32, y as u32, Rgb([r, g, b]));
        }
    }
    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn postprocess_denormalizes_bgr() {
        let mut t = ArrayD::<f32>::zeros(vec![1, 3, 1, 2]);
        // 全 0 → 中灰 127
        // (0,0): B=1.0 → 255, R=-1.0 → 0
        t[[0, 0, 0, 0]] = 1.0;
        t[[0, 2, 0, 0]] = -1.0;
        // (1,0): 越界值被 clamp
        t[[0, 1, 0, 1]] = 7.5;
        let img = postprocess_output(t.view()).unwrap();
        assert_eq!(*img.get_pixel(0, 0), Rgb([0, 127, 255]));
        assert_eq!(img.get_pixel(1, 0)[1], 255);
    }

    #[test]
    fn postprocess_rejects_bad_shape() {
        let t = ArrayD::<f32>::zeros(vec![3, 512, 512]);
        assert!(postprocess_output(t.view()).is_err());
    }
}
