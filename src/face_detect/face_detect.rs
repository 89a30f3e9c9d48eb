use image::imageops::FilterType;
use image::{imageops, RgbImage};
use ndarray::{Array2, Array4, ArrayViewD, Axis, Ix2};
use ort::session::Session;
use ort::value::TensorRef;
use tracing::debug;

use crate::error::SwapError;
use crate::geometry::geometry::BBox;

pub const DETECT_INPUT_SIZE: u32 = 640;
const CONF_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];

/// 黑色像素经 (p − 127.5)/128 预处理后的值。
/// letterbox 填充必须用它而不是 0，填 0 会改变 anchor 的统计分布。
const PAD_VALUE: f32 = -127.5 / 128.0;

/// 检测到的人脸：框 + 置信度 + 五点关键点，坐标都在原图像素系
#[derive(Clone, Debug)]
pub struct DetectedFace {
    pub bbox: BBox,
    pub score: f32,
    /// 模型输出的关键点；无关键点头的模型变体为 None
    pub landmarks: Option<[[f32; 2]; 5]>,
}

impl DetectedFace {
    /// 关键点，模型没有输出时按框几何粗略估计。
    /// 估计值只够对齐裁剪使用，对身份稳定性有要求时应换带关键点的模型。
    pub fn landmarks_or_estimate(&self) -> [[f32; 2]; 5] {
        if let Some(lm) = self.landmarks {
            return lm;
        }
        let (cx, cy) = self.bbox.center();
        let w = self.bbox.width();
        let h = self.bbox.height();
        [
            [cx - w * 0.17, cy - h * 0.12],
            [cx + w * 0.17, cy - h * 0.12],
            [cx, cy + h * 0.02],
            [cx - w * 0.14, cy + h * 0.18],
            [cx + w * 0.14, cy + h * 0.18],
        ]
    }
}

/// 模型输出布局，在会话打开时根据输出签名确定，
/// 每种布局有自己的解码分支
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorOutputShape {
    /// 3 个 stride × (scores, bboxes, landmarks)
    NineTensor,
    /// 3 个 stride × (scores, bboxes)，无关键点头
    SixTensor,
    /// 单个合并输出，每行 [x1, y1, x2, y2, score, (10 个关键点值)]
    Merged,
}

/// SCRFD 2.5g 人脸检测器
pub struct ScrfdDetector {
    model: Session,
    input_name: String,
    output_names: Vec<String>,
    output_shape: DetectorOutputShape,
}

impl ScrfdDetector {
    pub fn new(model: Session) -> Result<Self, SwapError> {
        let input_name = model
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| SwapError::ModelLoadFailed("检测模型没有输入".into()))?;
        let output_names: Vec<String> = model.outputs.iter().map(|o| o.name.clone()).collect();
        let output_shape = match output_names.len() {
            9 => DetectorOutputShape::NineTensor,
            6 => DetectorOutputShape::SixTensor,
            _ => DetectorOutputShape::Merged,
        };
        debug!("检测模型输出数 {} → {:?}", output_names.len(), output_shape);
        Ok(Self {
            model,
            input_name,
            output_names,
            output_shape,
        })
    }

    pub fn output_shape(&self) -> DetectorOutputShape {
        self.output_shape
    }

    /// 检测图像中的所有人脸，返回 NMS 之后按置信度降序的结果
    pub fn detect(&mut self, img: &RgbImage) -> Result<Vec<DetectedFace>, SwapError> {
        let (orig_w, orig_h) = (img.width(), img.height());
        if orig_w == 0 || orig_h == 0 {
            return Ok(Vec::new());
        }

        // 保持宽高比缩放进 640x640 letterbox
        let scale = (DETECT_INPUT_SIZE as f32 / orig_w as f32)
            .min(DETECT_INPUT_SIZE as f32 / orig_h as f32);
        let new_w = ((orig_w as f32 * scale).round() as u32).max(1);
        let new_h = ((orig_h as f32 * scale).round() as u32).max(1);
        let resized = imageops::resize(img, new_w, new_h, FilterType::Triangle);

        let size = DETECT_INPUT_SIZE as usize;
        let mut input = Array4::<f32>::from_elem((1, 3, size, size), PAD_VALUE);
        for (x, y, pixel) in resized.enumerate_pixels() {
            // BGR 通道顺序
            input[[0, 0, y as usize, x as usize]] = (pixel[2] as f32 - 127.5) / 128.0;
            input[[0, 1, y as usize, x as usize]] = (pixel[1] as f32 - 127.5) / 128.0;
            input[[0, 2, y as usize, x as usize]] = (pixel[0] as f32 - 127.5) / 128.0;
        }

        let input_tensor = TensorRef::from_array_view(input.view())?;
        let outputs = self
            .model
            .run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        let mut faces = Vec::new();
        match self.output_shape {
            DetectorOutputShape::NineTensor => {
                for (s, &stride) in STRIDES.iter().enumerate() {
                    let scores = as_2d(
                        outputs[self.output_names[s * 3].as_str()].try_extract_tensor::<f32>()?,
                    )?;
                    let bboxes = as_2d(
                        outputs[self.output_names[s * 3 + 1].as_str()]
                            .try_extract_tensor::<f32>()?,
                    )?;
                    let kps = as_2d(
                        outputs[self.output_names[s * 3 + 2].as_str()]
                            .try_extract_tensor::<f32>()?,
                    )?;
                    decode_stride(
                        stride,
                        &scores,
                        &bboxes,
                        Some(&kps),
                        scale,
                        orig_w as f32,
                        orig_h as f32,
                        &mut faces,
                    );
                }
            }
            DetectorOutputShape::SixTensor => {
                for (s, &stride) in STRIDES.iter().enumerate() {
                    let scores = as_2d(
                        outputs[self.output_names[s * 2].as_str()].try_extract_tensor::<f32>()?,
                    )?;
                    let bboxes = as_2d(
                        outputs[self.output_names[s * 2 + 1].as_str()]
                            .try_extract_tensor::<f32>()?,
                    )?;
                    decode_stride(
                        stride,
                        &scores,
                        &bboxes,
                        None,
                        scale,
                        orig_w as f32,
                        orig_h as f32,
                        &mut faces,
                    );
                }
            }
            DetectorOutputShape::Merged => {
                let merged = as_2d(
                    outputs[self.output_names[0].as_str()].try_extract_tensor::<f32>()?,
                )?;
                decode_merged(&merged, scale, orig_w as f32, orig_h as f32, &mut faces);
            }
        }

        Ok(nms(faces, NMS_THRESHOLD))
    }
}

/// 把 [N, C] 或 [1, N, C] 的输出统一成二维
fn as_2d(view: ArrayViewD<'_, f32>) -> Result<Array2<f32>, SwapError> {
    match view.ndim() {
        2 => Ok(view.into_dimensionality::<Ix2>()?.to_owned()),
        3 if view.shape()[0] == 1 => Ok(view
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()?
            .to_owned()),
        _ => Err(SwapError::SwapFailed(format!(
            "检测输出形状不支持: {:?}",
            view.shape()
        ))),
    }
}

/// 按 stride 解码 anchor：中心 (gx+0.5, gy+0.5)·s，
/// bbox 为中心到四条边的距离（stride 单位），关键点同理
#[allow(clippy::too_many_arguments)]
fn decode_stride(
    stride: usize,
    scores: &Array2<f32>,
    bboxes: &Array2<f32>,
    kps: Option<&Array2<f32>>,
    scale: f32,
    orig_w: f32,
    orig_h: f32,
    out: &mut Vec<DetectedFace>,
) {
    let grid_w = DETECT_INPUT_SIZE as usize / stride;
    let grid_total = grid_w * grid_w;
    let num_anchors = scores.nrows();
    if grid_total == 0 || num_anchors == 0 {
        return;
    }
    let anchors_per_point = (num_anchors as f32 / grid_total as f32).ceil().max(1.0) as usize;
    let s = stride as f32;

    for i in 0..num_anchors {
        let score = scores[[i, 0]];
        if score < CONF_THRESHOLD {
            continue;
        }
        if bboxes.ncols() < 4 {
            continue;
        }

        let anchor_idx = i / anchors_per_point;
        let gx = (anchor_idx % grid_w) as f32;
        let gy = (anchor_idx / grid_w) as f32;
        let cx = (gx + 0.5) * s;
        let cy = (gy + 0.5) * s;

        let bbox = BBox::new(
            (cx - bboxes[[i, 0]] * s) / scale,
            (cy - bboxes[[i, 1]] * s) / scale,
            (cx + bboxes[[i, 2]] * s) / scale,
            (cy + bboxes[[i, 3]] * s) / scale,
        )
        .clamp_to(orig_w, orig_h);

        let landmarks = kps.and_then(|kps| {
            if kps.ncols() < 10 {
                return None;
            }
            let mut lm = [[0.0f32; 2]; 5];
            for (k, p) in lm.iter_mut().enumerate() {
                p[0] = (cx + kps[[i, k * 2]] * s) / scale;
                p[1] = (cy + kps[[i, k * 2 + 1]] * s) / scale;
            }
            Some(lm)
        });

        out.push(DetectedFace {
            bbox,
            score,
            landmarks,
        });
    }
}

/// 合并输出：每行 [x1, y1, x2, y2, score, (关键点 x5)]，坐标已在 letterbox 空间
fn decode_merged(
    merged: &Array2<f32>,
    scale: f32,
    orig_w: f32,
    orig_h: f32,
    out: &mut Vec<DetectedFace>,
) {
    for row in merged.rows() {
        if row.len() < 5 {
            continue;
        }
        let score = row[4];
        if score < CONF_THRESHOLD {
            continue;
        }
        let bbox = BBox::new(
            row[0] / scale,
            row[1] / scale,
            row[2] / scale,
            row[3] / scale,
        )
        .clamp_to(orig_w, orig_h);

        let landmarks = if row.len() >= 15 {
            let mut lm = [[0.0f32; 2]; 5];
            for (k, p) in lm.iter_mut().enumerate() {
                p[0] = row[5 + k * 2] / scale;
                p[1] = row[6 + k * 2] / scale;
            }
            Some(lm)
        } else {
            None
        };

        out.push(DetectedFace {
            bbox,
            score,
            landmarks,
        });
    }
}

/// 非极大值抑制。排序键带坐标次序，保证幸存集合只依赖输入的多重集合，
/// 与输入顺序无关。
pub fn nms(mut faces: Vec<DetectedFace>, threshold: f32) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a.bbox
                    .x1
                    .partial_cmp(&b.bbox.x1)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                a.bbox
                    .y1
                    .partial_cmp(&b.bbox.y1)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    let mut suppressed = vec![false; faces.len()];
    let mut result = Vec::new();
    for i in 0..faces.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..faces.len() {
            if !suppressed[j] && faces[i].bbox.iou(&faces[j].bbox) > threshold {
                suppressed[j] = true;
            }
        }
        result.push(faces[i].clone());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> DetectedFace {
        DetectedFace {
            bbox: BBox::new(x1, y1, x2, y2),
            score,
            landmarks: None,
        }
    }

    #[test]
    fn nms_keeps_highest_and_suppresses_overlap() {
        let faces = vec![
            face(0.0, 0.0, 100.0, 100.0, 0.9),
            face(5.0, 5.0, 105.0, 105.0, 0.8), // 与第一个重叠
            face(300.0, 300.0, 400.0, 400.0, 0.7),
        ];
        let kept = nms(faces, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn nms_is_order_independent() {
        let base = vec![
            face(0.0, 0.0, 100.0, 100.0, 0.9),
            face(5.0, 5.0, 105.0, 105.0, 0.8),
            face(300.0, 300.0, 400.0, 400.0, 0.7),
            face(310.0, 310.0, 390.0, 390.0, 0.65),
            face(600.0, 0.0, 640.0, 40.0, 0.55),
        ];
        let kept_forward = nms(base.clone(), 0.4);
        let mut reversed = base;
        reversed.reverse();
        let kept_reversed = nms(reversed, 0.4);
        assert_eq!(kept_forward.len(), kept_reversed.len());
        for (a, b) in kept_forward.iter().zip(&kept_reversed) {
            assert_eq!(a.bbox, b.bbox);
            assert!((a.score - b.score).abs() < 1e-6);
        }
    }

    #[test]
    fn estimated_landmarks_follow_box_geometry() {
        let f = face(100.0, 100.0, 200.0, 200.0, 0.9);
        let lm = f.landmarks_or_estimate();
        // 左右眼对称于竖直中线
        assert!((lm[0][1] - lm[1][1]).abs() < 1e-4);
        assert!(((lm[0][0] + lm[1][0]) / 2.0 - 150.0).abs() < 1e-3);
        // 鼻尖在中线上，嘴角低于眼睛
        assert!((lm[2][0] - 150.0).abs() < 1e-3);
        assert!(lm[3][1] > lm[0][1]);
        // 固定偏移量
        assert!((lm[0][0] - (150.0 - 100.0 * 0.17)).abs() < 1e-3);
        assert!((lm[3][1] - (150.0 + 100.0 * 0.18)).abs() < 1e-3);
    }

    #[test]
    fn pad_value_matches_normalized_black() {
        assert!((PAD_VALUE - (0.0 - 127.5) / 128.0).abs() < 1e-6);
        assert!(PAD_VALUE < -0.99 && PAD_VALUE > -1.0);
    }

    #[test]
    fn decode_stride_maps_anchor_to_source() {
        // 单个 anchor，stride 8，网格 (2, 3)，letterbox scale 0.5
        let grid_w = DETECT_INPUT_SIZE as usize / 8;
        let n = grid_w * grid_w * 2;
        let mut scores = Array2::<f32>::zeros((n, 1));
        let mut bboxes = Array2::<f32>::zeros((n, 4));
        let mut kps = Array2::<f32>::zeros((n, 10));
        let anchor_idx = 3 * grid_w + 2; // gy=3, gx=2
        let i = anchor_idx * 2;
        scores[[i, 0]] = 0.9;
        bboxes[[i, 0]] = 1.0;
        bboxes[[i, 1]] = 2.0;
        bboxes[[i, 2]] = 3.0;
        bboxes[[i, 3]] = 4.0;
        kps[[i, 0]] = 0.5;
        kps[[i, 1]] = -0.5;

        let mut out = Vec::new();
        decode_stride(8, &scores, &bboxes, Some(&kps), 0.5, 4000.0, 4000.0, &mut out);
        assert_eq!(out.len(), 1);
        let f = &out[0];
        let cx = (2.0 + 0.5) * 8.0;
        let cy = (3.0 + 0.5) * 8.0;
        assert!((f.bbox.x1 - (cx - 1.0 * 8.0) / 0.5).abs() < 1e-3);
        assert!((f.bbox.y1 - (cy - 2.0 * 8.0) / 0.5).abs() < 1e-3);
        assert!((f.bbox.x2 - (cx + 3.0 * 8.0) / 0.5).abs() < 1e-3);
        assert!((f.bbox.y2 - (cy + 4.0 * 8.0) / 0.5).abs() < 1e-3);
        let lm = f.landmarks.unwrap();
        assert!((lm[0][0] - (cx + 0.5 * 8.0) / 0.5).abs() < 1e-3);
        assert!((lm[0][1] - (cy - 0.5 * 8.0) / 0.5).abs() < 1e-3);
    }

    #[test]
    fn decode_merged_rows() {
        let mut merged = Array2::<f32>::zeros((2, 15));
        // 低于阈值的行被跳过
        merged[[0, 4]] = 0.3;
        merged[[1, 0]] = 100.0;
        merged[[1, 1]] = 50.0;
        merged[[1, 2]] = 200.0;
        merged[[1, 3]] = 150.0;
        merged[[1, 4]] = 0.8;
        merged[[1, 5]] = 120.0;
        merged[[1, 6]] = 80.0;
        let mut out = Vec::new();
        decode_merged(&merged, 0.5, 1000.0, 1000.0, &mut out);
        assert_eq!(out.len(), 1);
        assert!((out[0].bbox.x1 - 200.0).abs() < 1e-3);
        assert!((out[0].landmarks.unwrap()[0][0] - 240.0).abs() < 1e-3);
    }
}
