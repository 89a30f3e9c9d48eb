use std::collections::HashMap;
use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::SwapError;
use crate::face_detect::face_detect::{DetectedFace, ScrfdDetector};
use crate::face_recognition::face_recognition::{Embedding, FaceRecognition};
use crate::face_swapper::face_swapper::FaceSwapper;
use crate::frame::enhance::FaceEnhancer;
use crate::region::region::{normalize_regions, Region};
use crate::session::session::{
    SessionManager, DETECTOR_MODEL, EMBEDDER_MODEL, ENHANCER_MODEL, SWAPPER_MODEL,
};

/// 检测前允许的最大边长，更大的图先缩小再检测，坐标映射回原图
const DETECT_MAX_SIDE: u32 = 1920;

/// 人脸来源：id + 一张含目标身份的图片
#[derive(Clone)]
pub struct FaceSource {
    pub id: String,
    pub image: RgbImage,
}

/// 解析后的绑定：身份向量 + 可选主体选区。
/// 没有选区的绑定走"换最大人脸"的单源捷径。
#[derive(Clone)]
pub struct ResolvedBinding {
    pub face_source_id: String,
    pub embedding: Embedding,
    pub region: Option<Region>,
}

/// 推理引擎：持有四个模型会话，跨任务共享。
/// 每个模型由独立互斥锁保护，推理调用串行、合成等纯像素工作并行。
pub struct SwapEngine {
    detector: Mutex<ScrfdDetector>,
    embedder: Mutex<FaceRecognition>,
    swapper: Mutex<FaceSwapper>,
    enhancer: Option<Mutex<FaceEnhancer>>,
}

impl SwapEngine {
    /// 从模型目录加载。增强模型缺失不算错误，增强阶段整体跳过。
    pub fn load(models_dir: &Path, prefer_accelerator: bool) -> Result<Self, SwapError> {
        let manager = SessionManager::new(models_dir);
        let detector = ScrfdDetector::new(manager.load(DETECTOR_MODEL, prefer_accelerator)?)?;
        let embedder = FaceRecognition::new(manager.load(EMBEDDER_MODEL, prefer_accelerator)?)?;
        let swapper_bytes = manager.model_bytes(SWAPPER_MODEL)?;
        let swapper = FaceSwapper::new(
            manager.load(SWAPPER_MODEL, prefer_accelerator)?,
            &swapper_bytes,
        )?;
        let enhancer = if manager.model_path(ENHANCER_MODEL).exists() {
            Some(Mutex::new(FaceEnhancer::new(
                manager.load(ENHANCER_MODEL, prefer_accelerator)?,
            )?))
        } else {
            warn!("未找到增强模型 {ENHANCER_MODEL}，增强阶段不可用");
            None
        };
        info!("模型加载完成");
        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
            swapper: Mutex::new(swapper),
            enhancer,
        })
    }

    pub fn has_enhancer(&self) -> bool {
        self.enhancer.is_some()
    }

    /// 调整贴回阶段的颜色迁移混合比例（默认 0.5），对后续换脸生效
    pub fn set_color_blend(&self, blend: f32) {
        self.swapper.lock().color_blend = blend.clamp(0.0, 1.0);
    }

    pub fn detect_faces(&self, img: &RgbImage) -> Result<Vec<DetectedFace>, SwapError> {
        self.detector.lock().detect(img)
    }

    /// 面积最大的人脸
    pub fn get_one_face(&self, img: &RgbImage) -> Result<Option<DetectedFace>, SwapError> {
        Ok(largest_face(self.detect_faces(img)?))
    }

    pub fn embed(&self, img: &RgbImage, face: &DetectedFace) -> Result<Embedding, SwapError> {
        self.embedder.lock().embed(img, face)
    }

    /// 提取一张身份照片的身份向量（检测最大人脸并嵌入）
    pub fn extract_identity(&self, img: &RgbImage) -> Result<Embedding, SwapError> {
        let face = self.get_one_face(img)?.ok_or(SwapError::NoFaceDetected)?;
        self.embed(img, &face)
    }

    pub fn swap_face(
        &self,
        frame: &RgbImage,
        face: &DetectedFace,
        embedding: &Embedding,
    ) -> Result<RgbImage, SwapError> {
        self.swapper.lock().swap_face(frame, face, embedding)
    }

    /// 可选增强；增强器未加载时返回原帧拷贝
    pub fn enhance_face(
        &self,
        frame: &RgbImage,
        face: &DetectedFace,
    ) -> Result<RgbImage, SwapError> {
        match &self.enhancer {
            Some(enhancer) => enhancer.lock().enhance(frame, face),
            None => Ok(frame.clone()),
        }
    }

    /// 单源整图换脸：替换最大人脸，可选增强
    pub fn swap_largest(
        &self,
        frame: &RgbImage,
        embedding: &Embedding,
        enhance: bool,
    ) -> Result<RgbImage, SwapError> {
        let face = self.get_one_face(frame)?.ok_or(SwapError::NoFaceDetected)?;
        let mut out = self.swap_face(frame, &face, embedding)?;
        if enhance {
            out = self.enhance_face(&out, &face)?;
        }
        Ok(out)
    }

    /// 单源 + 选区：逐选区裁剪、检测、换脸、贴回。
    /// 无有效选区回退整图换脸；用户明确选了区域但区域内暂时没有人脸时，
    /// 仍输出保持原内容的图，而不是报错中断。
    pub fn swap_regions(
        &self,
        frame: &RgbImage,
        embedding: &Embedding,
        regions: &[Region],
        enhance: bool,
    ) -> Result<RgbImage, SwapError> {
        let (w, h) = frame.dimensions();
        let normalized = normalize_regions(regions, w, h);
        if normalized.is_empty() {
            warn!("无有效选区，回退整图换脸");
            return self.swap_largest(frame, embedding, enhance);
        }

        let mut out = frame.clone();
        let mut swapped_count = 0usize;
        for region in &normalized {
            match self.swap_in_crop(&mut out, region, embedding, enhance) {
                Ok(true) => swapped_count += 1,
                Ok(false) => debug!("选区 ({}, {}) 内没有人脸，跳过", region.x, region.y),
                // 单个选区失败不中断其余选区
                Err(e) => warn!("选区换脸失败，跳过: {e}"),
            }
        }
        debug!("选区换脸完成: {swapped_count}/{}", normalized.len());
        Ok(out)
    }

    /// 每个人脸来源检测并嵌入一次
    pub fn resolve_sources(
        &self,
        sources: &[FaceSource],
    ) -> Result<HashMap<String, Embedding>, SwapError> {
        if sources.is_empty() {
            return Err(SwapError::MissingFaceSources);
        }
        let mut out = HashMap::new();
        for source in sources {
            let embedding = self.extract_identity(&source.image)?;
            out.insert(source.id.clone(), embedding);
        }
        Ok(out)
    }

    /// 多源绑定换脸。每次换完在新图上继续，后续绑定在已替换的像素上
    /// 重新检测，因此绑定顺序敏感，顺序由调用方决定。
    pub fn swap_by_bindings(
        &self,
        frame: &RgbImage,
        bindings: &[ResolvedBinding],
        enhance: bool,
    ) -> Result<RgbImage, SwapError> {
        if bindings.is_empty() {
            return Err(SwapError::InvalidFaceSourceBinding);
        }
        let mut out = frame.clone();
        for binding in bindings {
            match &binding.region {
                Some(region) => {
                    let (w, h) = out.dimensions();
                    let normalized = normalize_regions(std::slice::from_ref(region), w, h);
                    let Some(region) = normalized.first() else {
                        return Err(SwapError::InvalidFaceSourceBinding);
                    };
                    match self.swap_in_crop(&mut out, region, &binding.embedding, enhance) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!("绑定 {} 的选区内没有人脸，跳过", binding.face_source_id)
                        }
                        Err(e) => warn!("绑定 {} 换脸失败，跳过: {e}", binding.face_source_id),
                    }
                }
                None => match self.swap_largest(&out, &binding.embedding, enhance) {
                    Ok(swapped) => out = swapped,
                    Err(SwapError::NoFaceDetected) => {
                        debug!("绑定 {} 未检测到人脸，跳过", binding.face_source_id)
                    }
                    Err(e) => warn!("绑定 {} 换脸失败，跳过: {e}", binding.face_source_id),
                },
            }
        }
        Ok(out)
    }

    /// 选区内换脸：裁剪 → 检测最大人脸 → 换脸（可选增强）→ 贴回。
    /// 返回是否发生了替换。
    fn swap_in_crop(
        &self,
        out: &mut RgbImage,
        region: &Region,
        embedding: &Embedding,
        enhance: bool,
    ) -> Result<bool, SwapError> {
        let crop = imageops::crop_imm(
            out,
            region.x as u32,
            region.y as u32,
            region.width as u32,
            region.height as u32,
        )
        .to_image();
        let Some(face) = largest_face(self.detect_faces(&crop)?) else {
            return Ok(false);
        };
        let mut swapped = self.swap_face(&crop, &face, embedding)?;
        if enhance {
            swapped = self.enhance_face(&swapped, &face)?;
        }
        imageops::replace(out, &swapped, region.x as i64, region.y as i64);
        Ok(true)
    }

    /// 检测并返回用户可选的正方形人脸选区。
    /// 大图先缩到 1920 以内检测再映射回原坐标；`areas` 限定搜索范围。
    pub fn detect_regions(
        &self,
        img: &RgbImage,
        areas: Option<&[Region]>,
    ) -> Result<Vec<Region>, SwapError> {
        let (w, h) = img.dimensions();
        let max_side = w.max(h);
        if max_side <= DETECT_MAX_SIDE {
            return self.detect_regions_inner(img, areas);
        }

        let scale = DETECT_MAX_SIDE as f32 / max_side as f32;
        let nw = ((w as f32 * scale) as u32).max(1);
        let nh = ((h as f32 * scale) as u32).max(1);
        info!("图片过大 ({w}x{h})，缩放至 {nw}x{nh} 进行检测");
        let resized = imageops::resize(img, nw, nh, FilterType::Triangle);

        let scaled_areas: Option<Vec<Region>> = areas.map(|areas| {
            normalize_regions(areas, w, h)
                .iter()
                .map(|r| Region {
                    x: (r.x as f32 * scale) as i32,
                    y: (r.y as f32 * scale) as i32,
                    width: (r.width as f32 * scale) as i32,
                    height: (r.height as f32 * scale) as i32,
                    face_source_id: r.face_source_id.clone(),
                })
                .collect()
        });
        let regions = self.detect_regions_inner(&resized, scaled_areas.as_deref())?;
        Ok(regions
            .iter()
            .map(|r| Region {
                x: (r.x as f32 / scale) as i32,
                y: (r.y as f32 / scale) as i32,
                width: (r.width as f32 / scale) as i32,
                height: (r.height as f32 / scale) as i32,
                face_source_id: None,
            })
            .collect())
    }

    fn detect_regions_inner(
        &self,
        img: &RgbImage,
        areas: Option<&[Region]>,
    ) -> Result<Vec<Region>, SwapError> {
        let (w, h) = img.dimensions();
        let faces = self.detect_faces_in_areas(img, areas)?;
        Ok(crate::region::region::detections_to_regions(&faces, w, h))
    }

    /// 区域受限检测：在每个搜索区内检测并把坐标平移回全图
    pub fn detect_faces_in_areas(
        &self,
        img: &RgbImage,
        areas: Option<&[Region]>,
    ) -> Result<Vec<DetectedFace>, SwapError> {
        let (w, h) = img.dimensions();
        let areas = match areas {
            Some(areas) if !areas.is_empty() => normalize_regions(areas, w, h),
            _ => return self.detect_faces(img),
        };

        let mut out = Vec::new();
        for area in &areas {
            let crop = imageops::crop_imm(
                img,
                area.x as u32,
                area.y as u32,
                area.width as u32,
                area.height as u32,
            )
            .to_image();
            for face in self.detect_faces(&crop)? {
                out.push(offset_face(face, area.x as f32, area.y as f32));
            }
        }
        Ok(out)
    }
}

/// 面积最大的检测结果
pub fn largest_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    faces.into_iter().max_by(|a, b| {
        a.bbox
            .area()
            .partial_cmp(&b.bbox.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// 把局部坐标的检测结果平移回全图坐标
fn offset_face(mut face: DetectedFace, dx: f32, dy: f32) -> DetectedFace {
    face.bbox.x1 += dx;
    face.bbox.x2 += dx;
    face.bbox.y1 += dy;
    face.bbox.y2 += dy;
    if let Some(lm) = &mut face.landmarks {
        for p in lm.iter_mut() {
            p[0] += dx;
            p[1] += dy;
        }
    }
    face
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::geometry::BBox;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> DetectedFace {
        DetectedFace {
            bbox: BBox::new(x1, y1, x2, y2),
            score,
            landmarks: Some([[x1, y1]; 5]),
        }
    }

    #[test]
    fn largest_face_picks_by_area_not_score() {
        let faces = vec![
            face(0.0, 0.0, 50.0, 50.0, 0.99),
            face(100.0, 100.0, 300.0, 300.0, 0.6),
        ];
        let picked = largest_face(faces).unwrap();
        assert!((picked.score - 0.6).abs() < 1e-6);
        assert!(largest_face(Vec::new()).is_none());
    }

    #[test]
    fn offset_face_moves_box_and_landmarks() {
        let f = offset_face(face(10.0, 20.0, 30.0, 40.0, 0.9), 100.0, 200.0);
        assert!((f.bbox.x1 - 110.0).abs() < 1e-6);
        assert!((f.bbox.y2 - 240.0).abs() < 1e-6);
        assert!((f.landmarks.unwrap()[0][1] - 220.0).abs() < 1e-6);
    }
}
