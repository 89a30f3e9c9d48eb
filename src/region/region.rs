use serde::{Deserialize, Serialize};

use crate::face_detect::face_detect::DetectedFace;
use crate::geometry::geometry::{expand_square_box, BBox};

pub const REGION_EXPAND_SCALE: f32 = 1.35;
pub const REGION_MIN_SIZE: f32 = 48.0;
pub const REGION_DEDUPE_IOU: f32 = 0.45;

/// 主体图像素坐标系下的矩形选区，可携带人脸来源 id。
/// 选区来自用户框选，或由检测框做正方形扩展得到。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    #[serde(
        rename = "faceSourceId",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub face_source_id: Option<String>,
}

impl Region {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            face_source_id: None,
        }
    }

    pub fn bbox(&self) -> BBox {
        BBox::new(
            self.x as f32,
            self.y as f32,
            (self.x + self.width) as f32,
            (self.y + self.height) as f32,
        )
    }

    pub fn from_bbox(b: &BBox) -> Self {
        Self {
            x: b.x1.round() as i32,
            y: b.y1.round() as i32,
            width: b.width().round() as i32,
            height: b.height().round() as i32,
            face_source_id: None,
        }
    }
}

/// 选区裁剪到图像边界，宽高非正的丢弃
pub fn normalize_regions(regions: &[Region], width: u32, height: u32) -> Vec<Region> {
    let (w, h) = (width as i32, height as i32);
    regions
        .iter()
        .filter(|r| r.width > 0 && r.height > 0 && w > 0 && h > 0)
        .map(|r| {
            let x = r.x.clamp(0, w - 1);
            let y = r.y.clamp(0, h - 1);
            Region {
                x,
                y,
                width: r.width.min(w - x).max(1),
                height: r.height.min(h - y).max(1),
                face_source_id: r.face_source_id.clone(),
            }
        })
        .collect()
}

/// 多源绑定用的归一化：没有 face_source_id 的选区直接丢弃
pub fn normalize_bound_regions(regions: &[Region], width: u32, height: u32) -> Vec<Region> {
    let bound: Vec<Region> = regions
        .iter()
        .filter(|r| r.face_source_id.as_deref().is_some_and(|s| !s.is_empty()))
        .cloned()
        .collect();
    normalize_regions(&bound, width, height)
}

/// 检测结果 → 用户可见选区：正方形扩展（1.35 倍、最小 48px）+
/// IoU ≥ 0.45 去重（检测按分数降序，保留先出现者），最后按 (y, x) 排序
pub fn detections_to_regions(faces: &[DetectedFace], width: u32, height: u32) -> Vec<Region> {
    let mut kept: Vec<BBox> = Vec::new();
    for face in faces {
        let Some(sq) = expand_square_box(
            &face.bbox,
            width,
            height,
            REGION_EXPAND_SCALE,
            REGION_MIN_SIZE,
        ) else {
            continue;
        };
        if kept.iter().all(|k| k.iou(&sq) < REGION_DEDUPE_IOU) {
            kept.push(sq);
        }
    }
    kept.sort_by(|a, b| {
        (a.y1, a.x1)
            .partial_cmp(&(b.y1, b.x1))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    kept.iter().map(Region::from_bbox).collect()
}

/// 选区 → 检测绑定。
/// 优先取中心落在选区内的检测（同区多个时分数高者胜）；
/// 没有时退化为最近中心距离，但必须落在选区的 1.35 倍扩展框内，
/// 否则该选区视为无人脸。`used` 标记已被其它选区占用的检测。
pub fn bind_region(region: &Region, faces: &[DetectedFace], used: &[bool]) -> Option<usize> {
    let rb = region.bbox();

    let mut best_inside: Option<usize> = None;
    for (i, f) in faces.iter().enumerate() {
        if used[i] {
            continue;
        }
        let (cx, cy) = f.bbox.center();
        if rb.contains(cx, cy) {
            let better = match best_inside {
                Some(j) => f.score > faces[j].score,
                None => true,
            };
            if better {
                best_inside = Some(i);
            }
        }
    }
    if best_inside.is_some() {
        return best_inside;
    }

    // 扩展框兜底
    let expanded = expand_square_box(&rb, u32::MAX, u32::MAX, REGION_EXPAND_SCALE, 1.0)?;
    let (rcx, rcy) = rb.center();
    let mut best: Option<(usize, f32)> = None;
    for (i, f) in faces.iter().enumerate() {
        if used[i] {
            continue;
        }
        let (cx, cy) = f.bbox.center();
        if !expanded.contains(cx, cy) {
            continue;
        }
        let d = ((cx - rcx).powi(2) + (cy - rcy).powi(2)).sqrt();
        let better = match best {
            Some((j, bd)) => d < bd || (d == bd && f.score > faces[j].score),
            None => true,
        };
        if better {
            best = Some((i, d));
        }
    }
    best.map(|(i, _)| i)
}

/// 把一组选区绑定到检测，返回 (选区下标, 检测下标)。
/// 一个检测最多服务一个选区；绑不上的选区不出现在结果里。
pub fn bind_regions(regions: &[Region], faces: &[DetectedFace]) -> Vec<(usize, usize)> {
    let mut used = vec![false; faces.len()];
    let mut out = Vec::new();
    for (ri, region) in regions.iter().enumerate() {
        if let Some(di) = bind_region(region, faces, &used) {
            used[di] = true;
            out.push((ri, di));
        }
    }
    out
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
    fn normalize_clamps_and_drops() {
        let regions = vec![
            Region::new(-10, -10, 50, 50),
            Region::new(580, 430, 100, 100),
            Region::new(10, 10, 0, 20), // 非法，被丢弃
        ];
        let out = normalize_regions(&regions, 640, 480);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].x, out[0].y), (0, 0));
        assert_eq!(out[1].x + out[1].width, 640);
        assert_eq!(out[1].y + out[1].height, 480);
    }

    #[test]
    fn bound_regions_require_source_id() {
        let mut tagged = Region::new(10, 10, 50, 50);
        tagged.face_source_id = Some("a".into());
        let regions = vec![tagged, Region::new(100, 100, 50, 50)];
        let out = normalize_bound_regions(&regions, 640, 480);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].face_source_id.as_deref(), Some("a"));
    }

    #[test]
    fn detections_become_deduped_square_regions() {
        let faces = vec![
            face(100.0, 100.0, 200.0, 200.0, 0.9),
            face(102.0, 104.0, 198.0, 196.0, 0.8), // 与第一个几乎重合
            face(400.0, 120.0, 480.0, 220.0, 0.7),
        ];
        let regions = detections_to_regions(&faces, 640, 480);
        assert_eq!(regions.len(), 2);
        for r in &regions {
            assert_eq!(r.width, r.height);
            assert!(r.width >= 48);
        }
        // 按 (y, x) 排序
        assert!(regions[0].y <= regions[1].y);
    }

    #[test]
    fn small_detection_is_rejected() {
        let faces = vec![face(10.0, 10.0, 30.0, 30.0, 0.9)];
        assert!(detections_to_regions(&faces, 640, 480).is_empty());
    }

    #[test]
    fn bind_prefers_center_inside_with_higher_score() {
        let region = Region::new(100, 100, 200, 200);
        let faces = vec![
            face(120.0, 120.0, 180.0, 180.0, 0.6),
            face(200.0, 200.0, 280.0, 280.0, 0.9),
            face(500.0, 500.0, 560.0, 560.0, 0.95), // 中心在区外
        ];
        let used = vec![false; 3];
        assert_eq!(bind_region(&region, &faces, &used), Some(1));
    }

    #[test]
    fn bind_falls_back_to_nearest_in_expanded_box() {
        let region = Region::new(100, 100, 100, 100);
        // 中心 (150, 150)，扩展框半边 67.5：检测中心 (210, 150) 在扩展框内
        let faces = vec![face(190.0, 130.0, 230.0, 170.0, 0.8)];
        let used = vec![false; 1];
        assert_eq!(bind_region(&region, &faces, &used), Some(0));
    }

    #[test]
    fn bind_reports_no_face_when_all_far() {
        let region = Region::new(0, 0, 100, 100);
        let faces = vec![face(400.0, 400.0, 500.0, 500.0, 0.99)];
        let used = vec![false; 1];
        assert_eq!(bind_region(&region, &faces, &used), None);
    }

    #[test]
    fn bind_regions_assigns_each_detection_once() {
        let r1 = Region::new(100, 100, 100, 100);
        let r2 = Region::new(110, 110, 100, 100); // 与 r1 重叠
        let faces = vec![face(120.0, 120.0, 180.0, 180.0, 0.9)];
        let pairs = bind_regions(&[r1, r2], &faces);
        assert_eq!(pairs, vec![(0, 0)]);
    }

    #[test]
    fn region_serde_uses_camel_case_source_id() {
        let mut r = Region::new(1, 2, 3, 4);
        r.face_source_id = Some("s1".into());
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"faceSourceId\":\"s1\""));
        let back: Region = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        // 无 id 时字段省略
        let bare = serde_json::to_string(&Region::new(1, 2, 3, 4)).unwrap();
        assert!(!bare.contains("faceSourceId"));
    }
}
