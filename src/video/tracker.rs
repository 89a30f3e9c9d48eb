use crate::face_detect::face_detect::DetectedFace;
use crate::geometry::geometry::BBox;
use crate::region::region::{bind_regions, Region};

/// 轨迹连续丢失超过该帧数即删除
pub const MAX_MISSED_FRAMES: u32 = 45;
/// IoU 匹配的最低门槛
const MATCH_IOU_MIN: f32 = 0.05;
/// 中心距离兜底的上限：轨迹框对角线的倍数
const CENTROID_FALLBACK_FRAC: f32 = 0.65;

/// 跨帧身份锚：最后一次命中的框 + 绑定的人脸来源
#[derive(Clone, Debug)]
pub struct FaceTrack {
    pub track_id: u32,
    pub face_source_id: String,
    pub last_bbox: BBox,
    pub missed_frames: u32,
}

/// 活动轨迹集合。
/// 轨迹只在关键帧播种，掉线后重新出现的人脸不会得到新轨迹，
/// 没有绑定的人脸一律直通。
pub struct TrackSet {
    tracks: Vec<FaceTrack>,
}

impl TrackSet {
    /// 关键帧上按选区绑定规则播种：每个带 face_source_id 的选区
    /// 绑定一个检测，一个检测最多被一个选区占用
    pub fn seed(regions: &[Region], detections: &[DetectedFace]) -> TrackSet {
        let mut tracks = Vec::new();
        let mut next_id = 1u32;
        for (ri, di) in bind_regions(regions, detections) {
            let Some(source_id) = regions[ri].face_source_id.clone() else {
                continue;
            };
            tracks.push(FaceTrack {
                track_id: next_id,
                face_source_id: source_id,
                last_bbox: detections[di].bbox,
                missed_frames: 0,
            });
            next_id += 1;
        }
        TrackSet { tracks }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn tracks(&self) -> &[FaceTrack] {
        &self.tracks
    }

    /// 一帧的匹配与更新，返回 (face_source_id, 检测下标)。
    ///
    /// 先按 IoU ≥ 0.05 的候选对降序贪心匹配，剩余轨迹用最近中心距离
    /// 兜底（上限 0.65 × 轨迹框对角线）。命中的轨迹更新 last_bbox 并
    /// 清零 missed_frames，未命中的加一，超过 45 帧删除。
    pub fn update(&mut self, detections: &[DetectedFace]) -> Vec<(String, usize)> {
        let mut matched_track = vec![false; self.tracks.len()];
        let mut matched_det = vec![false; detections.len()];
        let mut matches: Vec<(usize, usize)> = Vec::new();

        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let iou = track.last_bbox.iou(&det.bbox);
                if iou > MATCH_IOU_MIN {
                    candidates.push((iou, ti, di));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        for (_, ti, di) in candidates {
            if matched_track[ti] || matched_det[di] {
                continue;
            }
            matched_track[ti] = true;
            matched_det[di] = true;
            matches.push((ti, di));
        }

        // 中心距离兜底
        for (ti, track) in self.tracks.iter().enumerate() {
            if matched_track[ti] {
                continue;
            }
            let max_dist = track.last_bbox.diagonal() * CENTROID_FALLBACK_FRAC;
            let mut best: Option<(usize, f32)> = None;
            for (di, det) in detections.iter().enumerate() {
                if matched_det[di] {
                    continue;
                }
                let dist = track.last_bbox.center_distance(&det.bbox);
                if dist <= max_dist && best.map_or(true, |(_, bd)| dist < bd) {
                    best = Some((di, dist));
                }
            }
            if let Some((di, _)) = best {
                matched_track[ti] = true;
                matched_det[di] = true;
                matches.push((ti, di));
            }
        }

        let mut out = Vec::with_capacity(matches.len());
        for &(ti, di) in &matches {
            self.tracks[ti].last_bbox = detections[di].bbox;
            self.tracks[ti].missed_frames = 0;
            out.push((self.tracks[ti].face_source_id.clone(), di));
        }
        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if !matched_track[ti] {
                track.missed_frames += 1;
            }
        }
        self.tracks
            .retain(|t| t.missed_frames <= MAX_MISSED_FRAMES);

        out
    }
}
