use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::RgbImage;
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture, VideoWriter};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::engine::{largest_face, SwapEngine};
use crate::error::SwapError;
use crate::face_recognition::face_recognition::Embedding;
use crate::region::region::Region;
use crate::task::task::TaskControl;
use crate::video::audio::{finalize_with_audio, ReencodeParams};
use crate::video::tracker::TrackSet;

/// 支持的输入容器格式，编解码能力跟随链接的媒体框架
const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mov", "avi", "mkv", "webm", "m4v"];

/// 码率基准：1080p 对应 4 Mbps，按像素数线性缩放，下限 1 Mbps
const BASE_BITRATE: u64 = 4_000_000;
const MIN_BITRATE: u64 = 1_000_000;

/// 写出线程等待下一帧的单次超时
const WRITER_WAIT: Duration = Duration::from_millis(50);

pub fn is_supported_video_ext(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => VIDEO_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)),
        None => false,
    }
}

/// 视频换脸计划：单源换最大脸，或多源按轨迹分配身份
pub enum SwapPlan {
    Single(Embedding),
    MultiSource {
        embeddings: HashMap<String, Embedding>,
        /// 关键帧上用于播种轨迹的选区（必须带 face_source_id）
        seed_regions: Vec<Region>,
    },
}

pub struct VideoSwapJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub plan: SwapPlan,
    pub key_frame_ms: f64,
    pub use_accelerator: bool,
    pub enhance: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct VideoMeta {
    pub fps: f64,
    pub width: i32,
    pub height: i32,
    pub total_frames: i64,
}

/// 关键帧探测结果（任务协议的 JSON 响应之一）
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetection {
    pub regions: Vec<Region>,
    pub frame_width: i32,
    pub frame_height: i32,
    pub frame_index: i64,
}

enum WorkItem {
    Frame(usize, RgbImage),
    End,
}

enum PlanState {
    Single {
        embedding: Embedding,
    },
    Multi {
        embeddings: HashMap<String, Embedding>,
        tracks: Mutex<TrackSet>,
    },
}

/// 乱序到达的帧按解码序号缓存，写出方按序取走。
/// 上游有界队列已经限制了在途帧数，这里不设上限。
struct OrderedSink {
    frames: Mutex<HashMap<usize, RgbImage>>,
    cond: Condvar,
}

impl OrderedSink {
    fn new() -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, index: usize, frame: RgbImage) {
        self.frames.lock().insert(index, frame);
        self.cond.notify_all();
    }

    /// 取出期望序号的帧；没有就等一个超时窗口再看一次
    fn pop_next(&self, next: usize, timeout: Duration) -> Option<RgbImage> {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.remove(&next) {
            return Some(frame);
        }
        self.cond.wait_for(&mut frames, timeout);
        frames.remove(&next)
    }
}

/// 加速时 2 个 worker（再多只会争抢 GPU），纯 CPU 用 min(6, 核数−1)
pub fn worker_count(use_accelerator: bool) -> usize {
    if use_accelerator {
        2
    } else {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        cores.saturating_sub(1).clamp(1, 6)
    }
}

/// 按像素数从 4 Mbps @ 1080p 线性缩放，下限 1 Mbps
pub fn scaled_bitrate(width: u32, height: u32) -> u32 {
    let pixels = width as u64 * height as u64;
    let reference = 1920u64 * 1080;
    (BASE_BITRATE * pixels / reference).max(MIN_BITRATE) as u32
}

/// 编码器要求偶数尺寸，向上取偶
pub fn even_dimensions(width: i32, height: i32) -> (i32, i32) {
    ((width + 1) & !1, (height + 1) & !1)
}

/// 毫秒 → 帧序号，按 fps 取整并夹到有效范围
pub fn key_frame_index(key_frame_ms: f64, fps: f64, total_frames: i64) -> i64 {
    let mut index = if fps > 0.0 {
        (key_frame_ms.max(0.0) / 1000.0 * fps).round() as i64
    } else {
        0
    };
    if total_frames > 0 {
        index = index.clamp(0, total_frames - 1);
    }
    index.max(0)
}

fn open_capture(path: &Path) -> Result<(VideoCapture, VideoMeta), SwapError> {
    let mut cap = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)
        .map_err(|e| SwapError::VideoOpenFailed(e.to_string()))?;
    if !cap.is_opened().unwrap_or(false) {
        return Err(SwapError::VideoOpenFailed(format!(
            "无法打开视频: {}",
            path.display()
        )));
    }

    let mut fps = cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0);
    if !(fps > 0.0) {
        fps = 25.0;
        warn!("无法获取视频 FPS，使用默认值 {fps}");
    }
    let mut width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32;
    let mut height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32;
    let total_frames = cap.get(videoio::CAP_PROP_FRAME_COUNT).unwrap_or(0.0) as i64;

    if width <= 0 || height <= 0 {
        // 容器没报尺寸，读一帧探测后回到开头
        let mut frame = Mat::default();
        let ok = cap
            .read(&mut frame)
            .map_err(|e| SwapError::VideoOpenFailed(e.to_string()))?;
        if !ok || frame.empty() {
            return Err(SwapError::VideoOpenFailed("无法读取首帧".into()));
        }
        width = frame.cols();
        height = frame.rows();
        seek_to(&mut cap, 0)?;
    }

    Ok((
        cap,
        VideoMeta {
            fps,
            width,
            height,
            total_frames,
        },
    ))
}

fn seek_to(cap: &mut VideoCapture, index: i64) -> Result<(), SwapError> {
    cap.set(videoio::CAP_PROP_POS_FRAMES, index as f64)
        .map_err(|e| SwapError::VideoOpenFailed(e.to_string()))?;
    Ok(())
}

fn read_frame_at(cap: &mut VideoCapture, index: i64) -> Result<RgbImage, SwapError> {
    seek_to(cap, index)?;
    let mut mat = Mat::default();
    let ok = cap
        .read(&mut mat)
        .map_err(|e| SwapError::VideoOpenFailed(e.to_string()))?;
    if !ok || mat.empty() {
        return Err(SwapError::VideoOpenFailed(format!("无法读取第 {index} 帧")));
    }
    mat_to_rgb(&mat)
}

/// BGR Mat → RgbImage
fn mat_to_rgb(mat: &Mat) -> Result<RgbImage, SwapError> {
    if mat.channels() != 3 {
        return Err(SwapError::VideoOpenFailed(format!(
            "不支持的帧通道数: {}",
            mat.channels()
        )));
    }
    let owned;
    let mat = if mat.is_continuous() {
        mat
    } else {
        owned = mat
            .try_clone()
            .map_err(|e| SwapError::VideoOpenFailed(e.to_string()))?;
        &owned
    };
    let (w, h) = (mat.cols(), mat.rows());
    let data = mat
        .data_bytes()
        .map_err(|e| SwapError::VideoOpenFailed(e.to_string()))?;
    let mut img = RgbImage::new(w as u32, h as u32);
    for (i, pixel) in img.pixels_mut().enumerate() {
        let o = i * 3;
        pixel.0 = [data[o + 2], data[o + 1], data[o]];
    }
    Ok(img)
}

/// RgbImage → BGR Mat
fn rgb_to_mat(img: &RgbImage) -> Result<Mat, SwapError> {
    let (w, h) = img.dimensions();
    let mut bgr = Vec::with_capacity((w * h * 3) as usize);
    for pixel in img.pixels() {
        bgr.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
    }
    let flat = Mat::from_slice(&bgr).map_err(|e| SwapError::VideoWriteFailed(e.to_string()))?;
    let reshaped = flat
        .reshape(3, h as i32)
        .map_err(|e| SwapError::VideoWriteFailed(e.to_string()))?;
    Ok(reshaped.clone_pointee())
}

/// 写出前把帧统一到编码尺寸
fn normalize_frame(frame: RgbImage, width: u32, height: u32) -> RgbImage {
    if frame.dimensions() == (width, height) {
        return frame;
    }
    imageops::resize(&frame, width, height, FilterType::Triangle)
}

fn tmp_video_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    output.with_file_name(format!("{stem}_video_tmp.mp4"))
}

fn open_writer(path: &Path, fps: f64, w: i32, h: i32) -> Result<(VideoWriter, bool), SwapError> {
    let size = opencv::core::Size::new(w, h);
    let filename = path.to_string_lossy();

    if let Ok(avc1) = VideoWriter::fourcc('a', 'v', 'c', '1') {
        if let Ok(writer) = VideoWriter::new(&filename, avc1, fps, size, true) {
            if writer.is_opened().unwrap_or(false) {
                return Ok((writer, true));
            }
        }
    }

    warn!("H.264 编码器不可用，回退 mp4v，复用阶段再转 H.264");
    let mp4v = VideoWriter::fourcc('m', 'p', '4', 'v')
        .map_err(|e| SwapError::VideoWriteFailed(e.to_string()))?;
    let writer = VideoWriter::new(&filename, mp4v, fps, size, true)
        .map_err(|e| SwapError::VideoWriteFailed(e.to_string()))?;
    if !writer.is_opened().unwrap_or(false) {
        return Err(SwapError::VideoWriteFailed("无法创建输出视频".into()));
    }
    Ok((writer, false))
}

/// 关键帧探测：seek 到指定时间，解码一帧，跑图片检测通路
pub fn detect_faces_in_video(
    engine: &SwapEngine,
    path: &Path,
    key_frame_ms: f64,
    areas: Option<&[Region]>,
) -> Result<VideoDetection, SwapError> {
    if !path.exists() {
        return Err(SwapError::FileNotFound(path.to_path_buf()));
    }
    if !is_supported_video_ext(path) {
        return Err(SwapError::UnsupportedVideoFormat);
    }

    let (mut cap, meta) = open_capture(path)?;
    let frame_index = key_frame_index(key_frame_ms, meta.fps, meta.total_frames);
    let frame = read_frame_at(&mut cap, frame_index)?;
    let regions = engine.detect_regions(&frame, areas)?;
    Ok(VideoDetection {
        regions,
        frame_width: meta.width,
        frame_height: meta.height,
        frame_index,
    })
}

/// 视频换脸流水线：
/// 解码线程 → 有界队列 → N 个处理线程 → 按帧序号的共享缓冲 → 写出线程，
/// 最后把原视频的音轨复用进输出容器。
pub fn process_video(
    engine: &SwapEngine,
    job: &VideoSwapJob,
    ctrl: &TaskControl,
) -> Result<PathBuf, SwapError> {
    ctrl.set_stage("validating-input");
    if !job.input.exists() {
        return Err(SwapError::FileNotFound(job.input.clone()));
    }
    if !is_supported_video_ext(&job.input) {
        return Err(SwapError::UnsupportedVideoFormat);
    }

    ctrl.set_stage("opening-video");
    let (mut cap, meta) = open_capture(&job.input)?;
    ctrl.set_stage("reading-video-metadata");
    info!(
        "视频 {}x{} @ {:.2}fps，总帧数 {}",
        meta.width, meta.height, meta.fps, meta.total_frames
    );

    let n_workers = worker_count(job.use_accelerator);
    let queue_cap = (3 * n_workers).max(5);
    info!("使用 {n_workers} 个处理线程，队列容量 {queue_cap}");

    let plan_state = match &job.plan {
        SwapPlan::Single(embedding) => PlanState::Single {
            embedding: embedding.clone(),
        },
        SwapPlan::MultiSource {
            embeddings,
            seed_regions,
        } => {
            ctrl.set_stage("building-face-tracks");
            let key_index = key_frame_index(job.key_frame_ms, meta.fps, meta.total_frames);
            let key_frame = read_frame_at(&mut cap, key_index)?;
            let detections = engine.detect_faces(&key_frame)?;
            let tracks = TrackSet::seed(seed_regions, &detections);
            if tracks.is_empty() {
                return Err(SwapError::NoFaceInSelectedRegions);
            }
            info!("关键帧 {key_index} 播种了 {} 条轨迹", tracks.len());
            seek_to(&mut cap, 0)?;
            PlanState::Multi {
                embeddings: embeddings.clone(),
                tracks: Mutex::new(tracks),
            }
        }
    };

    let (enc_w, enc_h) = even_dimensions(meta.width, meta.height);
    let video_only = tmp_video_path(&job.output);
    let (mut writer, h264) = open_writer(&video_only, meta.fps, enc_w, enc_h)?;

    ctrl.set_stage("processing-video-frames");

    let (tx, rx) = crossbeam_channel::bounded::<WorkItem>(queue_cap);
    let sink = OrderedSink::new();
    let stop = AtomicBool::new(false);
    let error_slot: Mutex<Option<SwapError>> = Mutex::new(None);
    let decoder_done = AtomicBool::new(false);
    let decoded_total = AtomicUsize::new(0);
    let processed = AtomicUsize::new(0);
    let est_total = meta.total_frames.max(0) as usize;
    let enhance = job.enhance;

    let record_fatal = |err: SwapError| {
        let mut slot = error_slot.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        stop.store(true, Ordering::Release);
    };

    thread::scope(|scope| {
        // 解码线程
        scope.spawn(|| {
            let mut index = 0usize;
            loop {
                if ctrl.is_cancelled() || stop.load(Ordering::Acquire) {
                    break;
                }
                let mut mat = Mat::default();
                let ok = match cap.read(&mut mat) {
                    Ok(ok) => ok,
                    Err(e) => {
                        record_fatal(SwapError::VideoOpenFailed(e.to_string()));
                        break;
                    }
                };
                if !ok || mat.empty() {
                    break;
                }
                match mat_to_rgb(&mat) {
                    Ok(img) => {
                        if tx.send(WorkItem::Frame(index, img)).is_err() {
                            break;
                        }
                        index += 1;
                    }
                    Err(e) => {
                        record_fatal(e);
                        break;
                    }
                }
            }
            decoded_total.store(index, Ordering::Release);
            decoder_done.store(true, Ordering::Release);
            // 每个 worker 一个结束哨兵，确保确定性退出
            for _ in 0..n_workers {
                let _ = tx.send(WorkItem::End);
            }
        });

        // 处理线程
        for _ in 0..n_workers {
            scope.spawn(|| {
                while let Ok(item) = rx.recv() {
                    let WorkItem::Frame(index, frame) = item else {
                        break;
                    };
                    // 取消后快速排空队列，不再推理也不再入列
                    if ctrl.is_cancelled() || stop.load(Ordering::Acquire) {
                        continue;
                    }
                    let out = match process_one_frame(engine, &plan_state, &frame, enhance) {
                        Ok(out) => out,
                        Err(e) => {
                            // 单帧失败原帧直通
                            warn!("第 {index} 帧处理失败，原帧直通: {e}");
                            frame
                        }
                    };
                    sink.push(index, out);
                    let done = processed.fetch_add(1, Ordering::AcqRel) + 1;
                    // 每 5 帧上报一次进度，收尾时另有最终上报
                    if done % 5 == 0 {
                        ctrl.report_frame(done, est_total);
                    }
                }
            });
        }

        // 写出线程：严格按解码序号
        scope.spawn(|| {
            let mut next = 0usize;
            loop {
                if ctrl.is_cancelled() || stop.load(Ordering::Acquire) {
                    break;
                }
                match sink.pop_next(next, WRITER_WAIT) {
                    Some(frame) => {
                        let frame = normalize_frame(frame, enc_w as u32, enc_h as u32);
                        let mat = match rgb_to_mat(&frame) {
                            Ok(mat) => mat,
                            Err(e) => {
                                record_fatal(e);
                                break;
                            }
                        };
                        if let Err(e) = writer.write(&mat) {
                            record_fatal(SwapError::VideoWriteFailed(e.to_string()));
                            break;
                        }
                        next += 1;
                    }
                    None => {
                        if decoder_done.load(Ordering::Acquire)
                            && next >= decoded_total.load(Ordering::Acquire)
                        {
                            break;
                        }
                    }
                }
            }
            let _ = writer.release();
        });
    });

    if ctrl.is_cancelled() {
        let _ = std::fs::remove_file(&video_only);
        return Err(SwapError::Cancelled);
    }
    if let Some(err) = error_slot.lock().take() {
        let _ = std::fs::remove_file(&video_only);
        return Err(err);
    }

    let total = decoded_total.load(Ordering::Acquire);
    info!(
        "视频处理完成: 总帧 {total}, 处理 {}",
        processed.load(Ordering::Acquire)
    );

    // 最终进度上报：估计帧数不可靠时用实际解码帧数
    let final_total = if est_total > 0 { est_total } else { total };
    if final_total > 0 {
        ctrl.report_frame(final_total, final_total);
    }

    ctrl.set_stage("muxing-audio");
    // mp4v 回退时在复用阶段转成 H.264，码率按像素数缩放，I 帧 1 秒一个
    let reencode = (!h264).then(|| ReencodeParams {
        bitrate: scaled_bitrate(enc_w as u32, enc_h as u32),
        gop: meta.fps.round().max(1.0) as u32,
    });
    finalize_with_audio(&job.input, &video_only, &job.output, reencode)?;

    ctrl.set_stage("finalizing");
    if !job.output.exists() {
        return Err(SwapError::VideoOutputMissing);
    }
    ctrl.set_progress(100.0);
    Ok(job.output.clone())
}

fn process_one_frame(
    engine: &SwapEngine,
    plan: &PlanState,
    frame: &RgbImage,
    enhance: bool,
) -> Result<RgbImage, SwapError> {
    match plan {
        PlanState::Single { embedding } => {
            let Some(face) = largest_face(engine.detect_faces(frame)?) else {
                return Ok(frame.clone());
            };
            let mut out = engine.swap_face(frame, &face, embedding)?;
            if enhance {
                out = engine.enhance_face(&out, &face)?;
            }
            Ok(out)
        }
        PlanState::Multi {
            embeddings,
            tracks,
        } => {
            // 每帧只检测一次；换脸之后不再重新检测，
            // 后续匹配全部基于本帧这一次的检测结果
            let detections = engine.detect_faces(frame)?;
            let matches = tracks.lock().update(&detections);
            let mut out = frame.clone();
            for (source_id, di) in matches {
                let Some(embedding) = embeddings.get(&source_id) else {
                    continue;
                };
                let face = &detections[di];
                match engine.swap_face(&out, face, embedding) {
                    Ok(swapped) => {
                        out = swapped;
                        if enhance {
                            out = engine.enhance_face(&out, face)?;
                        }
                    }
                    Err(e) => warn!("轨迹 {source_id} 换脸失败: {e}"),
                }
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn bitrate_scales_with_pixels() {
        assert_eq!(scaled_bitrate(1920, 1080), 4_000_000);
        assert_eq!(scaled_bitrate(3840, 2160), 16_000_000);
        // 720p ≈ 4 Mbps · (1280·720)/(1920·1080)
        assert_eq!(scaled_bitrate(1280, 720), 1_777_777);
        // 下限 1 Mbps
        assert_eq!(scaled_bitrate(320, 240), 1_000_000);
    }

    #[test]
    fn dimensions_round_up_to_even() {
        assert_eq!(even_dimensions(1920, 1080), (1920, 1080));
        assert_eq!(even_dimensions(1919, 1079), (1920, 1080));
        assert_eq!(even_dimensions(1, 1), (2, 2));
    }

    #[test]
    fn key_frame_index_is_clamped() {
        assert_eq!(key_frame_index(0.0, 25.0, 125), 0);
        assert_eq!(key_frame_index(2000.0, 25.0, 125), 50);
        // 超过末尾夹到最后一帧
        assert_eq!(key_frame_index(100_000.0, 25.0, 125), 124);
        // 负数毫秒当 0 处理
        assert_eq!(key_frame_index(-500.0, 25.0, 125), 0);
        // 总帧数未知时不夹上界
        assert_eq!(key_frame_index(4000.0, 30.0, 0), 120);
    }

    #[test]
    fn worker_count_policy() {
        assert_eq!(worker_count(true), 2);
        let cpu = worker_count(false);
        assert!((1..=6).contains(&cpu));
    }

    #[test]
    fn video_extension_allowlist() {
        assert!(is_supported_video_ext(Path::new("a.mp4")));
        assert!(is_supported_video_ext(Path::new("a.MKV")));
        assert!(is_supported_video_ext(Path::new("a.webm")));
        assert!(!is_supported_video_ext(Path::new("a.wmv")));
        assert!(!is_supported_video_ext(Path::new("a")));
    }

    #[test]
    fn tmp_path_derives_from_output() {
        assert_eq!(
            tmp_video_path(Path::new("/tmp/clip_output.mp4")),
            PathBuf::from("/tmp/clip_output_video_tmp.mp4")
        );
    }

    #[test]
    fn normalize_frame_resizes_only_when_needed() {
        let frame = RgbImage::from_pixel(10, 10, Rgb([1, 2, 3]));
        let same = normalize_frame(frame.clone(), 10, 10);
        assert_eq!(same.dimensions(), (10, 10));
        let resized = normalize_frame(frame, 20, 16);
        assert_eq!(resized.dimensions(), (20, 16));
    }

    /// 帧以任意顺序到达，写出方必须按解码序号取走（解码序 k 写在位置 k）
    #[test]
    fn ordered_sink_delivers_in_decode_order() {
        let sink = OrderedSink::new();
        let order = [3usize, 0, 4, 1, 2, 6, 5];
        thread::scope(|scope| {
            scope.spawn(|| {
                for &i in &order {
                    sink.push(i, RgbImage::from_pixel(1, 1, Rgb([i as u8, 0, 0])));
                    thread::sleep(Duration::from_millis(2));
                }
            });
            scope.spawn(|| {
                for expected in 0..order.len() {
                    // 单次 50ms 超时可能空手而归，循环等到拿到为止
                    let frame = loop {
                        if let Some(frame) = sink.pop_next(expected, Duration::from_millis(50)) {
                            break frame;
                        }
                    };
                    assert_eq!(frame.get_pixel(0, 0)[0], expected as u8);
                }
            });
        });
    }

    #[test]
    fn ordered_sink_timeout_returns_none() {
        let sink = OrderedSink::new();
        sink.push(5, RgbImage::new(1, 1));
        assert!(sink.pop_next(0, Duration::from_millis(10)).is_none());
        assert!(sink.pop_next(5, Duration::from_millis(10)).is_some());
    }
}
