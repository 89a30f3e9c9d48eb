use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::engine::{FaceSource, ResolvedBinding, SwapEngine};
use crate::error::SwapError;
use crate::region::region::Region;
use crate::utils::process_img::{
    encode_image, is_supported_image_ext, output_image_path, output_video_path, read_image,
    read_image_bytes, write_image,
};
use crate::video::video::{self, SwapPlan, VideoDetection, VideoSwapJob};

/// 任务状态机：queued → running → {succeeded | failed | cancelled}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// 轮询得到的任务快照（任务协议的响应体）
#[derive(Clone, Debug, Serialize)]
pub struct TaskStatus {
    pub status: TaskState,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f32>,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
}

/// ETA 吞吐窗口的样本数
const ETA_WINDOW: usize = 30;

/// 任务的共享控制块：取消标志 + 进度 + 阶段标签。
/// 流水线在解码、worker、写出三处轮询取消标志，取消是合作式的。
pub struct TaskControl {
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
    progress: Mutex<f32>,
    eta_seconds: Mutex<Option<f32>>,
    stage: Mutex<String>,
    error_code: Mutex<Option<String>>,
    output_path: Mutex<Option<PathBuf>>,
    window: Mutex<VecDeque<(Instant, usize)>>,
}

impl TaskControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            state: Mutex::new(TaskState::Queued),
            progress: Mutex::new(0.0),
            eta_seconds: Mutex::new(None),
            stage: Mutex::new(String::from("queued")),
            error_code: Mutex::new(None),
            output_path: Mutex::new(None),
            window: Mutex::new(VecDeque::new()),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn set_stage(&self, stage: &str) {
        *self.stage.lock() = stage.to_string();
    }

    pub fn set_progress(&self, progress: f32) {
        *self.progress.lock() = progress.clamp(0.0, 100.0);
    }

    /// worker 每处理完一帧上报一次。进度 = processed/total·100；
    /// ETA 按最近窗口的平均吞吐估计
    pub fn report_frame(&self, processed: usize, estimated_total: usize) {
        if estimated_total > 0 {
            self.set_progress(processed as f32 / estimated_total as f32 * 100.0);
        }
        let mut window = self.window.lock();
        window.push_back((Instant::now(), processed));
        while window.len() > ETA_WINDOW {
            window.pop_front();
        }
        if estimated_total > processed && window.len() >= 2 {
            let (t0, p0) = window[0];
            let (t1, p1) = window[window.len() - 1];
            let dt = t1.duration_since(t0).as_secs_f32();
            if dt > 0.0 && p1 > p0 {
                let fps = (p1 - p0) as f32 / dt;
                *self.eta_seconds.lock() = Some((estimated_total - processed) as f32 / fps);
            }
        }
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }

    fn finish_success(&self, output: PathBuf) {
        *self.output_path.lock() = Some(output);
        *self.eta_seconds.lock() = None;
        self.set_progress(100.0);
        self.set_state(TaskState::Succeeded);
    }

    fn finish_cancelled(&self) {
        *self.error_code.lock() = Some("cancelled".into());
        *self.eta_seconds.lock() = None;
        self.set_state(TaskState::Cancelled);
    }

    fn finish_failed(&self, code: &str) {
        *self.error_code.lock() = Some(code.to_string());
        *self.eta_seconds.lock() = None;
        self.set_state(TaskState::Failed);
    }

    pub fn snapshot(&self) -> TaskStatus {
        TaskStatus {
            status: *self.state.lock(),
            progress: *self.progress.lock(),
            eta_seconds: *self.eta_seconds.lock(),
            stage: self.stage.lock().clone(),
            error_code: self.error_code.lock().clone(),
            output_path: self.output_path.lock().clone(),
        }
    }
}

/// 异步任务句柄：轮询进度、取消、等待结果
pub struct TaskHandle {
    ctrl: Arc<TaskControl>,
    join: Mutex<Option<JoinHandle<Result<PathBuf, SwapError>>>>,
}

impl TaskHandle {
    pub fn progress(&self) -> TaskStatus {
        self.ctrl.snapshot()
    }

    /// 合作式取消：流水线最多再处理每个 worker 一个在途帧
    pub fn cancel(&self) {
        self.ctrl.cancel();
    }

    /// 阻塞等待任务结束。再次调用时根据终态重建结果。
    pub fn await_result(&self) -> Result<PathBuf, SwapError> {
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            return match handle.join() {
                Ok(result) => result,
                Err(_) => Err(SwapError::SwapFailed("任务线程崩溃".into())),
            };
        }
        let status = self.ctrl.snapshot();
        match status.status {
            TaskState::Succeeded => status
                .output_path
                .ok_or(SwapError::VideoOutputMissing),
            TaskState::Cancelled => Err(SwapError::Cancelled),
            _ => Err(SwapError::SwapFailed(
                status.error_code.unwrap_or_else(|| "unknown".into()),
            )),
        }
    }
}

/// 启动任务线程并接管状态迁移
fn run_task<F>(ctrl: Arc<TaskControl>, body: F) -> TaskHandle
where
    F: FnOnce(&TaskControl) -> Result<PathBuf, SwapError> + Send + 'static,
{
    let thread_ctrl = ctrl.clone();
    let join = std::thread::spawn(move || {
        thread_ctrl.set_state(TaskState::Running);
        let result = body(&thread_ctrl);
        match &result {
            Ok(path) => thread_ctrl.finish_success(path.clone()),
            Err(SwapError::Cancelled) => thread_ctrl.finish_cancelled(),
            Err(e) => thread_ctrl.finish_failed(e.code()),
        }
        result
    });
    TaskHandle {
        ctrl,
        join: Mutex::new(Some(join)),
    }
}

/// 多源绑定（任务协议里的一项）
#[derive(Clone, Debug, Deserialize)]
pub struct BindingSpec {
    #[serde(rename = "faceSourceId")]
    pub face_source_id: String,
    #[serde(rename = "faceImage")]
    pub face_image: PathBuf,
    #[serde(default)]
    pub region: Option<Region>,
}

/// 任务请求：`{id, subject, target | bindings, regions?, key_frame_ms?, use_accelerator?}`
#[derive(Debug, Deserialize)]
pub struct SwapRequest {
    pub id: String,
    pub subject: PathBuf,
    #[serde(default)]
    pub target: Option<PathBuf>,
    #[serde(default)]
    pub bindings: Option<Vec<BindingSpec>>,
    #[serde(default)]
    pub regions: Option<Vec<Region>>,
    #[serde(default)]
    pub key_frame_ms: Option<f64>,
    #[serde(default)]
    pub use_accelerator: Option<bool>,
    #[serde(default)]
    pub enhance: Option<bool>,
    /// 贴回阶段颜色迁移的混合比例，缺省 0.5
    #[serde(default)]
    pub color_blend: Option<f32>,
}

/// 无头任务 API：任何外壳（桌面 / Web / CLI）都通过它驱动核心。
///
/// CPU 引擎在构造时加载；GPU 引擎按需懒加载，初始化失败记一次警告后
/// 永久回退 CPU。模型会话进程级共享。
pub struct FaceSwapService {
    models_dir: PathBuf,
    cpu: Arc<SwapEngine>,
    gpu: Mutex<Option<Arc<SwapEngine>>>,
    gpu_failed: AtomicBool,
}

impl FaceSwapService {
    pub fn new<P: AsRef<Path>>(models_dir: P) -> Result<Self, SwapError> {
        let models_dir = models_dir.as_ref().to_path_buf();
        let cpu = Arc::new(SwapEngine::load(&models_dir, false)?);
        Ok(Self {
            models_dir,
            cpu,
            gpu: Mutex::new(None),
            gpu_failed: AtomicBool::new(false),
        })
    }

    fn engine_for(&self, use_accelerator: bool) -> Arc<SwapEngine> {
        if !use_accelerator || self.gpu_failed.load(Ordering::Acquire) {
            return self.cpu.clone();
        }
        let mut gpu = self.gpu.lock();
        if let Some(engine) = &*gpu {
            return engine.clone();
        }
        match SwapEngine::load(&self.models_dir, true) {
            Ok(engine) => {
                let engine = Arc::new(engine);
                *gpu = Some(engine.clone());
                engine
            }
            Err(e) => {
                warn!("GPU 引擎初始化失败，回退 CPU: {e}");
                self.gpu_failed.store(true, Ordering::Release);
                self.cpu.clone()
            }
        }
    }

    /// 检测图片中的人脸选区（字节输入）
    pub fn detect_faces_in_image(
        &self,
        image_bytes: &[u8],
        areas: Option<&[Region]>,
    ) -> Result<Vec<Region>, SwapError> {
        let img = read_image_bytes(image_bytes)?;
        self.cpu.detect_regions(&img, areas)
    }

    /// 检测图片中的人脸选区（文件输入）
    pub fn detect_faces_in_image_file(
        &self,
        path: &Path,
        areas: Option<&[Region]>,
    ) -> Result<Vec<Region>, SwapError> {
        let img = read_image(path)?;
        self.cpu.detect_regions(&img, areas)
    }

    /// 在视频关键帧上检测人脸选区
    pub fn detect_faces_in_video(
        &self,
        path: &Path,
        key_frame_ms: f64,
        areas: Option<&[Region]>,
    ) -> Result<VideoDetection, SwapError> {
        video::detect_faces_in_video(&self.cpu, path, key_frame_ms, areas)
    }

    /// 静态图换脸，同步执行，输出写到 `<stem>_output.<ext>`，返回实际路径
    pub fn swap_image(&self, req: &SwapRequest) -> Result<PathBuf, SwapError> {
        let subject = read_image(&req.subject)?;
        let engine = self.engine_for(req.use_accelerator.unwrap_or(false));
        let enhance = req.enhance.unwrap_or_else(|| engine.has_enhancer());
        if let Some(blend) = req.color_blend {
            engine.set_color_blend(blend);
        }

        let out = if let Some(bindings) = &req.bindings {
            let resolved = self.resolve_bindings(&engine, bindings)?;
            engine.swap_by_bindings(&subject, &resolved, enhance)?
        } else {
            let target = req.target.as_ref().ok_or(SwapError::MissingFaceSources)?;
            let identity = engine.extract_identity(&read_image(target)?)?;
            match &req.regions {
                Some(regions) if !regions.is_empty() => {
                    engine.swap_regions(&subject, &identity, regions, enhance)?
                }
                _ => engine.swap_largest(&subject, &identity, enhance)?,
            }
        };

        write_image(&out, &output_image_path(&req.subject))
    }

    /// 静态图换脸的字节进出变体：输出沿用输入的编码格式，失败回退 PNG
    pub fn swap_image_bytes(
        &self,
        subject_bytes: &[u8],
        target_bytes: &[u8],
        regions: Option<&[Region]>,
        enhance: Option<bool>,
    ) -> Result<Vec<u8>, SwapError> {
        let format = image::guess_format(subject_bytes)
            .map_err(|_| SwapError::UnsupportedImageFormat)?;
        let subject = read_image_bytes(subject_bytes)?;
        let target = read_image_bytes(target_bytes)?;
        let engine = self.engine_for(false);
        let enhance = enhance.unwrap_or_else(|| engine.has_enhancer());

        let identity = engine.extract_identity(&target)?;
        let out = match regions {
            Some(regions) if !regions.is_empty() => {
                engine.swap_regions(&subject, &identity, regions, enhance)?
            }
            _ => engine.swap_largest(&subject, &identity, enhance)?,
        };
        let (bytes, _) = encode_image(&out, format)?;
        Ok(bytes)
    }

    /// 视频换脸，异步执行。边界校验在任何推理开始之前完成。
    pub fn swap_video(&self, req: &SwapRequest) -> Result<TaskHandle, SwapError> {
        if !req.subject.exists() {
            return Err(SwapError::FileNotFound(req.subject.clone()));
        }
        if !video::is_supported_video_ext(&req.subject) {
            return Err(SwapError::UnsupportedVideoFormat);
        }

        enum PlanSpec {
            Single(PathBuf),
            Multi(Vec<BindingSpec>),
        }

        let plan_spec = if let Some(bindings) = &req.bindings {
            if bindings.is_empty() {
                return Err(SwapError::MissingFaceSources);
            }
            for binding in bindings {
                if !binding.face_image.exists() {
                    return Err(SwapError::FileNotFound(binding.face_image.clone()));
                }
                if !is_supported_image_ext(&binding.face_image) {
                    return Err(SwapError::UnsupportedImageFormat);
                }
                // 视频多源必须有播种选区
                if binding.region.is_none() {
                    return Err(SwapError::InvalidFaceSourceBinding);
                }
            }
            PlanSpec::Multi(bindings.clone())
        } else {
            let target = req.target.clone().ok_or(SwapError::MissingFaceSources)?;
            if !target.exists() {
                return Err(SwapError::FileNotFound(target));
            }
            if !is_supported_image_ext(&target) {
                return Err(SwapError::UnsupportedImageFormat);
            }
            PlanSpec::Single(target)
        };

        let use_accelerator = req.use_accelerator.unwrap_or(false);
        let engine = self.engine_for(use_accelerator);
        let enhance = req.enhance.unwrap_or_else(|| engine.has_enhancer());
        if let Some(blend) = req.color_blend {
            engine.set_color_blend(blend);
        }
        let input = req.subject.clone();
        let output = output_video_path(&req.subject);
        let key_frame_ms = req.key_frame_ms.unwrap_or(0.0);

        let ctrl = TaskControl::new();
        Ok(run_task(ctrl, move |ctrl| {
            ctrl.set_stage("extracting-target-face");
            let plan = match plan_spec {
                PlanSpec::Single(target) => {
                    SwapPlan::Single(engine.extract_identity(&read_image(&target)?)?)
                }
                PlanSpec::Multi(bindings) => {
                    let sources = bindings
                        .iter()
                        .map(|b| {
                            Ok(FaceSource {
                                id: b.face_source_id.clone(),
                                image: read_image(&b.face_image)?,
                            })
                        })
                        .collect::<Result<Vec<_>, SwapError>>()?;
                    let embeddings = engine.resolve_sources(&sources)?;
                    let seed_regions = bindings
                        .iter()
                        .filter_map(|b| {
                            b.region.clone().map(|mut r| {
                                r.face_source_id = Some(b.face_source_id.clone());
                                r
                            })
                        })
                        .collect();
                    SwapPlan::MultiSource {
                        embeddings,
                        seed_regions,
                    }
                }
            };
            let job = VideoSwapJob {
                input,
                output,
                plan,
                key_frame_ms,
                use_accelerator,
                enhance,
            };
            video::process_video(&engine, &job, ctrl)
        }))
    }

    fn resolve_bindings(
        &self,
        engine: &SwapEngine,
        bindings: &[BindingSpec],
    ) -> Result<Vec<ResolvedBinding>, SwapError> {
        let sources = bindings
            .iter()
            .map(|b| {
                Ok(FaceSource {
                    id: b.face_source_id.clone(),
                    image: read_image(&b.face_image)?,
                })
            })
            .collect::<Result<Vec<_>, SwapError>>()?;
        let embeddings = engine.resolve_sources(&sources)?;
        bindings
            .iter()
            .map(|b| {
                let embedding = embeddings
                    .get(&b.face_source_id)
                    .cloned()
                    .ok_or_else(|| SwapError::FaceSourceNotFound(b.face_source_id.clone()))?;
                Ok(ResolvedBinding {
                    face_source_id: b.face_source_id.clone(),
                    embedding,
                    region: b.region.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn task_lifecycle_success() {
        let ctrl = TaskControl::new();
        assert_eq!(ctrl.snapshot().status, TaskState::Queued);
        let handle = run_task(ctrl, |ctrl| {
            ctrl.set_stage("processing-video-frames");
            std::thread::sleep(Duration::from_millis(20));
            Ok(PathBuf::from("/tmp/out.mp4"))
        });
        let result = handle.await_result().unwrap();
        assert_eq!(result, PathBuf::from("/tmp/out.mp4"));
        let status = handle.progress();
        assert_eq!(status.status, TaskState::Succeeded);
        assert_eq!(status.progress, 100.0);
        assert_eq!(status.output_path, Some(PathBuf::from("/tmp/out.mp4")));
        // 二次等待根据终态重建
        assert!(handle.await_result().is_ok());
    }

    #[test]
    fn task_lifecycle_failure_records_code() {
        let handle = run_task(TaskControl::new(), |_| {
            Err(SwapError::VideoOpenFailed("x".into()))
        });
        assert!(handle.await_result().is_err());
        let status = handle.progress();
        assert_eq!(status.status, TaskState::Failed);
        assert_eq!(status.error_code.as_deref(), Some("video-open-failed"));
    }

    #[test]
    fn cancellation_is_prompt() {
        let handle = run_task(TaskControl::new(), |ctrl| {
            // 模拟轮询取消标志的流水线
            for _ in 0..1000 {
                if ctrl.is_cancelled() {
                    return Err(SwapError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(PathBuf::from("/never"))
        });
        std::thread::sleep(Duration::from_millis(30));
        handle.cancel();
        let start = Instant::now();
        assert!(matches!(handle.await_result(), Err(SwapError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(handle.progress().status, TaskState::Cancelled);
        assert_eq!(handle.progress().error_code.as_deref(), Some("cancelled"));
    }

    #[test]
    fn report_frame_updates_progress_and_eta() {
        let ctrl = TaskControl::new();
        ctrl.report_frame(10, 100);
        assert!((ctrl.snapshot().progress - 10.0).abs() < 1e-3);
        std::thread::sleep(Duration::from_millis(10));
        ctrl.report_frame(20, 100);
        let status = ctrl.snapshot();
        assert!((status.progress - 20.0).abs() < 1e-3);
        let eta = status.eta_seconds.expect("应有 ETA");
        assert!(eta > 0.0);
        // 总数未知时进度不变，也没有 ETA 崩溃
        let ctrl2 = TaskControl::new();
        ctrl2.report_frame(5, 0);
        assert_eq!(ctrl2.snapshot().progress, 0.0);
    }

    #[test]
    fn task_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskState::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::to_string(&TaskState::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn swap_request_parses_protocol_shape() {
        let json = r#"{
            "id": "t-1",
            "subject": "/data/clip.mp4",
            "bindings": [
                {"faceSourceId": "a", "faceImage": "/data/alice.png",
                 "region": {"x": 10, "y": 20, "width": 100, "height": 100}}
            ],
            "key_frame_ms": 1500.0,
            "use_accelerator": true,
            "color_blend": 0.35
        }"#;
        let req: SwapRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.id, "t-1");
        assert!(req.target.is_none());
        let bindings = req.bindings.unwrap();
        assert_eq!(bindings[0].face_source_id, "a");
        assert_eq!(bindings[0].region.as_ref().unwrap().width, 100);
        assert_eq!(req.key_frame_ms, Some(1500.0));
        assert_eq!(req.use_accelerator, Some(true));
        assert_eq!(req.color_blend, Some(0.35));
        // 省略时保持默认
        let bare: SwapRequest =
            serde_json::from_str(r#"{"id": "t-2", "subject": "/data/a.png"}"#).unwrap();
        assert!(bare.color_blend.is_none());
    }

    #[test]
    fn task_status_serializes_optional_fields() {
        let ctrl = TaskControl::new();
        ctrl.set_stage("opening-video");
        let json = serde_json::to_string(&ctrl.snapshot()).unwrap();
        assert!(json.contains("\"status\":\"queued\""));
        assert!(json.contains("\"stage\":\"opening-video\""));
        assert!(!json.contains("error_code"));
        assert!(!json.contains("output_path"));
    }
}
