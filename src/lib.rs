//! 离线图片/视频换脸核心。
//!
//! 四阶段推理流水线（SCRFD 检测 → ArcFace 识别 → InSwapper 换脸 →
//! 可选 GFPGAN 增强），加上视频多线程引擎、身份轨迹、音轨复用和
//! 无头任务 API。所有外壳（桌面 / Web / CLI）都通过
//! [`task::task::FaceSwapService`] 驱动。

pub mod engine;
pub mod error;
pub mod face_detect;
pub mod face_recognition;
pub mod face_swapper;
pub mod frame;
pub mod geometry;
pub mod region;
pub mod session;
pub mod task;
pub mod utils;
pub mod video;

pub use error::SwapError;
pub use task::task::{FaceSwapService, SwapRequest, TaskHandle, TaskState, TaskStatus};
