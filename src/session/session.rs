use std::path::{Path, PathBuf};

use ort::execution_providers::ExecutionProviderDispatch;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use tracing::{info, warn};

use crate::error::SwapError;

/// 逻辑模型名，按名字从模型目录加载
pub const DETECTOR_MODEL: &str = "scrfd_2.5g.onnx";
pub const EMBEDDER_MODEL: &str = "arcface_w600k_r50.onnx";
pub const SWAPPER_MODEL: &str = "inswapper_128_fp16.onnx";
pub const ENHANCER_MODEL: &str = "gfpgan_1.4.onnx";

/// ONNX 会话管理：按逻辑名加载模型，配置执行提供方回退链。
///
/// 请求加速时依次尝试平台加速器（DirectML / CUDA / CoreML），
/// 任何一个失败都只记一条警告并继续往下落，最后回到 XNNPACK，
/// 再不行就是默认 CPU。加速器不可用从不让加载失败。
pub struct SessionManager {
    models_dir: PathBuf,
}

impl SessionManager {
    pub fn new<P: AsRef<Path>>(models_dir: P) -> Self {
        Self {
            models_dir: models_dir.as_ref().to_path_buf(),
        }
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.models_dir.join(name)
    }

    /// 读取模型原始字节（emap 扫描需要在会话之外访问模型文件）
    pub fn model_bytes(&self, name: &str) -> Result<Vec<u8>, SwapError> {
        let path = self.model_path(name);
        std::fs::read(&path).map_err(|e| {
            SwapError::ModelLoadFailed(format!("读取模型 {} 失败: {e}", path.display()))
        })
    }

    /// 加载一个模型会话。`prefer_accelerator` 控制是否先尝试 GPU 类提供方。
    pub fn load(&self, name: &str, prefer_accelerator: bool) -> Result<Session, SwapError> {
        let path = self.model_path(name);
        if !path.exists() {
            return Err(SwapError::ModelLoadFailed(format!(
                "模型文件不存在: {}",
                path.display()
            )));
        }

        let intra_threads = if prefer_accelerator {
            1
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get().min(8))
                .unwrap_or(4)
        };

        if prefer_accelerator {
            for (ep_name, ep) in accelerator_providers() {
                match build_session(&path, Some(ep), intra_threads) {
                    Ok(session) => {
                        info!("模型 {name} 使用 {ep_name} 加速");
                        return Ok(session);
                    }
                    Err(e) => warn!("模型 {name} 的 {ep_name} 提供方不可用: {e}"),
                }
            }
        }

        // CPU 优化后端
        let xnnpack = ort::execution_providers::XNNPACKExecutionProvider::default().build();
        match build_session(&path, Some(xnnpack), intra_threads) {
            Ok(session) => {
                info!("模型 {name} 使用 XNNPACK");
                return Ok(session);
            }
            Err(e) => warn!("模型 {name} 的 XNNPACK 提供方不可用: {e}"),
        }

        // 默认 CPU
        build_session(&path, None, intra_threads)
            .map_err(|e| SwapError::ModelLoadFailed(format!("{name}: {e}")))
            .inspect(|_| info!("模型 {name} 使用默认 CPU"))
    }
}

/// 平台加速器优先级列表
fn accelerator_providers() -> Vec<(&'static str, ExecutionProviderDispatch)> {
    let mut eps: Vec<(&'static str, ExecutionProviderDispatch)> = Vec::new();
    #[cfg(target_os = "macos")]
    eps.push((
        "CoreML",
        ort::execution_providers::CoreMLExecutionProvider::default().build(),
    ));
    #[cfg(target_os = "windows")]
    eps.push((
        "DirectML",
        ort::execution_providers::DirectMLExecutionProvider::default().build(),
    ));
    #[cfg(not(target_os = "macos"))]
    eps.push((
        "CUDA",
        ort::execution_providers::CUDAExecutionProvider::default().build(),
    ));
    eps
}

fn build_session(
    path: &Path,
    ep: Option<ExecutionProviderDispatch>,
    intra_threads: usize,
) -> Result<Session, ort::Error> {
    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?;
    let builder = match ep {
        Some(ep) => builder.with_execution_providers([ep])?,
        None => builder,
    };
    builder.commit_from_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_model_load_failed() {
        let mgr = SessionManager::new("/nonexistent/models");
        let err = mgr.load(DETECTOR_MODEL, false).unwrap_err();
        assert_eq!(err.code(), "model-load-failed");
        let err = mgr.model_bytes(SWAPPER_MODEL).unwrap_err();
        assert_eq!(err.code(), "model-load-failed");
    }

    #[test]
    fn model_path_joins_logical_name() {
        let mgr = SessionManager::new("/opt/models");
        assert_eq!(
            mgr.model_path(ENHANCER_MODEL),
            PathBuf::from("/opt/models/gfpgan_1.4.onnx")
        );
    }
}
