use std::path::PathBuf;

use thiserror::Error;

/// 面向调用方的封闭错误集合。
///
/// 每个变体对应任务协议里一个稳定的 `error_code`（见 [`SwapError::code`]），
/// 上层（桌面壳、Web 壳）只依赖错误码做展示与重试决策。
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("unsupported-image-format")]
    UnsupportedImageFormat,
    #[error("unsupported-video-format")]
    UnsupportedVideoFormat,
    #[error("image-decode-failed: {0}")]
    ImageDecodeFailed(String),
    #[error("video-open-failed: {0}")]
    VideoOpenFailed(String),
    #[error("file-not-found: {0}")]
    FileNotFound(PathBuf),
    #[error("no-face-detected")]
    NoFaceDetected,
    #[error("no-face-in-selected-regions")]
    NoFaceInSelectedRegions,
    #[error("missing-face-sources")]
    MissingFaceSources,
    #[error("invalid-face-source-binding")]
    InvalidFaceSourceBinding,
    #[error("face-source-not-found: {0}")]
    FaceSourceNotFound(String),
    #[error("output-write-failed: {0}")]
    OutputWriteFailed(String),
    #[error("video-write-failed: {0}")]
    VideoWriteFailed(String),
    #[error("video-output-missing")]
    VideoOutputMissing,
    #[error("cancelled")]
    Cancelled,
    #[error("model-load-failed: {0}")]
    ModelLoadFailed(String),
    /// 推理阶段的兜底错误。视频单帧出错时会被捕获并原帧直通，
    /// 静态图整图推理失败时才会上抛。
    #[error("swap-failed: {0}")]
    SwapFailed(String),
}

impl SwapError {
    /// 任务协议中使用的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SwapError::UnsupportedImageFormat => "unsupported-image-format",
            SwapError::UnsupportedVideoFormat => "unsupported-video-format",
            SwapError::ImageDecodeFailed(_) => "image-decode-failed",
            SwapError::VideoOpenFailed(_) => "video-open-failed",
            SwapError::FileNotFound(_) => "file-not-found",
            SwapError::NoFaceDetected => "no-face-detected",
            SwapError::NoFaceInSelectedRegions => "no-face-in-selected-regions",
            SwapError::MissingFaceSources => "missing-face-sources",
            SwapError::InvalidFaceSourceBinding => "invalid-face-source-binding",
            SwapError::FaceSourceNotFound(_) => "face-source-not-found",
            SwapError::OutputWriteFailed(_) => "output-write-failed",
            SwapError::VideoWriteFailed(_) => "video-write-failed",
            SwapError::VideoOutputMissing => "video-output-missing",
            SwapError::Cancelled => "cancelled",
            SwapError::ModelLoadFailed(_) => "model-load-failed",
            SwapError::SwapFailed(_) => "swap-failed",
        }
    }
}

impl From<ort::Error> for SwapError {
    fn from(e: ort::Error) -> Self {
        SwapError::SwapFailed(e.to_string())
    }
}

impl From<ndarray::ShapeError> for SwapError {
    fn from(e: ndarray::ShapeError) -> Self {
        SwapError::SwapFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SwapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        // 错误码是对外协议的一部分，枚举变体改名不能改变这里的字符串
        let cases: Vec<(SwapError, &str)> = vec![
            (SwapError::UnsupportedImageFormat, "unsupported-image-format"),
            (SwapError::UnsupportedVideoFormat, "unsupported-video-format"),
            (
                SwapError::ImageDecodeFailed("x".into()),
                "image-decode-failed",
            ),
            (SwapError::VideoOpenFailed("x".into()), "video-open-failed"),
            (SwapError::FileNotFound("a.png".into()), "file-not-found"),
            (SwapError::NoFaceDetected, "no-face-detected"),
            (
                SwapError::NoFaceInSelectedRegions,
                "no-face-in-selected-regions",
            ),
            (SwapError::MissingFaceSources, "missing-face-sources"),
            (
                SwapError::InvalidFaceSourceBinding,
                "invalid-face-source-binding",
            ),
            (
                SwapError::FaceSourceNotFound("1".into()),
                "face-source-not-found",
            ),
            (
                SwapError::OutputWriteFailed("x".into()),
                "output-write-failed",
            ),
            (SwapError::VideoWriteFailed("x".into()), "video-write-failed"),
            (SwapError::VideoOutputMissing, "video-output-missing"),
            (SwapError::Cancelled, "cancelled"),
            (SwapError::ModelLoadFailed("x".into()), "model-load-failed"),
            (SwapError::SwapFailed("x".into()), "swap-failed"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
            // Display 以错误码开头，日志里可直接 grep
            assert!(err.to_string().starts_with(code));
        }
    }
}
