use std::path::Path;
use std::process::Command;

use tracing::{info, warn};

use crate::error::SwapError;

/// mp4v 回退时的重编码参数，保证最终输出仍是 H.264
pub struct ReencodeParams {
    pub bitrate: u32,
    /// I 帧间隔（帧数），取整的 fps 即 1 秒一个关键帧
    pub gop: u32,
}

/// 纯视频文件写完后的终处理：用 ffmpeg 把原容器的音轨复用进最终容器。
///
/// 原视频没有音轨时 `-map 1:a?` 自然落空，输出只有视频轨；
/// 系统里没有 ffmpeg 时直接把纯视频文件改名为最终输出；
/// 复用失败保留纯视频文件并给出非致命警告。
pub fn finalize_with_audio(
    original: &Path,
    video_only: &Path,
    final_output: &Path,
    reencode: Option<ReencodeParams>,
) -> Result<(), SwapError> {
    let tmp = final_output.with_extension("mux_tmp.mp4");

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-i")
        .arg(video_only)
        .arg("-i")
        .arg(original)
        .args(["-map", "0:v:0", "-map", "1:a?"]);
    match &reencode {
        Some(params) => {
            cmd.args(["-c:v", "libx264"])
                .args(["-b:v", &params.bitrate.to_string()])
                .args(["-g", &params.gop.to_string()]);
        }
        None => {
            cmd.args(["-c:v", "copy"]);
        }
    }
    cmd.args(["-c:a", "aac", "-shortest"]).arg(&tmp);

    let output = match cmd.output() {
        Ok(output) => output,
        Err(e) => {
            warn!("未找到 ffmpeg（{e}），输出将没有音轨");
            return rename_into(video_only, final_output);
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .chars()
            .skip(stderr.chars().count().saturating_sub(500))
            .collect();
        warn!("音频复用失败，返回无音轨视频: {tail}");
        let _ = std::fs::remove_file(&tmp);
        return rename_into(video_only, final_output);
    }

    std::fs::rename(&tmp, final_output)
        .map_err(|e| SwapError::VideoWriteFailed(e.to_string()))?;
    let _ = std::fs::remove_file(video_only);
    info!("音频复用完成: {}", final_output.display());
    Ok(())
}

fn rename_into(video_only: &Path, final_output: &Path) -> Result<(), SwapError> {
    std::fs::rename(video_only, final_output)
        .map_err(|e| SwapError::VideoWriteFailed(e.to_string()))
}
