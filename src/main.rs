use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use mirror_rs::task::task::{FaceSwapService, SwapRequest, TaskState};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        bail!("用法: mirror <image|video> <主体文件> <目标人脸图> [模型目录]");
    }
    let mode = args[1].as_str();
    let subject = PathBuf::from(&args[2]);
    let face = PathBuf::from(&args[3]);
    let models_dir = args
        .get(4)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./models"));

    let now = Instant::now();
    let service = FaceSwapService::new(&models_dir).context("模型加载失败")?;
    println!("模型加载完成，耗时 {:?}", now.elapsed());

    let request = SwapRequest {
        id: "cli".into(),
        subject: subject.clone(),
        target: Some(face),
        bindings: None,
        regions: None,
        key_frame_ms: None,
        use_accelerator: None,
        enhance: None,
        color_blend: None,
    };

    match mode {
        "image" => {
            let now = Instant::now();
            let output = service.swap_image(&request)?;
            println!("换脸完成，耗时 {:?}，输出: {}", now.elapsed(), output.display());
        }
        "video" => {
            let now = Instant::now();
            let handle = service.swap_video(&request)?;
            loop {
                let status = handle.progress();
                match status.status {
                    TaskState::Queued | TaskState::Running => {
                        println!(
                            "[{}] {:.1}%{}",
                            status.stage,
                            status.progress,
                            status
                                .eta_seconds
                                .map(|eta| format!("，剩余约 {eta:.0}s"))
                                .unwrap_or_default()
                        );
                        std::thread::sleep(Duration::from_millis(500));
                    }
                    _ => break,
                }
            }
            let output = handle.await_result()?;
            println!("视频换脸完成，耗时 {:?}，输出: {}", now.elapsed(), output.display());
        }
        other => bail!("未知模式: {other}"),
    }

    Ok(())
}
