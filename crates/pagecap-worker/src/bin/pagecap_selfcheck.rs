use std::path::Path;
use std::process::Command;

use pagecap_media::{check_tool, find_any_tool, BROWSER_CANDIDATES};
use pagecap_worker::RecorderConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = RecorderConfig::from_env();
    config.validate()?;

    let output_dir = std::env::var("PAGECAP_OUTPUT_DIR").unwrap_or_else(|_| ".".to_string());
    println!("pagecap-selfcheck: starting with output_dir={}", output_dir);

    ensure_output_dir(&output_dir).await?;
    ensure_tool("Xvfb")?;
    ensure_ffmpeg()?;
    if !config.job.disable_audio {
        ensure_tool("pactl")?;
        ensure_tool("pulseaudio")?;
    }
    ensure_browser(config.job.browser_executable.as_deref())?;

    println!("pagecap-selfcheck: ok");
    Ok(())
}

async fn ensure_output_dir<P: AsRef<Path>>(path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path).await?;

    let probe = path.join(".pagecap-selfcheck");
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| anyhow::anyhow!("output dir {} is not writable: {}", path.display(), e))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

fn ensure_tool(name: &str) -> anyhow::Result<()> {
    let path = check_tool(name)?;
    println!("pagecap-selfcheck: {} -> {}", name, path.display());
    Ok(())
}

fn ensure_ffmpeg() -> anyhow::Result<()> {
    let output = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map_err(|e| anyhow::anyhow!("ffmpeg not available: {}", e))?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "ffmpeg -version failed: {:?}",
            output.status
        ));
    }
    Ok(())
}

fn ensure_browser(configured: Option<&Path>) -> anyhow::Result<()> {
    let path = match configured {
        Some(path) if path.is_absolute() => {
            if !path.exists() {
                return Err(anyhow::anyhow!("browser {} does not exist", path.display()));
            }
            path.to_path_buf()
        }
        Some(name) => check_tool(&name.to_string_lossy())?,
        None => find_any_tool(BROWSER_CANDIDATES)?,
    };
    println!("pagecap-selfcheck: browser -> {}", path.display());
    Ok(())
}
