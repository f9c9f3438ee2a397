use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use render_bus::{CpuTransform, Frame, MediaBackend, MediaSession, PipelineConfig};
use tokio_util::sync::CancellationToken;

mod config;

#[derive(Parser, Debug)]
#[command(name = "derot", version, about = "Remove camera rotation from coded video")]
struct Cli {
    /// Render workers, clamped to 1..=6 and the available cores.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Render on the async runtime instead of a worker pool.
    #[arg(long, global = true, default_value_t = false)]
    inline: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print stream information.
    Probe {
        input: String,
    },
    /// Estimate crop, block size and orientation.
    Analyze {
        input: String,
        /// Starting render config (JSON).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Where to write the calibrated config.
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// Render one frame as JPEG.
    Preview {
        input: String,
        /// Position in seconds.
        #[arg(long, default_value_t = 0.0)]
        at: f64,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "preview.jpg")]
        out: PathBuf,
        /// Save the decoded frame without rendering.
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
    /// Render and re-encode the input.
    Encode {
        input: String,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output directory, defaults to DEROT_OUTPUT_DIR or the working directory.
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("derot", log::LevelFilter::Info)
        .filter_module("render_bus", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[cfg(feature = "ffmpeg")]
fn backend() -> anyhow::Result<Arc<dyn MediaBackend>> {
    render_bus::av::init()?;
    Ok(Arc::new(render_bus::av::AvBackend::new()))
}

#[cfg(not(feature = "ffmpeg"))]
fn backend() -> anyhow::Result<Arc<dyn MediaBackend>> {
    anyhow::bail!("built without the `ffmpeg` feature, no media backend available")
}

fn pipeline(cli: &Cli) -> PipelineConfig {
    let mut pipeline = render_bus::pipeline_config().clone();
    if let Some(workers) = cli.workers {
        pipeline.workers = workers;
    }
    pipeline.inline = cli.inline;
    pipeline
}

fn write_jpeg(frame: &Frame, path: &Path, quality: u8) -> anyhow::Result<()> {
    let width = u16::try_from(frame.width()).context("frame too wide for jpeg")?;
    let height = u16::try_from(frame.height()).context("frame too tall for jpeg")?;
    let encoder = jpeg_encoder::Encoder::new_file(path, quality)
        .with_context(|| format!("create '{}'", path.display()))?;
    encoder
        .encode(frame.data(), width, height, jpeg_encoder::ColorType::Rgba)
        .with_context(|| format!("write jpeg '{}'", path.display()))
}

/// Cancels `token` on ctrl-c until the token is cancelled some other way.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {},
            _ = tokio::signal::ctrl_c() => {
                log::warn!("interrupted, cancelling");
                token.cancel();
            },
        }
    });
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let pipeline = pipeline(&cli);
    let mut session = MediaSession::new(backend()?, Arc::new(CpuTransform::new()), pipeline);

    match cli.cmd {
        Command::Probe { input } => {
            let info = session.open(&input)?;
            print!("{}", info);
            if let Some(fps) = info.average_fps() {
                println!("fps={:.3}", fps);
            }
        }
        Command::Analyze {
            input,
            config,
            write,
        } => {
            let mut render = config::load_render_config(config.as_deref())?;
            session.open(&input)?;
            cancel_on_ctrl_c(session.cancel_token());
            let calibration = session.analyze(&mut render).await?;
            println!("{}", serde_json::to_string_pretty(&calibration)?);
            if let Some(path) = write {
                config::save_render_config(&path, &render)?;
                log::info!("calibrated config written to {}", path.display());
            }
        }
        Command::Preview {
            input,
            at,
            config,
            out,
            raw,
        } => {
            let render = config::load_render_config(config.as_deref())?;
            session.open(&input)?;
            let preview = session.seek_preview(at).await?;
            log::info!("preview at {:.1}s", preview.position_s);
            let frame = if raw {
                preview.frame
            } else {
                session.render_preview(preview.frame, &render).await?.frame
            };
            write_jpeg(&frame, &out, config::config().preview_quality())?;
            println!("{}", out.display());
        }
        Command::Encode {
            input,
            config,
            out_dir,
        } => {
            let render = config::load_render_config(config.as_deref())?;
            session.open(&input)?;
            cancel_on_ctrl_c(session.cancel_token());
            let output = session.encode(&render).await?;

            let dir = out_dir.unwrap_or_else(|| config::config().output_dir().to_path_buf());
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create output dir '{}'", dir.display()))?;
            let path = dir.join(&output.summary.file_name);
            std::fs::write(&path, &output.data)
                .with_context(|| format!("write '{}'", path.display()))?;
            log::info!(
                "{} frames, {} bytes ({})",
                output.summary.frames,
                output.summary.bytes,
                output.summary.container
            );
            println!("{}", path.display());
        }
    }
    session.close();
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
