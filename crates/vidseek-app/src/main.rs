//! VidSeek - indexed frame retrieval driver
//!
//! Runs the random-access or threaded front-end over the synthetic backend
//! and prints what was retrieved as JSON lines.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vidseek_core::{DecodedFrame, SessionConfig};
use vidseek_engine::{FrameRequest, SimpleDecoder, ThreadedDecoder};
use vidseek_media::synthetic::{SyntheticFactory, SyntheticOpener, SyntheticStream};
use vidseek_media::{Codec, ContainerFormat};

const SOURCE: &str = "synthetic";

#[derive(Parser)]
#[command(name = "vidseek", version, about = "Retrieve decoded frames by index")]
struct Cli {
    /// JSON session configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    stream: StreamArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StreamArgs {
    /// Frames in the synthetic stream
    #[arg(long, default_value_t = 240, global = true)]
    frames: u32,

    /// Key-frame interval
    #[arg(long, default_value_t = 12, global = true)]
    gop: u32,

    /// Consecutive B-frames between anchors
    #[arg(long, default_value_t = 2, global = true)]
    b_frames: u32,

    #[arg(long, value_enum, default_value_t = ContainerArg::Mov, global = true)]
    container: ContainerArg,

    #[arg(long, value_enum, default_value_t = CodecArg::H264, global = true)]
    codec: CodecArg,

    /// Container has no seek index
    #[arg(long, global = true)]
    not_seekable: bool,

    /// Trailing B-frames reference the next GOP
    #[arg(long, global = true)]
    open_gop: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch frames by display index
    Random {
        /// Comma-separated indices, returned in this order
        #[arg(long, value_delimiter = ',', conflicts_with = "batch")]
        indices: Vec<u32>,

        /// Fetch this many consecutive frames instead
        #[arg(long)]
        batch: Option<usize>,

        /// First frame of the batch
        #[arg(long, default_value_t = 0)]
        start: u32,

        /// Also print the full-scan metadata
        #[arg(long)]
        scan: bool,
    },
    /// Stream the whole source through the background decoder
    Threaded {
        #[arg(long, default_value_t = 8)]
        batch: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ContainerArg {
    Mov,
    Matroska,
    Flv,
    Mpegts,
    Avi,
}

impl From<ContainerArg> for ContainerFormat {
    fn from(arg: ContainerArg) -> Self {
        match arg {
            ContainerArg::Mov => Self::Mov,
            ContainerArg::Matroska => Self::Matroska,
            ContainerArg::Flv => Self::Flv,
            ContainerArg::Mpegts => Self::MpegTs,
            ContainerArg::Avi => Self::Avi,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CodecArg {
    H264,
    Hevc,
    Av1,
    Vp9,
}

impl From<CodecArg> for Codec {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::H264 => Self::H264,
            CodecArg::Hevc => Self::Hevc,
            CodecArg::Av1 => Self::Av1,
            CodecArg::Vp9 => Self::Vp9,
        }
    }
}

#[derive(Serialize)]
struct FrameLine {
    index: Option<u32>,
    pts: i64,
    width: u32,
    height: u32,
    side_messages: usize,
}

impl From<&DecodedFrame> for FrameLine {
    fn from(frame: &DecodedFrame) -> Self {
        Self {
            index: frame.frame_index,
            pts: frame.pts,
            width: frame.width(),
            height: frame.height(),
            side_messages: frame.side_data.len(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    let stream = SyntheticStream {
        num_frames: cli.stream.frames,
        gop_size: cli.stream.gop,
        b_frames: cli.stream.b_frames,
        codec: cli.stream.codec.into(),
        container: cli.stream.container.into(),
        seekable: !cli.stream.not_seekable,
        open_gop: cli.stream.open_gop,
        ..Default::default()
    };
    if stream.gop_size == 0 {
        bail!("--gop must be at least 1");
    }
    let opener = Arc::new(SyntheticOpener::new().with_stream(SOURCE, stream));
    let factory = Arc::new(SyntheticFactory::new());

    match cli.command {
        Command::Random {
            indices,
            batch,
            start,
            scan,
        } => {
            let config = SessionConfig {
                need_scanned_metadata: scan || config.need_scanned_metadata,
                ..config
            };
            let mut decoder = SimpleDecoder::open(SOURCE, config, opener, factory, None)?;
            print_json(&decoder.metadata()?)?;

            let frames = match batch {
                Some(count) => {
                    decoder.seek_to_index(start)?;
                    decoder.get_batch_frames(count)?
                }
                None => decoder.get(FrameRequest::List(indices))?.into_vec(),
            };
            for frame in &frames {
                print_json(&FrameLine::from(frame))?;
            }
            if scan {
                print_json(&decoder.scanned_metadata()?)?;
            }
            print_json(&decoder.session().engine().stats())?;
            info!(frames = frames.len(), "random access finished");
        }
        Command::Threaded { batch } => {
            let mut decoder = ThreadedDecoder::open(SOURCE, config, opener, factory, None)?;
            print_json(&decoder.metadata()?)?;

            let mut total = 0usize;
            loop {
                let frames = decoder.get_batch_frames(batch)?;
                if frames.is_empty() {
                    break;
                }
                for frame in &frames {
                    print_json(&FrameLine::from(frame))?;
                }
                total += frames.len();
            }
            decoder.end()?;
            info!(frames = total, "threaded decode finished");
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
