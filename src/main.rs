use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use gbm::AsRaw;
use tracing::{error, info};

use scanout::config::{parse_fourcc, parse_modifier, ModeRequest, Options};
use scanout::core::buffers;
use scanout::core::display;
use scanout::core::frame::{FrameBudget, FrameLoop, LoopExit};
use scanout::core::import::FrameBuffers;
use scanout::core::perf::NullSampler;
use scanout::core::producer::ColorSweep;
use scanout::core::render::EglSetup;
use scanout::core::CommitProtocol;
use scanout::device::Card;

/// Render GPU frames straight onto a display plane through KMS.
#[derive(Debug, Parser)]
#[command(name = "scanout", version)]
struct Cli {
    /// DRM device node (default: first KMS-capable /dev/dri/card*)
    #[arg(short = 'D', long)]
    device: Option<PathBuf>,

    /// Pixel format as a fourcc code, e.g. XR24
    #[arg(short = 'f', long, default_value = "XR24")]
    format: String,

    /// Force a storage-layout modifier ("linear" or a 64-bit value)
    #[arg(short = 'M', long)]
    modifier: Option<String>,

    /// Connector index to drive (default: first connected)
    #[arg(short = 'c', long)]
    connector: Option<usize>,

    /// Mode name to request, e.g. 1920x1080
    #[arg(short = 'm', long)]
    mode: Option<String>,

    /// Vertical refresh for the requested mode (0 = any)
    #[arg(short = 'v', long, default_value_t = 0)]
    vrefresh: u32,

    /// Number of frames to render (0 = until interrupted)
    #[arg(short = 'n', long, default_value_t = 0)]
    frames: u32,

    /// Use the atomic commit protocol
    #[arg(short = 'A', long)]
    atomic: bool,

    /// Render into a fixed buffer pool instead of a swap-chain surface
    #[arg(short = 'S', long)]
    surfaceless: bool,

    /// Request asynchronous (non-vsynced) page flips
    #[arg(short = 'a', long)]
    async_flip: bool,
}

impl Cli {
    fn into_options(self) -> Result<Options> {
        let format = parse_fourcc(&self.format)
            .map_err(|e| anyhow::anyhow!("invalid --format: {e}"))?;
        let modifier = self
            .modifier
            .as_deref()
            .map(parse_modifier)
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid --modifier: {e}"))?;
        Ok(Options {
            device: self.device,
            format,
            modifier,
            connector: self.connector,
            mode: self.mode.map(|name| ModeRequest {
                name,
                vrefresh: self.vrefresh,
            }),
            frames: self.frames,
            atomic: self.atomic,
            surfaceless: self.surfaceless,
            async_flip: self.async_flip,
        })
    }
}

fn run(opts: Options) -> Result<LoopExit> {
    let card = Card::open_or_scan(opts.device.as_deref())?;
    let target = display::resolve(&card, &opts)?;

    let gbm = gbm::Device::new(card.clone()).context("failed to create GBM device")?;
    let mut egl = EglSetup::new(gbm.as_raw() as *mut _, opts.format)?;

    // A forced modifier bypasses negotiation entirely.
    let negotiated = match opts.modifier {
        Some(_) => Vec::new(),
        None => egl.negotiate_layouts(&target.layouts, opts.format),
    };
    let candidates = buffers::modifier_candidates(opts.modifier, &negotiated);

    let allocation = buffers::allocate(
        &gbm,
        target.width(),
        target.height(),
        opts.format,
        &candidates,
        opts.surfaceless,
    )?;

    let ctx = egl.into_context(&allocation)?;
    let mut frame_buffers = FrameBuffers::prepare(&card, &ctx, allocation, opts.format)?;

    let mut commit = if opts.atomic {
        let plane = target
            .plane
            .context("atomic path resolved without a plane")?;
        CommitProtocol::new_atomic(plane, opts.async_flip)
    } else {
        CommitProtocol::new_legacy(opts.async_flip)
    };

    let mut producer = ColorSweep::new(target.width(), target.height());
    let mut sampler = NullSampler;

    FrameLoop {
        card: &card,
        target: &target,
        render: &ctx,
        buffers: &mut frame_buffers,
        commit: &mut commit,
        producer: &mut producer,
        sampler: &mut sampler,
        budget: FrameBudget::new(opts.frames),
        format: opts.format,
    }
    .run()
    .map_err(Into::into)
}

fn main() {
    // Default log level to info, crate debug
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,scanout=debug");
    }
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S".to_string(),
        ))
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = match Cli::parse().into_options() {
        Ok(opts) => opts,
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    };

    match run(opts) {
        Ok(exit) => info!("Done ({exit:?})"),
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    }
}
