mod progress;

use structopt::StructOpt;

use neural_style::{Architecture, Backbone, Error, Init, LineSearch, Session};
use progress::ProgressReporter;
use std::path::PathBuf;

#[derive(Copy, Clone)]
enum InitKind {
    Noise,
    Content,
}

fn parse_init(input: &str) -> Result<InitKind, String> {
    match input {
        "noise" => Ok(InitKind::Noise),
        "content" => Ok(InitKind::Content),
        other => Err(format!(
            "initialization `{}` not one of: 'noise', 'content'",
            other
        )),
    }
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Transfers the style of one image onto the content of another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The image whose content (shapes and layout) is kept
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image whose style (textures and colors) is transferred
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// A safetensors file with the backbone's weights, using torchvision's
    /// `features.{index}.weight` naming
    #[structopt(long, parse(from_os_str))]
    weights: PathBuf,
    /// The backbone architecture the weights are for, one of vgg11, vgg13, vgg16
    /// or vgg19, optionally with a `-bn` suffix for the batch normalized variants
    #[structopt(long, default_value = "vgg19")]
    arch: Architecture,
    /// The path to save the styled image to, the file extension of the path
    /// determines the image format used
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: PathBuf,
    /// The working resolution, both images are resized so their shorter edge
    /// is this many pixels
    #[structopt(long, default_value = "512")]
    size: u32,
    /// Crops the central square of this size out of both images after
    /// resizing, required if their aspect ratios differ
    #[structopt(long)]
    crop: Option<u32>,
    /// The layers that get a content loss
    #[structopt(long, use_delimiter = true, default_value = "conv_5")]
    content_layers: Vec<String>,
    /// The layers that get a style loss
    #[structopt(long, use_delimiter = true, default_value = "conv_1,conv_3,conv_4")]
    style_layers: Vec<String>,
    /// The number of loss evaluations to optimize for
    #[structopt(long, default_value = "300")]
    steps: u32,
    #[structopt(long, default_value = "1000000")]
    style_weight: f32,
    #[structopt(long, default_value = "1")]
    content_weight: f32,
    /// What the optimized image starts out as, `noise` or `content`
    #[structopt(long, default_value = "noise", parse(try_from_str = parse_init))]
    init: InitKind,
    /// The seed for the noise initialization
    #[structopt(long)]
    seed: Option<u64>,
    /// Recolor the style image with the content image's colors before
    /// optimizing, so the output keeps the content's palette
    #[structopt(long)]
    preserve_colors: bool,
    /// A directory into which intermediate images, `step_{n}.jpg`, are saved
    #[structopt(long, parse(from_os_str))]
    snapshot_dir: Option<PathBuf>,
    /// The number of steps between snapshots
    #[structopt(long, default_value = "25")]
    snapshot_every: u32,
    /// The number of steps between score reports
    #[structopt(long, default_value = "10")]
    log_every: u32,
    /// Use a backtracking line search instead of a fixed step length
    #[structopt(long)]
    line_search: bool,
    /// The maximum number of worker threads that can be active at any one time.
    /// Defaults to the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    /// Don't show a progress bar
    #[structopt(long)]
    no_progress: bool,
}

fn main() {
    env_logger::init();

    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    // Check the output extension before spending minutes optimizing
    neural_style::check_output_format(&args.output_path)?;

    log::info!("loading {:?} weights from {}", args.arch, args.weights.display());
    let backbone = Backbone::load(args.arch, &args.weights)?;

    let init = match args.init {
        InitKind::Noise => Init::Noise {
            seed: args.seed.unwrap_or_default(),
        },
        InitKind::Content => Init::Content,
    };

    let mut sb = Session::builder()
        .content(&args.content)
        .style(&args.style)
        .backbone(backbone)
        .image_size(args.size)
        .content_layers(args.content_layers.iter().cloned())
        .style_layers(args.style_layers.iter().cloned())
        .num_steps(args.steps)
        .style_weight(args.style_weight)
        .content_weight(args.content_weight)
        .init(init)
        .preserve_colors(args.preserve_colors)
        .snapshot_every(args.snapshot_every)
        .log_every(args.log_every);

    if let Some(crop) = args.crop {
        sb = sb.crop(crop);
    }

    if let Some(ref dir) = args.snapshot_dir {
        sb = sb.snapshot_dir(dir);
    }

    if args.line_search {
        sb = sb.line_search(LineSearch::Backtracking);
    }

    if let Some(mt) = args.max_threads {
        sb = sb.max_thread_count(mt);
    }

    let session = sb.build()?;

    let progress: Option<Box<dyn neural_style::TransferProgress>> = if !args.no_progress {
        Some(Box::new(ProgressReporter::new(args.steps)))
    } else {
        None
    };

    let styled = session.run(progress)?;
    styled.save(&args.output_path)?;

    Ok(())
}
