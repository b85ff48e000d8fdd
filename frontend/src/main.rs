#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use log::info;

use std::path;

use autosched::color::{self, ColorMode};
use autosched::lower::lower;
use autosched::pprint::pprint_history;
use autosched::record::load_from_file;
use autosched::session::{
    auto_schedule, TuneOptions, DEFAULT_LOG_FILE, DEFAULT_N_TRIAL, DEFAULT_NUMBER,
};
use autosched::target::TargetId;
use autosched::tuner::TunerKind;
use autosched::workloads::{batch_matmul, conv2d};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Color mode
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Search strategy
    #[arg(long, value_enum, default_value_t = TunerKind::default())]
    tuner: TunerKind,

    /// Target to tune for
    #[arg(long, value_enum, hide_default_value = true, default_value_t = TargetId::default())]
    target: TargetId,

    /// Maximum number of configurations to measure
    #[arg(long, default_value_t = DEFAULT_N_TRIAL)]
    n_trial: usize,

    /// Runs averaged into one timing sample
    #[arg(long, default_value_t = DEFAULT_NUMBER)]
    number: usize,

    /// Timing samples per configuration
    #[arg(long)]
    repeat: Option<usize>,

    /// Tuning log; removed at the start of every session
    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    log_file: path::PathBuf,

    /// Stop after this many trials without improvement
    #[arg(long)]
    early_stopping: Option<usize>,

    /// Seed for the search strategy
    #[arg(long)]
    seed: Option<u64>,

    /// Show a progress bar while tuning
    #[arg(long, default_value_t = false)]
    progress: bool,

    /// Print the lowered loop nest of the final schedule
    #[arg(long, default_value_t = false)]
    print_lowered: bool,

    /// Disable verification
    #[cfg(feature = "verification")]
    #[arg(long, default_value_t = false)]
    skip_check: bool,

    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    #[command(about = "Tune a batched matrix multiplication")]
    Matmul {
        batch: i64,
        n: i64,
        l: i64,
        m: i64,
    },
    #[command(about = "Tune an NCHW convolution")]
    Conv {
        batch: i64,
        in_channels: i64,
        height: i64,
        width: i64,
        out_channels: i64,
        kernel_h: i64,
        kernel_w: i64,
        #[arg(long, default_value = "0")]
        pad_h: i64,
        #[arg(long, default_value = "0")]
        pad_w: i64,
        #[arg(long, default_value = "1")]
        stride_h: i64,
        #[arg(long, default_value = "1")]
        stride_w: i64,
        #[arg(long, default_value = "1")]
        dilation_h: i64,
        #[arg(long, default_value = "1")]
        dilation_w: i64,
    },
    #[command(about = "Print the fastest configurations of a tuning log")]
    History {
        #[arg(long, short, default_value = "10")]
        top: usize,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    color::set_color_mode(args.color);

    let mut options = TuneOptions {
        n_trial: args.n_trial,
        log_file: args.log_file.clone(),
        tuner: args.tuner,
        early_stopping: args.early_stopping,
        target: args.target,
        seed: args.seed,
        progress: args.progress,
        ..Default::default()
    };
    options.measure.runner.number = args.number;
    if let Some(repeat) = args.repeat {
        options.measure.runner.repeat = repeat;
    }

    let (definition_args, is_matmul) = match &args.subcmd {
        Subcommand::History { top } => {
            let records = load_from_file(&args.log_file)?;
            info!("Read {} records from {}", records.len(), args.log_file.display());
            pprint_history(&records, *top);
            return Ok(());
        }
        Subcommand::Matmul { batch, n, l, m } => (vec![*batch, *n, *l, *m], true),
        Subcommand::Conv {
            batch,
            in_channels,
            height,
            width,
            out_channels,
            kernel_h,
            kernel_w,
            pad_h,
            pad_w,
            stride_h,
            stride_w,
            dilation_h,
            dilation_w,
        } => (
            vec![
                *batch,
                *in_channels,
                *height,
                *width,
                *out_channels,
                *kernel_h,
                *kernel_w,
                *pad_h,
                *pad_w,
                *stride_h,
                *stride_w,
                *dilation_h,
                *dilation_w,
            ],
            false,
        ),
    };

    let start_time = std::time::Instant::now();
    let (schedule, bufs) = if is_matmul {
        auto_schedule(batch_matmul, &definition_args, &options)?
    } else {
        auto_schedule(conv2d, &definition_args, &options)?
    };
    info!("auto_schedule took {:?}", start_time.elapsed());

    if args.print_lowered {
        let name = if is_matmul { "batch_matmul" } else { "conv2d" };
        println!("{}", lower(&schedule, &bufs, name)?);
    }

    #[cfg(feature = "verification")]
    if !args.skip_check {
        use autosched::verification::{check_against_default, check_batch_matmul};
        let passed = if is_matmul {
            check_batch_matmul(&schedule, &bufs)?
        } else {
            check_against_default(&schedule, &bufs)?
        };
        if !passed {
            anyhow::bail!("Tuned schedule computed incorrect output");
        }
    }
    Ok(())
}
