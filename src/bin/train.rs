use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::DType;
use clap::Parser;
use training::{
    data::load_data, diffusion::GaussianDiffusion, model::SketchDenoiser, setup_device,
    SamplerKind, Trainer, TrainingConfig, TrainingError,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Sketch diffusion training CLI", long_about = None)]
struct Args {
    #[arg(long, value_name = "DIR", help = "Directory containing sketch shard files")]
    data_dir: PathBuf,

    #[arg(long, value_name = "DIR", default_value = "./logs")]
    log_dir: PathBuf,

    #[arg(long, value_name = "DIR", default_value = "./checkpoints")]
    checkpoint_dir: PathBuf,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Category shards to train on; all shards when omitted"
    )]
    categories: Vec<String>,

    #[arg(long, default_value_t = 64)]
    image_size: usize,

    #[arg(long, value_enum, default_value_t = SamplerKind::Uniform)]
    schedule_sampler: SamplerKind,

    #[arg(long, default_value_t = 1e-4)]
    lr: f64,

    #[arg(long, default_value_t = 0.0)]
    weight_decay: f64,

    #[arg(long, default_value_t = 0, help = "0 runs unbounded at a constant rate")]
    lr_anneal_steps: usize,

    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    #[arg(
        long,
        default_value_t = -1,
        allow_negative_numbers = true,
        help = "Microbatch size; zero or negative processes whole batches"
    )]
    microbatch: i64,

    #[arg(long, default_value = "0.9999", help = "Comma-separated EMA decay rates")]
    ema_rate: String,

    #[arg(long, default_value_t = 10)]
    log_interval: usize,

    #[arg(long, default_value_t = 100_000)]
    save_interval: usize,

    #[arg(long, value_name = "DIR", help = "Checkpoint directory to resume from")]
    resume_checkpoint: Option<PathBuf>,

    #[arg(long, help = "Resume from the latest checkpoint in checkpoint_dir")]
    resume: bool,

    #[arg(long)]
    use_fp16: bool,

    #[arg(long, default_value_t = 1e-3)]
    fp16_scale_growth: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 1000)]
    diffusion_steps: usize,

    #[arg(long, default_value_t = 256)]
    hidden_dim: usize,

    #[arg(long, help = "Condition the model on the shard category")]
    class_cond: bool,
}

impl Args {
    fn into_config(self) -> TrainingConfig {
        TrainingConfig {
            data_dir: self.data_dir,
            log_dir: self.log_dir,
            checkpoint_dir: self.checkpoint_dir,
            categories: self.categories,
            image_size: self.image_size,
            schedule_sampler: self.schedule_sampler,
            lr: self.lr,
            weight_decay: self.weight_decay,
            lr_anneal_steps: self.lr_anneal_steps,
            batch_size: self.batch_size,
            microbatch: self.microbatch,
            ema_rates: self.ema_rate,
            log_interval: self.log_interval,
            save_interval: self.save_interval,
            resume_checkpoint: self.resume_checkpoint,
            use_fp16: self.use_fp16,
            fp16_scale_growth: self.fp16_scale_growth,
            seed: self.seed,
            model: training::ModelOverrides {
                diffusion_steps: self.diffusion_steps,
                hidden_dim: self.hidden_dim,
                class_cond: self.class_cond,
            },
        }
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    let resume_latest = args.resume;
    let mut config = args.into_config();
    if resume_latest && config.resume_checkpoint.is_none() {
        if let Some(descriptor) = training::checkpoint::latest_checkpoint(&config.checkpoint_dir)? {
            println!(
                "resuming from checkpoint {} (step {})",
                descriptor.directory.display(),
                descriptor.manifest.progress.global_step
            );
            config.resume_checkpoint = Some(descriptor.directory);
        }
    }
    config.validate()?;

    let device = setup_device()?;
    let dtype = if config.use_fp16 {
        DType::F16
    } else {
        DType::F32
    };

    println!("creating data loader...");
    let loader = load_data(
        &config.data_dir,
        &config.categories,
        config.image_size,
        config.batch_size,
        config.model.class_cond,
        config.seed,
        device.clone(),
    )?;

    println!("creating model and diffusion...");
    let num_classes = if config.model.class_cond {
        Some(loader.num_classes())
    } else {
        None
    };
    let model = SketchDenoiser::new(
        config.image_size,
        config.model.hidden_dim,
        num_classes,
        dtype,
        &device,
    )?;
    let diffusion = GaussianDiffusion::new(config.model.diffusion_steps, device.clone())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    println!("training...");
    let mut trainer = Trainer::new(config, model, diffusion, loader, device, shutdown)?;
    trainer.run()
}
