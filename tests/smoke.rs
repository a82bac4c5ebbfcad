use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use std::cell::Cell;

use candle_core::{DType, Device, Tensor};
use tempfile::tempdir;
use training::{
    checkpoint,
    data::{load_data, Batch, SketchDataLoader},
    diffusion::{DiffusionModel, DiffusionObjective, GaussianDiffusion},
    model::SketchDenoiser,
    SamplerKind, Trainer, TrainingConfig, TrainingError,
};

const IMAGE_SIZE: usize = 4;
const DIFFUSION_STEPS: usize = 10;

fn write_shard(dir: &Path, name: &str, records: usize) {
    let record_len = IMAGE_SIZE * IMAGE_SIZE;
    let mut bytes = Vec::with_capacity(records * record_len * 4);
    for record in 0..records {
        for i in 0..record_len {
            let value = ((record * record_len + i) % 17) as f32 / 17.0;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    fs::write(dir.join(format!("{name}.bin")), bytes).unwrap();
}

fn test_config(base: &Path, anneal_steps: usize) -> TrainingConfig {
    TrainingConfig {
        data_dir: base.join("data"),
        log_dir: base.join("logs"),
        checkpoint_dir: base.join("checkpoints"),
        image_size: IMAGE_SIZE,
        lr: 1e-3,
        lr_anneal_steps: anneal_steps,
        batch_size: 4,
        microbatch: 2,
        log_interval: 1,
        save_interval: 1_000_000,
        model: training::ModelOverrides {
            diffusion_steps: DIFFUSION_STEPS,
            hidden_dim: 8,
            class_cond: false,
        },
        ..TrainingConfig::default()
    }
}

fn build_trainer(
    config: TrainingConfig,
    shutdown: Arc<AtomicBool>,
) -> Trainer<SketchDenoiser, GaussianDiffusion, SketchDataLoader> {
    let device = Device::Cpu;
    let loader = load_data(
        &config.data_dir,
        &config.categories,
        config.image_size,
        config.batch_size,
        config.model.class_cond,
        config.seed,
        device.clone(),
    )
    .unwrap();
    let model = SketchDenoiser::new(
        config.image_size,
        config.model.hidden_dim,
        None,
        DType::F32,
        &device,
    )
    .unwrap();
    let diffusion = GaussianDiffusion::new(config.model.diffusion_steps, device.clone()).unwrap();
    Trainer::new(config, model, diffusion, loader, device, shutdown).unwrap()
}

fn seed_dataset(base: &Path) {
    fs::create_dir_all(base.join("data")).unwrap();
    write_shard(&base.join("data"), "circle", 8);
}

#[test]
fn short_run_trains_and_checkpoints() {
    let tmp = tempdir().unwrap();
    seed_dataset(tmp.path());

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut trainer = build_trainer(test_config(tmp.path(), 3), shutdown);
    trainer.run().unwrap();

    assert_eq!(trainer.global_step(), 3);
    let final_dir = tmp.path().join("checkpoints").join("step_000000000003");
    assert!(final_dir.join("manifest.json").is_file());
    assert!(final_dir.join("model.safetensors").is_file());
    assert!(final_dir.join("ema_0.9999.safetensors").is_file());
    assert!(final_dir.join("optimizer.json").is_file());

    // The logger should have produced a tensorboard event file.
    let log_entries = fs::read_dir(tmp.path().join("logs")).unwrap().count();
    assert!(log_entries > 0, "no event files written");
}

#[test]
fn resume_continues_from_the_named_checkpoint() {
    let tmp = tempdir().unwrap();
    seed_dataset(tmp.path());

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut first = build_trainer(test_config(tmp.path(), 3), shutdown.clone());
    first.run().unwrap();
    drop(first);

    let latest = checkpoint::latest_checkpoint(&tmp.path().join("checkpoints"))
        .unwrap()
        .expect("checkpoint from the first run");
    let mut config = test_config(tmp.path(), 6);
    config.resume_checkpoint = Some(latest.directory);
    let mut resumed = build_trainer(config, shutdown);
    assert_eq!(resumed.global_step(), 3, "resume must pick up the saved step");
    assert_eq!(resumed.resume_step(), 3);

    resumed.run().unwrap();
    assert_eq!(resumed.global_step(), 6);
    assert!(tmp
        .path()
        .join("checkpoints")
        .join("step_000000000006")
        .join("manifest.json")
        .is_file());
}

#[test]
fn resume_reinitializes_missing_ema_rates() {
    let tmp = tempdir().unwrap();
    seed_dataset(tmp.path());

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut first = build_trainer(test_config(tmp.path(), 2), shutdown.clone());
    first.run().unwrap();
    drop(first);

    // The second run tracks an extra rate the checkpoint does not carry;
    // it must come up anyway, re-initialized from the restored weights.
    let latest = checkpoint::latest_checkpoint(&tmp.path().join("checkpoints"))
        .unwrap()
        .expect("checkpoint from the first run");
    let mut config = test_config(tmp.path(), 4);
    config.resume_checkpoint = Some(latest.directory);
    config.ema_rates = "0.9999,0.5".to_string();
    let mut resumed = build_trainer(config, shutdown);
    assert_eq!(resumed.global_step(), 2);
    resumed.run().unwrap();

    let final_dir = tmp.path().join("checkpoints").join("step_000000000004");
    assert!(final_dir.join("ema_0.9999.safetensors").is_file());
    assert!(final_dir.join("ema_0.5.safetensors").is_file());
}

#[test]
fn fresh_run_ignores_existing_checkpoints() {
    let tmp = tempdir().unwrap();
    seed_dataset(tmp.path());

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut first = build_trainer(test_config(tmp.path(), 2), shutdown.clone());
    first.run().unwrap();
    drop(first);

    // No resume path configured: stale checkpoints in the directory must
    // not leak into the new run.
    let fresh = build_trainer(test_config(tmp.path(), 4), shutdown);
    assert_eq!(fresh.global_step(), 0);
    assert_eq!(fresh.resume_step(), 0);
}

/// Delegates to the real objective but poisons the first loss with NaN.
struct PoisonedObjective {
    inner: GaussianDiffusion,
    num_timesteps: usize,
    armed: Cell<bool>,
}

impl DiffusionObjective<SketchDenoiser> for PoisonedObjective {
    fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    fn losses(
        &self,
        model: &SketchDenoiser,
        batch: &Batch,
        timesteps: &[usize],
    ) -> Result<Tensor, TrainingError> {
        let losses = self.inner.losses(model, batch, timesteps)?;
        if self.armed.take() {
            return losses
                .affine(f64::NAN, 0.0)
                .map_err(|err| TrainingError::runtime(err.to_string()));
        }
        Ok(losses)
    }
}

#[test]
fn non_finite_loss_skips_the_step_without_touching_weights() {
    let tmp = tempdir().unwrap();
    seed_dataset(tmp.path());
    let device = Device::Cpu;

    let config = test_config(tmp.path(), 1);
    let loader = load_data(
        &config.data_dir,
        &config.categories,
        config.image_size,
        config.batch_size,
        false,
        config.seed,
        device.clone(),
    )
    .unwrap();
    let model = SketchDenoiser::new(
        config.image_size,
        config.model.hidden_dim,
        None,
        DType::F32,
        &device,
    )
    .unwrap();
    // Vars are shared handles, so the snapshot below observes whatever the
    // trainer does to the model.
    let params = model.named_parameters();
    let before: Vec<Vec<f32>> = params
        .iter()
        .map(|(_, var)| {
            var.as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .collect();

    let objective = PoisonedObjective {
        inner: GaussianDiffusion::new(DIFFUSION_STEPS, device.clone()).unwrap(),
        num_timesteps: DIFFUSION_STEPS,
        armed: Cell::new(true),
    };
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut trainer =
        Trainer::new(config, model, objective, loader, device.clone(), shutdown).unwrap();
    trainer.run().unwrap();

    // The only step in the budget was skipped, yet the counter advanced.
    assert_eq!(trainer.global_step(), 1);
    for ((name, var), before) in params.iter().zip(before.iter()) {
        let after = var
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(&after, before, "parameter {name} changed on a skipped step");
    }

    // Shadows never updated either: they still equal the initial weights.
    let final_dir = tmp.path().join("checkpoints").join("step_000000000001");
    let shadows = candle_core::safetensors::load(
        final_dir.join("ema_0.9999.safetensors"),
        &device,
    )
    .unwrap();
    for ((name, _), before) in params.iter().zip(before.iter()) {
        let shadow = shadows[name].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(&shadow, before, "EMA shadow {name} changed on a skipped step");
    }
}

#[test]
fn shutdown_flag_checkpoints_and_exits_cleanly() {
    let tmp = tempdir().unwrap();
    seed_dataset(tmp.path());

    let shutdown = Arc::new(AtomicBool::new(false));
    shutdown.store(true, Ordering::SeqCst);
    let mut trainer = build_trainer(test_config(tmp.path(), 0), shutdown);
    trainer.run().unwrap();

    assert_eq!(trainer.global_step(), 0);
    assert!(tmp
        .path()
        .join("checkpoints")
        .join("step_000000000000")
        .join("manifest.json")
        .is_file());
}

#[test]
fn adaptive_sampler_runs_end_to_end() {
    let tmp = tempdir().unwrap();
    seed_dataset(tmp.path());

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut config = test_config(tmp.path(), 3);
    config.schedule_sampler = SamplerKind::LossSecondMoment;
    let mut trainer = build_trainer(config, shutdown);
    trainer.run().unwrap();
    assert_eq!(trainer.global_step(), 3);
}
