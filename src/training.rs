use candle_core::{Device, Result as CandleResult};
use candle_nn::{
    optim::{AdamW, Optimizer, ParamsAdamW},
    VarBuilder, VarMap,
};
use std::time::Instant;

use crate::model::{RetNet, RetNetConfig};
use crate::tokenizer::{CharTokenizer, DataSplit};

/// Hyperparameters for the training loop.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    /// Sequence length of each training batch.
    pub block_size: usize,
    pub max_iters: usize,
    /// Evaluate on both splits every this many steps.
    pub eval_interval: usize,
    /// Batches averaged per evaluation.
    pub eval_iters: usize,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub device: Device,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            learning_rate: 6e-4,
            batch_size: 64,
            block_size: 256,
            max_iters: 5000,
            eval_interval: 100,
            eval_iters: 200,
            weight_decay: 1e-1,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            device: Device::Cpu,
        }
    }
}

/// Progress snapshot recorded at every evaluation point.
#[derive(Debug, Clone)]
pub struct TrainingStats {
    pub iteration: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub tokens_per_sec: f32,
    pub elapsed_time: f32,
}

/// Average loss over a few batches of the given split, without gradient
/// bookkeeping.
pub fn estimate_loss(
    model: &RetNet,
    tokenizer: &CharTokenizer,
    split: DataSplit,
    config: &TrainingConfig,
) -> CandleResult<f32> {
    let mut total_loss = 0.0f32;
    let mut num_batches = 0;

    for _ in 0..config.eval_iters {
        let (inputs, targets) =
            tokenizer.get_batch(split, config.batch_size, config.block_size)?;
        let (_logits, loss) = model.forward(&inputs, Some(&targets), false)?;
        if let Some(loss) = loss {
            total_loss += loss.to_scalar::<f32>()?;
            num_batches += 1;
        }
    }

    if num_batches == 0 {
        return Err(candle_core::Error::Msg(
            "no valid batches for loss estimation".to_string(),
        ));
    }
    Ok(total_loss / num_batches as f32)
}

/// Run the training loop: AdamW over all model variables, periodic
/// train/validation evaluation, and a progress table on stdout.
pub fn train_model(
    model: &RetNet,
    tokenizer: &CharTokenizer,
    varmap: &VarMap,
    config: &TrainingConfig,
) -> CandleResult<Vec<TrainingStats>> {
    let n_params: usize = varmap
        .all_vars()
        .iter()
        .map(|v| v.as_tensor().elem_count())
        .sum();
    println!("Training RetNet: {} parameters", n_params);
    println!("  lr={} batch={} block={} iters={}",
        config.learning_rate, config.batch_size, config.block_size, config.max_iters);

    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            weight_decay: config.weight_decay,
            eps: config.eps,
        },
    )?;

    let mut stats = Vec::new();
    let training_start = Instant::now();
    let mut last_eval_time = training_start;
    let mut tokens_processed = 0usize;

    println!(
        "{:>6} | {:>10} | {:>10} | {:>10} | {:>8}",
        "Iter", "Train Loss", "Val Loss", "Tok/sec", "Time"
    );
    println!("{}", "-".repeat(56));

    for iter in 0..config.max_iters {
        let (inputs, targets) =
            tokenizer.get_batch(DataSplit::Train, config.batch_size, config.block_size)?;
        let (_logits, loss) = model.forward(&inputs, Some(&targets), true)?;
        let loss = loss.ok_or_else(|| {
            candle_core::Error::Msg("no loss computed during training".to_string())
        })?;
        optimizer.backward_step(&loss)?;
        tokens_processed += config.batch_size * config.block_size;

        if iter % config.eval_interval == 0 || iter == config.max_iters - 1 {
            let train_loss = estimate_loss(model, tokenizer, DataSplit::Train, config)?;
            let val_loss = estimate_loss(model, tokenizer, DataSplit::Val, config)?;

            let now = Instant::now();
            let since_last = now.duration_since(last_eval_time).as_secs_f32();
            let elapsed = now.duration_since(training_start).as_secs_f32();
            let tokens_per_sec = if since_last > 0.0 {
                (config.batch_size * config.block_size * config.eval_interval) as f32
                    / since_last
            } else {
                0.0
            };
            last_eval_time = now;

            let snapshot = TrainingStats {
                iteration: iter,
                train_loss,
                val_loss,
                tokens_per_sec,
                elapsed_time: elapsed,
            };
            println!(
                "{:6} | {:10.4} | {:10.4} | {:10.0} | {:7.1}s",
                snapshot.iteration,
                snapshot.train_loss,
                snapshot.val_loss,
                snapshot.tokens_per_sec,
                snapshot.elapsed_time
            );
            stats.push(snapshot);
        }
    }

    let total_time = training_start.elapsed().as_secs_f32();
    println!("\nTraining finished in {:.1}s", total_time);
    println!(
        "Average tokens/sec: {:.0}",
        tokens_processed as f32 / total_time.max(1e-6)
    );
    if let Some(last) = stats.last() {
        println!("Final train loss: {:.4}", last.train_loss);
        println!("Final val loss:   {:.4}", last.val_loss);
    }

    Ok(stats)
}

/// Build a model and run a short training session with sensible defaults.
pub fn train_retnet(
    model_config: RetNetConfig,
    tokenizer: &CharTokenizer,
    device: Device,
    max_iters: usize,
) -> CandleResult<(RetNet, VarMap, Vec<TrainingStats>)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &device);
    let model = RetNet::new(model_config, vb)?;

    let mut config = TrainingConfig {
        device,
        block_size: model.config().block_size,
        max_iters,
        ..Default::default()
    };
    config.eval_interval = (max_iters / 5).max(1);
    config.eval_iters = 10;
    config.batch_size = 16;

    let stats = train_model(&model, tokenizer, &varmap, &config)?;
    Ok((model, varmap, stats))
}
