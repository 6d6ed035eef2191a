use anyhow::{Context, Result};
use retnet_candle::model::{RetNetConfig, Sampling};
use retnet_candle::tokenizer::CharTokenizer;
use retnet_candle::training::train_retnet;
use retnet_candle::setup_device;

fn main() -> Result<()> {
    env_logger::init();

    let corpus = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "data/input.txt".to_string());
    let device = setup_device()?;

    println!("Loading corpus from {corpus}...");
    let tokenizer = CharTokenizer::from_file(&corpus, device.clone())?;
    println!(
        "  vocab={} train={} val={} tokens",
        tokenizer.vocab_size,
        tokenizer.train_size(),
        tokenizer.val_size()
    );

    let config = RetNetConfig::small(tokenizer.vocab_size);
    let (model, _varmap, _stats) =
        train_retnet(config, &tokenizer, device, 200).context("training failed")?;

    let prompt = tokenizer.prompt_tensor("The ")?;
    let sampling = Sampling::top_k(40);

    println!("\nParallel-mode generation:");
    let out = model.generate(&prompt, 200, &sampling)?;
    println!("{}", tokenizer.decode_tensor(&out)?);

    println!("\nRecurrent-mode generation (O(1) per token):");
    let out = model.generate_recurrent(&prompt, 200, &sampling)?;
    println!("{}", tokenizer.decode_tensor(&out)?);

    Ok(())
}
