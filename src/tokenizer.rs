use anyhow::{Context, Result};
use candle_core::{Device, Result as CandleResult, Tensor};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Which split of the corpus to sample batches from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSplit {
    Train,
    Val,
}

/// Character-level tokenizer plus a random batch sampler over a 90/10
/// train/validation split of the corpus.
#[derive(Debug, Clone)]
pub struct CharTokenizer {
    pub vocab_size: usize,
    char_to_idx: HashMap<char, usize>,
    idx_to_char: Vec<char>,
    train_data: Vec<usize>,
    val_data: Vec<usize>,
    device: Device,
}

impl CharTokenizer {
    pub fn from_file<P: AsRef<Path>>(file_path: P, device: Device) -> Result<Self> {
        let text = fs::read_to_string(&file_path).with_context(|| {
            format!("failed to read corpus {}", file_path.as_ref().display())
        })?;
        Self::from_text(&text, device)
    }

    pub fn from_text(text: &str, device: Device) -> Result<Self> {
        // Sorted unique characters give a stable id assignment across runs.
        let mut chars: Vec<char> = text
            .chars()
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        chars.sort();

        let char_to_idx: HashMap<char, usize> =
            chars.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        let encoded: Vec<usize> = text.chars().map(|c| char_to_idx[&c]).collect();

        let split_idx = (encoded.len() as f64 * 0.9) as usize;
        Ok(CharTokenizer {
            vocab_size: chars.len(),
            char_to_idx,
            idx_to_char: chars,
            train_data: encoded[..split_idx].to_vec(),
            val_data: encoded[split_idx..].to_vec(),
            device,
        })
    }

    /// Encode text, silently dropping characters outside the vocabulary.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        text.chars()
            .filter_map(|c| self.char_to_idx.get(&c))
            .copied()
            .collect()
    }

    pub fn decode(&self, indices: &[usize]) -> String {
        indices
            .iter()
            .filter_map(|&idx| self.idx_to_char.get(idx))
            .collect()
    }

    /// Encode text into a (1, len) tensor usable as a generation prompt.
    pub fn prompt_tensor(&self, text: &str) -> CandleResult<Tensor> {
        let data: Vec<u32> = self.encode(text).iter().map(|&x| x as u32).collect();
        let len = data.len();
        Tensor::from_vec(data, (1, len), &self.device)
    }

    /// Decode a (batch, len) token tensor's first row back to text.
    pub fn decode_tensor(&self, tokens: &Tensor) -> CandleResult<String> {
        let row = tokens.get(0)?.to_vec1::<u32>()?;
        Ok(self.decode(&row.iter().map(|&x| x as usize).collect::<Vec<_>>()))
    }

    /// A random batch of (inputs, targets), with targets shifted one position
    /// ahead of inputs. Shapes (batch_size, block_size).
    pub fn get_batch(
        &self,
        split: DataSplit,
        batch_size: usize,
        block_size: usize,
    ) -> CandleResult<(Tensor, Tensor)> {
        let data = match split {
            DataSplit::Train => &self.train_data,
            DataSplit::Val => &self.val_data,
        };
        if data.len() <= block_size {
            return Err(candle_core::Error::Msg(
                "corpus split is shorter than block_size".to_string(),
            ));
        }

        let max_start = data.len() - block_size - 1;
        let mut inputs = Vec::with_capacity(batch_size * block_size);
        let mut targets = Vec::with_capacity(batch_size * block_size);
        for _ in 0..batch_size {
            let start = fastrand::usize(0..max_start);
            inputs.extend(data[start..start + block_size].iter().map(|&x| x as u32));
            targets.extend(
                data[start + 1..start + block_size + 1]
                    .iter()
                    .map(|&x| x as u32),
            );
        }

        let inputs = Tensor::from_vec(inputs, (batch_size, block_size), &self.device)?;
        let targets = Tensor::from_vec(targets, (batch_size, block_size), &self.device)?;
        Ok((inputs, targets))
    }

    pub fn train_size(&self) -> usize {
        self.train_data.len()
    }

    pub fn val_size(&self) -> usize {
        self.val_data.len()
    }
}
