use candle_core::{DType, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};

/// Nucleus threshold used for every request.
pub const TOP_P: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: Option<usize>,
    pub repetition_penalty: f32,
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: TOP_P,
            top_k: None,
            repetition_penalty: 1.0,
            seed: 0,
        }
    }
}

impl SamplingParams {
    fn strategy(&self) -> Sampling {
        match self.top_k {
            Some(k) if k > 0 => Sampling::TopKThenTopP {
                k,
                p: self.top_p,
                temperature: self.temperature,
            },
            _ => Sampling::TopP {
                p: self.top_p,
                temperature: self.temperature,
            },
        }
    }
}

/// Temperature, optional top-k, then top-p over one step's logits, with the
/// repetition penalty applied over everything seen so far.
pub struct Sampler {
    processor: LogitsProcessor,
    repetition_penalty: f32,
}

impl Sampler {
    pub fn new(params: &SamplingParams) -> Self {
        Self {
            processor: LogitsProcessor::from_sampling(params.seed, params.strategy()),
            repetition_penalty: params.repetition_penalty,
        }
    }

    /// `logits` is a `[vocab]` tensor; `context` holds every id of the
    /// sequence so far.
    pub fn sample(&mut self, logits: &Tensor, context: &[u32]) -> candle_core::Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        let logits = if (self.repetition_penalty - 1.0).abs() > f32::EPSILON {
            candle_transformers::utils::apply_repeat_penalty(&logits, self.repetition_penalty, context)?
        } else {
            logits
        };
        self.processor.sample(&logits)
    }
}
