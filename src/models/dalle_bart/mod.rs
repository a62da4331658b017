//! DALL·E-mini sequence model.
//!
//! A BART encoder-decoder where the encoder reads a text prompt and the
//! decoder emits VQGAN image codes. Differences with text BART:
//! - the decoder has its own embedding table over the image codes plus the
//!   decoder start token, and its positions cover `image_length + 1` steps;
//! - layers are post-layer-norm and there is no final layer norm;
//! - the language modeling head has no bias, `final_logits_bias` is added.
//!
//! References:
//! - [DALL·E mini](https://github.com/borisdayma/dalle-mini)
//! - [BART Paper](https://arxiv.org/abs/1910.13461)

pub mod attention;
pub mod config;
pub mod decode;
pub mod encode;

use candle::{DType, Result, Tensor};
use candle_nn::{embedding, Module, VarBuilder};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::with_tracing::{linear_no_bias, Linear};

pub use attention::expand_padding_mask;
pub use config::DalleBartConfig;
pub use decode::{Decoder, KvCache};
pub use encode::Encoder;

/// Decoding parameters for [`DalleBart::sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct SampleConfig {
    /// Sequence length including the decoder start token.
    pub max_length: usize,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
    pub top_k: usize,
    pub temperature: f64,
}

#[derive(Debug, Clone)]
pub struct DalleBart {
    encoder: Encoder,
    decoder: Decoder,
    lm_head: Linear,
    final_logits_bias: Tensor,
    config: DalleBartConfig,
}

impl DalleBart {
    pub fn new(cfg: &DalleBartConfig, vb: VarBuilder) -> Result<Self> {
        let shared = embedding(cfg.vocab_size, cfg.d_model, vb.pp("model.shared"))?;
        let encoder = Encoder::new(cfg, shared, vb.pp("model.encoder"))?;
        let decoder = Decoder::new(cfg, vb.pp("model.decoder"))?;
        let lm_head = linear_no_bias(cfg.d_model, cfg.decoder_vocab_size(), vb.pp("lm_head"))?;
        let final_logits_bias = vb.get((1, cfg.decoder_vocab_size()), "final_logits_bias")?;
        Ok(Self {
            encoder,
            decoder,
            lm_head,
            final_logits_bias,
            config: cfg.clone(),
        })
    }

    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.decoder.num_layers())
    }

    /// `attention_mask` is an additive mask built by [`expand_padding_mask`].
    pub fn encode(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        self.encoder.forward(input_ids, attention_mask)
    }

    /// Logits for the last position of `decoder_ids`, shape `(batch, vocab)`.
    pub fn decode(
        &self,
        decoder_ids: &Tensor,
        encoder_xs: &Tensor,
        encoder_mask: Option<&Tensor>,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let xs = self
            .decoder
            .forward(decoder_ids, encoder_xs, encoder_mask, cache)?;
        let seq_len = xs.dim(1)?;
        let logits = self.lm_head.forward(&xs.narrow(1, seq_len - 1, 1)?)?;
        logits.squeeze(1)?.broadcast_add(&self.final_logits_bias)
    }

    /// Samples one sequence of image codes for a single tokenized prompt.
    ///
    /// The returned sequence has exactly `max_length` tokens and starts with
    /// the decoder start token. Once the end token is produced the remaining
    /// positions are filled with the pad token.
    pub fn sample(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        params: &SampleConfig,
        seed: u64,
    ) -> Result<Vec<u32>> {
        let device = input_ids.device();
        let encoder_mask = match attention_mask {
            Some(mask) => Some(expand_padding_mask(mask, self.final_logits_bias.dtype())?),
            None => None,
        };
        let encoder_xs = self.encode(input_ids, encoder_mask.as_ref())?;
        let mut logits_processor = LogitsProcessor::from_sampling(
            seed,
            Sampling::TopK {
                k: params.top_k,
                temperature: params.temperature,
            },
        );
        let mut cache = self.new_cache();
        let mut tokens = vec![self.config.decoder_start_token_id()];
        while tokens.len() < params.max_length {
            let step = tokens.len();
            let last = tokens[step - 1];
            let decoder_ids = Tensor::new(&[[last]], device)?;
            let logits = self
                .decode(&decoder_ids, &encoder_xs, encoder_mask.as_ref(), &mut cache)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            let forced = match (self.config.forced_bos_token_id, self.config.forced_eos_token_id) {
                (Some(bos), _) if step == 1 => Some(bos),
                (_, Some(eos)) if step == params.max_length - 1 => Some(eos),
                _ => None,
            };
            let token = match forced {
                Some(token) => token,
                None => logits_processor.sample(&logits)?,
            };
            tokens.push(token);
            if token == params.eos_token_id {
                tokens.resize(params.max_length, params.pad_token_id);
                break;
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::VarMap;

    fn tiny_config() -> DalleBartConfig {
        DalleBartConfig {
            vocab_size: 40,
            image_vocab_size: 16,
            image_length: 6,
            d_model: 8,
            encoder_layers: 1,
            decoder_layers: 2,
            encoder_attention_heads: 2,
            decoder_attention_heads: 2,
            encoder_ffn_dim: 16,
            decoder_ffn_dim: 16,
            max_position_embeddings: 10,
            decoder_start_token_id: None,
            pad_token_id: 1,
            bos_token_id: 0,
            eos_token_id: 2,
            ..DalleBartConfig::dalle_mini()
        }
    }

    fn params() -> SampleConfig {
        SampleConfig {
            max_length: 7,
            eos_token_id: 100,
            pad_token_id: 100,
            top_k: 5,
            temperature: 1.0,
        }
    }

    #[test]
    fn sample_length_and_range() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = DalleBart::new(&tiny_config(), vb)?;
        let input_ids = Tensor::new(&[[0u32, 5, 9, 2, 1, 1]], &device)?;
        let mask = Tensor::new(&[[1u32, 1, 1, 1, 0, 0]], &device)?;

        let tokens = model.sample(&input_ids, Some(&mask), &params(), 42)?;
        assert_eq!(tokens.len(), 7);
        assert_eq!(tokens[0], 16);
        assert!(tokens[1..].iter().all(|&t| t < 17), "{tokens:?}");

        let again = model.sample(&input_ids, Some(&mask), &params(), 42)?;
        assert_eq!(tokens, again);
        Ok(())
    }

    #[test]
    fn end_token_pads_the_rest() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = DalleBartConfig {
            forced_bos_token_id: Some(3),
            ..tiny_config()
        };
        let model = DalleBart::new(&cfg, vb)?;
        let input_ids = Tensor::new(&[[0u32, 5, 2]], &device)?;
        let params = SampleConfig {
            eos_token_id: 3,
            pad_token_id: 4,
            ..params()
        };
        let tokens = model.sample(&input_ids, None, &params, 0)?;
        assert_eq!(tokens, vec![16, 3, 4, 4, 4, 4, 4]);
        Ok(())
    }

    #[test]
    fn padding_mask_shape() -> Result<()> {
        let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu)?;
        let mask = expand_padding_mask(&mask, DType::F32)?;
        assert_eq!(mask.dims(), &[1, 1, 1, 3]);
        let values = mask.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values[0], 0.);
        assert_eq!(values[2], f32::MIN);
        Ok(())
    }
}
