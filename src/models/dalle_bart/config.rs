use candle::{Result, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};

fn default_image_vocab_size() -> usize {
    16384
}

fn default_image_length() -> usize {
    256
}

fn default_max_position_embeddings() -> usize {
    1024
}

fn default_activation() -> candle_nn::Activation {
    candle_nn::Activation::Gelu
}

fn default_true() -> bool {
    true
}

/// Configuration of a DALL·E-mini sequence model.
///
/// The encoder reads text tokens from the BART vocabulary, the decoder emits
/// image codes from a separate vocabulary of `image_vocab_size` codes plus
/// the decoder start token.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct DalleBartConfig {
    /// Text vocabulary size.
    pub vocab_size: usize,
    #[serde(default = "default_image_vocab_size")]
    pub image_vocab_size: usize,
    /// Number of image codes per sample.
    #[serde(default = "default_image_length")]
    pub image_length: usize,
    pub d_model: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub decoder_ffn_dim: usize,
    #[serde(default = "default_activation")]
    pub activation_function: candle_nn::Activation,
    /// Text positions available to the encoder.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Defaults to `image_vocab_size`.
    #[serde(default)]
    pub decoder_start_token_id: Option<u32>,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default)]
    pub bos_token_id: u32,
    #[serde(default)]
    pub eos_token_id: u32,
    #[serde(default)]
    pub force_bos_token_to_be_generated: bool,
    #[serde(default)]
    pub forced_bos_token_id: Option<u32>,
    #[serde(default)]
    pub forced_eos_token_id: Option<u32>,
    #[serde(default)]
    pub scale_embedding: bool,
    #[serde(default = "default_true")]
    pub normalize_embedding: bool,
}

impl DalleBartConfig {
    pub fn decoder_start_token_id(&self) -> u32 {
        self.decoder_start_token_id
            .unwrap_or(self.image_vocab_size as u32)
    }

    /// Image codes plus the decoder start token.
    pub fn decoder_vocab_size(&self) -> usize {
        self.image_vocab_size + 1
    }

    /// Clears the decoding settings inherited from the text BART checkpoints,
    /// they would force text tokens into an image sequence.
    pub fn apply_legacy_overrides(&mut self) {
        self.force_bos_token_to_be_generated = false;
        self.forced_bos_token_id = None;
        self.forced_eos_token_id = None;
    }

    /// The released mega-1 style layout on top of BART large.
    pub fn dalle_mini() -> Self {
        Self {
            vocab_size: 50264,
            image_vocab_size: 16384,
            image_length: 256,
            d_model: 1024,
            encoder_layers: 12,
            decoder_layers: 12,
            encoder_attention_heads: 16,
            decoder_attention_heads: 16,
            encoder_ffn_dim: 4096,
            decoder_ffn_dim: 4096,
            activation_function: candle_nn::Activation::Gelu,
            max_position_embeddings: 1024,
            decoder_start_token_id: Some(16384),
            pad_token_id: 1,
            bos_token_id: 0,
            eos_token_id: 2,
            force_bos_token_to_be_generated: false,
            forced_bos_token_id: None,
            forced_eos_token_id: None,
            scale_embedding: false,
            normalize_embedding: true,
        }
    }
}

/// Learned positional embedding, the first two rows are reserved.
#[derive(Debug, Clone)]
pub struct LearnedPositionalEmbedding {
    offset: usize,
    weights: Embedding,
}

impl LearnedPositionalEmbedding {
    pub fn load(vb: VarBuilder, num_positions: usize, embedding_dim: usize) -> Result<Self> {
        let offset: usize = 2;
        let weights = embedding(num_positions + offset, embedding_dim, vb)?;
        Ok(Self { offset, weights })
    }

    pub fn forward(&self, input_ids: &Tensor, past_key_values_length: usize) -> Result<Tensor> {
        let (b_sz, seq_len) = input_ids.dims2()?;
        let start = (past_key_values_length + self.offset) as u32;
        let positions = Tensor::arange(start, start + seq_len as u32, input_ids.device())?
            .expand((b_sz, seq_len))?;
        self.weights.forward(&positions)
    }
}
