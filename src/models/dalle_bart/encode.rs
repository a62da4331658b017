use candle::{Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};
use candle_transformers::models::with_tracing::{layer_norm, linear, LayerNorm, Linear};

use super::attention::Attention;
use super::config::{DalleBartConfig, LearnedPositionalEmbedding};

/// Post-layer-norm encoder layer: self-attention then feed-forward.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
    activation_fn: candle_nn::Activation,
}

impl EncoderLayer {
    fn load(vb: VarBuilder, cfg: &DalleBartConfig) -> Result<Self> {
        let embed_dim = cfg.d_model;
        let self_attn = Attention::load(vb.pp("self_attn"), embed_dim, cfg.encoder_attention_heads)?;
        let self_attn_layer_norm = layer_norm(embed_dim, 1e-5, vb.pp("self_attn_layer_norm"))?;
        let fc1 = linear(embed_dim, cfg.encoder_ffn_dim, vb.pp("fc1"))?;
        let fc2 = linear(cfg.encoder_ffn_dim, embed_dim, vb.pp("fc2"))?;
        let final_layer_norm = layer_norm(embed_dim, 1e-5, vb.pp("final_layer_norm"))?;
        Ok(Self {
            self_attn,
            self_attn_layer_norm,
            fc1,
            fc2,
            final_layer_norm,
            activation_fn: cfg.activation_function,
        })
    }

    fn forward(&self, xs: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let residual = xs;
        let xs = self.self_attn.forward(xs, None, attention_mask, None)?;
        let xs = self.self_attn_layer_norm.forward(&(xs + residual)?)?;

        let residual = &xs;
        let ys = self.fc1.forward(&xs)?;
        let ys = self.activation_fn.forward(&ys)?;
        let ys = self.fc2.forward(&ys)?;
        self.final_layer_norm.forward(&(ys + residual)?)
    }
}

#[derive(Debug, Clone)]
pub struct Encoder {
    embed_tokens: Embedding,
    embed_positions: LearnedPositionalEmbedding,
    layernorm_embedding: Option<LayerNorm>,
    layers: Vec<EncoderLayer>,
    embed_scale: Option<f64>,
    span: tracing::Span,
}

impl Encoder {
    /// Loads the encoder on top of the shared text embedding.
    pub fn new(cfg: &DalleBartConfig, embed_tokens: Embedding, vb: VarBuilder) -> Result<Self> {
        let embed_positions = LearnedPositionalEmbedding::load(
            vb.pp("embed_positions"),
            cfg.max_position_embeddings,
            cfg.d_model,
        )?;
        let layernorm_embedding = if cfg.normalize_embedding {
            Some(layer_norm(cfg.d_model, 1e-5, vb.pp("layernorm_embedding"))?)
        } else {
            None
        };
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.encoder_layers)
            .map(|idx| EncoderLayer::load(vb_l.pp(idx), cfg))
            .collect::<Result<Vec<_>>>()?;
        let embed_scale = cfg.scale_embedding.then(|| (cfg.d_model as f64).sqrt());
        Ok(Self {
            embed_tokens,
            embed_positions,
            layernorm_embedding,
            layers,
            embed_scale,
            span: tracing::span!(tracing::Level::TRACE, "encoder"),
        })
    }

    /// `attention_mask` is the additive padding mask, see
    /// [`super::attention::expand_padding_mask`].
    pub fn forward(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let _enter = self.span.enter();
        let embed_pos = self.embed_positions.forward(input_ids, 0)?;
        let xs = input_ids.apply(&self.embed_tokens)?;
        let xs = match self.embed_scale {
            None => xs,
            Some(scale) => (xs * scale)?,
        };
        let mut xs = xs.broadcast_add(&embed_pos)?;
        if let Some(layernorm_embedding) = &self.layernorm_embedding {
            xs = layernorm_embedding.forward(&xs)?;
        }
        for layer in self.layers.iter() {
            xs = layer.forward(&xs, attention_mask)?;
        }
        Ok(xs)
    }
}
