use candle::{Result, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};
use candle_transformers::models::with_tracing::{layer_norm, linear, LayerNorm, Linear};

use super::attention::Attention;
use super::config::{DalleBartConfig, LearnedPositionalEmbedding};

/// Self-attention and cross-attention caches, one slot per decoder layer.
#[derive(Debug, Clone)]
pub struct KvCache {
    self_attn: Vec<Option<(Tensor, Tensor)>>,
    cross_attn: Vec<Option<(Tensor, Tensor)>>,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            self_attn: vec![None; num_layers],
            cross_attn: vec![None; num_layers],
        }
    }

    /// Number of positions already decoded.
    pub fn past_len(&self) -> Result<usize> {
        match self.self_attn.first() {
            Some(Some((k, _))) => k.dim(2),
            _ => Ok(0),
        }
    }
}

/// Post-layer-norm decoder layer.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
    activation_fn: candle_nn::Activation,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, cfg: &DalleBartConfig) -> Result<Self> {
        let embed_dim = cfg.d_model;
        let heads = cfg.decoder_attention_heads;
        let self_attn = Attention::load(vb.pp("self_attn"), embed_dim, heads)?;
        let self_attn_layer_norm = layer_norm(embed_dim, 1e-5, vb.pp("self_attn_layer_norm"))?;
        let encoder_attn = Attention::load(vb.pp("encoder_attn"), embed_dim, heads)?;
        let encoder_attn_layer_norm =
            layer_norm(embed_dim, 1e-5, vb.pp("encoder_attn_layer_norm"))?;
        let fc1 = linear(embed_dim, cfg.decoder_ffn_dim, vb.pp("fc1"))?;
        let fc2 = linear(cfg.decoder_ffn_dim, embed_dim, vb.pp("fc2"))?;
        let final_layer_norm = layer_norm(embed_dim, 1e-5, vb.pp("final_layer_norm"))?;
        Ok(Self {
            self_attn,
            self_attn_layer_norm,
            encoder_attn,
            encoder_attn_layer_norm,
            fc1,
            fc2,
            final_layer_norm,
            activation_fn: cfg.activation_function,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        encoder_xs: &Tensor,
        encoder_mask: Option<&Tensor>,
        self_attn_cache: &mut Option<(Tensor, Tensor)>,
        cross_attn_cache: &mut Option<(Tensor, Tensor)>,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self
            .self_attn
            .forward(xs, None, None, Some(self_attn_cache))?;
        let xs = self.self_attn_layer_norm.forward(&(xs + residual)?)?;

        let residual = &xs;
        let ys = self.encoder_attn.forward(
            &xs,
            Some(encoder_xs),
            encoder_mask,
            Some(cross_attn_cache),
        )?;
        let xs = self.encoder_attn_layer_norm.forward(&(ys + residual)?)?;

        let residual = &xs;
        let ys = self.fc1.forward(&xs)?;
        let ys = self.activation_fn.forward(&ys)?;
        let ys = self.fc2.forward(&ys)?;
        self.final_layer_norm.forward(&(ys + residual)?)
    }
}

/// Image-token decoder with its own embedding table.
#[derive(Debug, Clone)]
pub struct Decoder {
    embed_tokens: Embedding,
    embed_positions: LearnedPositionalEmbedding,
    layernorm_embedding: Option<LayerNorm>,
    layers: Vec<DecoderLayer>,
    embed_scale: Option<f64>,
    span: tracing::Span,
}

impl Decoder {
    pub fn new(cfg: &DalleBartConfig, vb: VarBuilder) -> Result<Self> {
        let embed_tokens = embedding(cfg.decoder_vocab_size(), cfg.d_model, vb.pp("embed_tokens"))?;
        // The start token takes a position too.
        let embed_positions = LearnedPositionalEmbedding::load(
            vb.pp("embed_positions"),
            cfg.image_length + 1,
            cfg.d_model,
        )?;
        let layernorm_embedding = if cfg.normalize_embedding {
            Some(layer_norm(cfg.d_model, 1e-5, vb.pp("layernorm_embedding"))?)
        } else {
            None
        };
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.decoder_layers)
            .map(|idx| DecoderLayer::load(vb_l.pp(idx), cfg))
            .collect::<Result<Vec<_>>>()?;
        let embed_scale = cfg.scale_embedding.then(|| (cfg.d_model as f64).sqrt());
        Ok(Self {
            embed_tokens,
            embed_positions,
            layernorm_embedding,
            layers,
            embed_scale,
            span: tracing::span!(tracing::Level::TRACE, "decoder"),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Decodes the new tokens `xs` given everything already stored in `cache`.
    /// No causal mask is needed as long as tokens are fed one at a time.
    pub fn forward(
        &self,
        xs: &Tensor,
        encoder_xs: &Tensor,
        encoder_mask: Option<&Tensor>,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let past_len = cache.past_len()?;
        let embed_pos = self.embed_positions.forward(xs, past_len)?;
        let xs = xs.apply(&self.embed_tokens)?;
        let xs = match self.embed_scale {
            None => xs,
            Some(scale) => (xs * scale)?,
        };
        let mut xs = xs.broadcast_add(&embed_pos)?;
        if let Some(layernorm_embedding) = &self.layernorm_embedding {
            xs = layernorm_embedding.forward(&xs)?;
        }
        for (idx, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(
                &xs,
                encoder_xs,
                encoder_mask,
                &mut cache.self_attn[idx],
                &mut cache.cross_attn[idx],
            )?;
        }
        Ok(xs)
    }
}
