use candle::{Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::with_tracing::{linear, Linear};

/// Multi-head attention, the key/value cache lives outside the model.
#[derive(Debug, Clone)]
pub struct Attention {
    head_dim: usize,
    num_heads: usize,
    scaling: f64,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    span: tracing::Span,
}

impl Attention {
    pub fn load(vb: VarBuilder, embed_dim: usize, num_heads: usize) -> Result<Self> {
        let head_dim = embed_dim / num_heads;
        let q_proj = linear(embed_dim, embed_dim, vb.pp("q_proj"))?;
        let k_proj = linear(embed_dim, embed_dim, vb.pp("k_proj"))?;
        let v_proj = linear(embed_dim, embed_dim, vb.pp("v_proj"))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;
        Ok(Self {
            head_dim,
            num_heads,
            scaling: 1.0 / (head_dim as f64).sqrt(),
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            span: tracing::span!(tracing::Level::TRACE, "attn"),
        })
    }

    fn shape(&self, tensor: &Tensor, bsz: usize) -> Result<Tensor> {
        tensor
            .reshape((bsz, (), self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Attends `xs` to itself (`kv_states` is `None`) or to the encoder output.
    ///
    /// Self-attention appends the new keys and values to `cache`; cross
    /// attention fills `cache` on the first call and reuses it afterwards.
    /// `attn_mask` is additive and broadcast over heads and query positions.
    pub fn forward(
        &self,
        xs: &Tensor,
        kv_states: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, tgt_len, _) = xs.dims3()?;
        let query_states = (xs.apply(&self.q_proj)? * self.scaling)?;

        let (key_states, value_states) = match (kv_states, cache) {
            (None, None) => (
                self.shape(&xs.apply(&self.k_proj)?, b_sz)?,
                self.shape(&xs.apply(&self.v_proj)?, b_sz)?,
            ),
            (None, Some(cache)) => {
                let key_states = self.shape(&xs.apply(&self.k_proj)?, b_sz)?;
                let value_states = self.shape(&xs.apply(&self.v_proj)?, b_sz)?;
                let kv = match cache.as_ref() {
                    None => (key_states, value_states),
                    Some((cached_k, cached_v)) => (
                        Tensor::cat(&[cached_k, &key_states], 2)?,
                        Tensor::cat(&[cached_v, &value_states], 2)?,
                    ),
                };
                *cache = Some(kv.clone());
                kv
            }
            (Some(kv_states), None) => (
                self.shape(&kv_states.apply(&self.k_proj)?, b_sz)?,
                self.shape(&kv_states.apply(&self.v_proj)?, b_sz)?,
            ),
            (Some(kv_states), Some(cache)) => match cache.as_ref() {
                Some(kv) => kv.clone(),
                None => {
                    let kv = (
                        self.shape(&kv_states.apply(&self.k_proj)?, b_sz)?,
                        self.shape(&kv_states.apply(&self.v_proj)?, b_sz)?,
                    );
                    *cache = Some(kv.clone());
                    kv
                }
            },
        };

        let proj_shape = (b_sz * self.num_heads, (), self.head_dim);
        let query_states = self.shape(&query_states, b_sz)?.reshape(proj_shape)?;
        let src_len = key_states.dim(2)?;
        let key_states = key_states.reshape(proj_shape)?;
        let value_states = value_states.reshape(proj_shape)?;

        let attn_weights = query_states.matmul(&key_states.transpose(1, 2)?)?;
        let attn_weights = match attn_mask {
            None => attn_weights,
            Some(attn_mask) => attn_weights
                .reshape((b_sz, self.num_heads, tgt_len, src_len))?
                .broadcast_add(attn_mask)?
                .reshape((b_sz * self.num_heads, tgt_len, src_len))?,
        };
        let attn_probs = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_probs.matmul(&value_states)?;

        attn_output
            .reshape((b_sz, self.num_heads, tgt_len, self.head_dim))?
            .transpose(1, 2)?
            .reshape((b_sz, tgt_len, self.head_dim * self.num_heads))?
            .apply(&self.out_proj)
    }
}

/// Turns a `(batch, src_len)` 0/1 padding mask into an additive mask of
/// shape `(batch, 1, 1, src_len)`.
pub fn expand_padding_mask(mask: &Tensor, dtype: candle::DType) -> Result<Tensor> {
    let (b_sz, src_len) = mask.dims2()?;
    let mask = mask.to_dtype(candle::DType::F32)?;
    let inverted = (mask.ones_like()? - mask)?;
    (inverted * f32::MIN as f64)?
        .to_dtype(dtype)?
        .reshape((b_sz, 1, 1, src_len))
}
