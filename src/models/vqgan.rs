//! VQGAN image decoder.
//!
//! Maps a grid of codebook indices back to pixels: codebook lookup, a 1x1
//! `post_quant_conv`, then the taming-transformers convolutional decoder.
//! Weights follow the taming naming (`decoder.up.{level}.block.{idx}`, ...).
//!
//! - [Taming Transformers](https://arxiv.org/abs/2012.09841)
use candle::{Device, Result, Tensor};
use candle_nn as nn;
use candle_nn::Module;
use candle_transformers::models::with_tracing::{conv2d, Conv2d};

fn default_attn_resolutions() -> Vec<usize> {
    vec![16]
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct VqganConfig {
    pub ch: usize,
    pub out_ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    #[serde(default = "default_attn_resolutions")]
    pub attn_resolutions: Vec<usize>,
    pub resolution: usize,
    pub z_channels: usize,
    pub embed_dim: usize,
    pub n_embed: usize,
}

impl VqganConfig {
    /// `dalle-mini/vqgan_imagenet_f16_16384`.
    pub fn f16_16384() -> Self {
        Self {
            ch: 128,
            out_ch: 3,
            ch_mult: vec![1, 1, 2, 2, 4],
            num_res_blocks: 2,
            attn_resolutions: vec![16],
            resolution: 256,
            z_channels: 256,
            embed_dim: 256,
            n_embed: 16384,
        }
    }

    /// Side of the code grid, 16 for the f16 models.
    pub fn latent_size(&self) -> usize {
        self.resolution >> self.ch_mult.len().saturating_sub(1)
    }
}

fn group_norm(channels: usize, vb: nn::VarBuilder) -> Result<nn::GroupNorm> {
    nn::group_norm(32, channels, 1e-6, vb)
}

fn swish(xs: &Tensor) -> Result<Tensor> {
    nn::ops::silu(xs)
}

fn conv3() -> nn::Conv2dConfig {
    nn::Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

#[derive(Debug)]
struct ResnetBlock {
    norm1: nn::GroupNorm,
    conv1: Conv2d,
    norm2: nn::GroupNorm,
    conv2: Conv2d,
    nin_shortcut: Option<Conv2d>,
    span: tracing::Span,
}

impl ResnetBlock {
    fn new(vb: nn::VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        let norm1 = group_norm(in_channels, vb.pp("norm1"))?;
        let conv1 = conv2d(in_channels, out_channels, 3, conv3(), vb.pp("conv1"))?;
        let norm2 = group_norm(out_channels, vb.pp("norm2"))?;
        let conv2 = conv2d(out_channels, out_channels, 3, conv3(), vb.pp("conv2"))?;
        let nin_shortcut = if in_channels != out_channels {
            Some(conv2d(
                in_channels,
                out_channels,
                1,
                Default::default(),
                vb.pp("nin_shortcut"),
            )?)
        } else {
            None
        };
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            nin_shortcut,
            span: tracing::span!(tracing::Level::TRACE, "vq-resnet"),
        })
    }
}

impl Module for ResnetBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let hs = self.conv1.forward(&swish(&self.norm1.forward(xs)?)?)?;
        let hs = self.conv2.forward(&swish(&self.norm2.forward(&hs)?)?)?;
        let residual = match &self.nin_shortcut {
            Some(conv) => conv.forward(xs)?,
            None => xs.clone(),
        };
        residual + hs
    }
}

/// Single head spatial self-attention with 1x1 convolution projections.
#[derive(Debug)]
struct AttnBlock {
    norm: nn::GroupNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
    span: tracing::Span,
}

impl AttnBlock {
    fn new(vb: nn::VarBuilder, channels: usize) -> Result<Self> {
        let conv = |name: &str| conv2d(channels, channels, 1, Default::default(), vb.pp(name));
        Ok(Self {
            norm: group_norm(channels, vb.pp("norm"))?,
            q: conv("q")?,
            k: conv("k")?,
            v: conv("v")?,
            proj_out: conv("proj_out")?,
            span: tracing::span!(tracing::Level::TRACE, "vq-attn"),
        })
    }
}

impl Module for AttnBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, c, h, w) = xs.dims4()?;
        let hs = self.norm.forward(xs)?;
        let q = self
            .q
            .forward(&hs)?
            .reshape((b, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self.k.forward(&hs)?.reshape((b, c, h * w))?;
        let v = self.v.forward(&hs)?.reshape((b, c, h * w))?;
        let scale = (c as f64).powf(-0.5);
        let attn = (q.matmul(&k)? * scale)?;
        let attn = nn::ops::softmax_last_dim(&attn)?;
        let hs = v
            .matmul(&attn.t()?.contiguous()?)?
            .reshape((b, c, h, w))?;
        xs + self.proj_out.forward(&hs)?
    }
}

#[derive(Debug)]
struct Upsample {
    conv: Conv2d,
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = xs.dims4()?;
        self.conv.forward(&xs.upsample_nearest2d(2 * h, 2 * w)?)
    }
}

#[derive(Debug)]
struct UpLevel {
    blocks: Vec<ResnetBlock>,
    attns: Vec<AttnBlock>,
    upsample: Option<Upsample>,
}

#[derive(Debug)]
struct Decoder {
    conv_in: Conv2d,
    mid_block_1: ResnetBlock,
    mid_attn_1: AttnBlock,
    mid_block_2: ResnetBlock,
    /// Indexed by resolution level, applied from the last to the first.
    up: Vec<UpLevel>,
    norm_out: nn::GroupNorm,
    conv_out: Conv2d,
    span: tracing::Span,
}

impl Decoder {
    fn new(vb: nn::VarBuilder, cfg: &VqganConfig) -> Result<Self> {
        let levels = cfg.ch_mult.len();
        let mut block_in = cfg.ch * cfg.ch_mult[levels - 1];
        let mut curr_res = cfg.latent_size();
        let conv_in = conv2d(cfg.z_channels, block_in, 3, conv3(), vb.pp("conv_in"))?;
        let vb_mid = vb.pp("mid");
        let mid_block_1 = ResnetBlock::new(vb_mid.pp("block_1"), block_in, block_in)?;
        let mid_attn_1 = AttnBlock::new(vb_mid.pp("attn_1"), block_in)?;
        let mid_block_2 = ResnetBlock::new(vb_mid.pp("block_2"), block_in, block_in)?;

        let vb_up = vb.pp("up");
        let mut up = Vec::with_capacity(levels);
        for level in (0..levels).rev() {
            let vb_level = vb_up.pp(level);
            let block_out = cfg.ch * cfg.ch_mult[level];
            let mut blocks = vec![];
            let mut attns = vec![];
            for idx in 0..=cfg.num_res_blocks {
                blocks.push(ResnetBlock::new(
                    vb_level.pp("block").pp(idx),
                    block_in,
                    block_out,
                )?);
                block_in = block_out;
                if cfg.attn_resolutions.contains(&curr_res) {
                    attns.push(AttnBlock::new(vb_level.pp("attn").pp(idx), block_in)?);
                }
            }
            let upsample = if level != 0 {
                curr_res *= 2;
                let conv = conv2d(block_in, block_in, 3, conv3(), vb_level.pp("upsample.conv"))?;
                Some(Upsample { conv })
            } else {
                None
            };
            up.push(UpLevel {
                blocks,
                attns,
                upsample,
            });
        }
        up.reverse();
        let norm_out = group_norm(block_in, vb.pp("norm_out"))?;
        let conv_out = conv2d(block_in, cfg.out_ch, 3, conv3(), vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            mid_block_1,
            mid_attn_1,
            mid_block_2,
            up,
            norm_out,
            conv_out,
            span: tracing::span!(tracing::Level::TRACE, "vq-decoder"),
        })
    }
}

impl Module for Decoder {
    fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = self.conv_in.forward(z)?;
        xs = self.mid_block_1.forward(&xs)?;
        xs = self.mid_attn_1.forward(&xs)?;
        xs = self.mid_block_2.forward(&xs)?;
        for level in self.up.iter().rev() {
            for (idx, block) in level.blocks.iter().enumerate() {
                xs = block.forward(&xs)?;
                if let Some(attn) = level.attns.get(idx) {
                    xs = attn.forward(&xs)?;
                }
            }
            if let Some(upsample) = &level.upsample {
                xs = upsample.forward(&xs)?;
            }
        }
        let xs = swish(&self.norm_out.forward(&xs)?)?;
        self.conv_out.forward(&xs)
    }
}

#[derive(Debug)]
pub struct VqganDecoder {
    codebook: nn::Embedding,
    post_quant_conv: Conv2d,
    decoder: Decoder,
    config: VqganConfig,
}

impl VqganDecoder {
    pub fn new(cfg: &VqganConfig, vb: nn::VarBuilder) -> Result<Self> {
        let codebook = nn::embedding(cfg.n_embed, cfg.embed_dim, vb.pp("quantize.embedding"))?;
        let post_quant_conv = conv2d(
            cfg.embed_dim,
            cfg.z_channels,
            1,
            Default::default(),
            vb.pp("post_quant_conv"),
        )?;
        let decoder = Decoder::new(vb.pp("decoder"), cfg)?;
        Ok(Self {
            codebook,
            post_quant_conv,
            decoder,
            config: cfg.clone(),
        })
    }

    /// Decodes `(batch, latent_size * latent_size)` codebook indices into
    /// `(batch, out_ch, resolution, resolution)` pixels.
    pub fn decode(&self, indices: &Tensor) -> Result<Tensor> {
        let (b, len) = indices.dims2()?;
        let side = self.config.latent_size();
        if len != side * side {
            candle::bail!("expected {} codes per image, got {len}", side * side)
        }
        let z = self
            .codebook
            .forward(indices)?
            .reshape((b, side, side, self.config.embed_dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let z = self.post_quant_conv.forward(&z)?;
        self.decoder.forward(&z)
    }

    /// Decodes a single code sequence, out of range codes are clamped to the
    /// last codebook entry.
    pub fn decode_codes(&self, codes: &[u32], device: &Device) -> Result<Tensor> {
        let last = self.config.n_embed.saturating_sub(1) as u32;
        let codes: Vec<u32> = codes.iter().map(|&c| c.min(last)).collect();
        let len = codes.len();
        let indices = Tensor::from_vec(codes, (1, len), device)?;
        self.decode(&indices)?.squeeze(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::DType;
    use candle_nn::VarMap;

    fn tiny() -> VqganConfig {
        VqganConfig {
            ch: 32,
            out_ch: 3,
            ch_mult: vec![1, 2],
            num_res_blocks: 1,
            attn_resolutions: vec![4],
            resolution: 8,
            z_channels: 8,
            embed_dim: 8,
            n_embed: 16,
        }
    }

    #[test]
    fn latent_sizes() {
        assert_eq!(VqganConfig::f16_16384().latent_size(), 16);
        assert_eq!(tiny().latent_size(), 4);
    }

    #[test]
    fn decode_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let vqgan = VqganDecoder::new(&tiny(), vb)?;
        let codes: Vec<u32> = (0..16).collect();
        let img = vqgan.decode_codes(&codes, &device)?;
        assert_eq!(img.dims(), &[3, 8, 8]);

        // Out of range codes decode like the last entry.
        let mut clamped = codes.clone();
        clamped[3] = 15;
        let mut wild = codes;
        wild[3] = 50_000;
        let a = vqgan.decode_codes(&clamped, &device)?;
        let b = vqgan.decode_codes(&wild, &device)?;
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.);

        let batch = Tensor::zeros((2, 16), DType::U32, &device)?;
        assert_eq!(vqgan.decode(&batch)?.dims(), &[2, 3, 8, 8]);
        assert!(vqgan.decode_codes(&[0; 5], &device).is_err());
        Ok(())
    }
}
