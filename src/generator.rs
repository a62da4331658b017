//! Data-parallel image generation.
//!
//! Each device holds a [`Replica`] of the sequence model and the VQGAN
//! decoder. A request for `n` images runs `n / devices` batches, every
//! batch samples and decodes one image per device on the rayon pool.
use candle::{DType, Device, Tensor};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tokenizers::Tokenizer;

use crate::models::dalle_bart::{DalleBart, SampleConfig};
use crate::models::vqgan::VqganDecoder;
use crate::{Error, Result};

/// Upper bound (exclusive) of the per-batch seeds.
pub const SEED_RANGE: u64 = 10_000_000;

/// Per-device model state. Every method only touches the replica's own
/// device, so replicas can run concurrently.
pub trait Replica: Send + Sync {
    /// Samples a full code sequence, decoder start token included.
    fn sample(&self, prompt: &str, seed: u64) -> Result<Vec<u32>>;

    /// Decodes image codes into a `(3, height, width)` tensor with values
    /// nominally in `[0, 1]`.
    fn decode(&self, codes: &[u32]) -> Result<Tensor>;
}

/// Tokenizer settings for the sequence model prompts.
pub fn configure_prompt_tokenizer(
    tokenizer: &mut Tokenizer,
    max_length: usize,
    pad_id: u32,
    pad_token: &str,
) -> Result<()> {
    tokenizer.with_padding(Some(tokenizers::PaddingParams {
        strategy: tokenizers::PaddingStrategy::Fixed(max_length),
        pad_id,
        pad_token: pad_token.to_string(),
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(tokenizers::TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(Error::tokenizer)?;
    Ok(())
}

pub struct DalleReplica {
    device: Device,
    tokenizer: Tokenizer,
    bart: DalleBart,
    vqgan: VqganDecoder,
    params: SampleConfig,
}

impl DalleReplica {
    pub fn new(
        device: Device,
        tokenizer: Tokenizer,
        bart: DalleBart,
        vqgan: VqganDecoder,
        params: SampleConfig,
    ) -> Self {
        Self {
            device,
            tokenizer,
            bart,
            vqgan,
            params,
        }
    }
}

impl Replica for DalleReplica {
    fn sample(&self, prompt: &str, seed: u64) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::tokenizer)?;
        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let mask = Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;
        Ok(self.bart.sample(&input_ids, Some(&mask), &self.params, seed)?)
    }

    fn decode(&self, codes: &[u32]) -> Result<Tensor> {
        Ok(self.vqgan.decode_codes(codes, &self.device)?)
    }
}

/// Converts a `(3, height, width)` tensor to an 8-bit image, values are
/// clamped to `[0, 1]` first.
pub fn tensor_to_image(img: &Tensor) -> Result<RgbImage> {
    let (channel, height, width) = img.dims3()?;
    if channel != 3 {
        return Err(Error::MalformedGeneration(format!(
            "expected 3 channels, got {channel}"
        )));
    }
    let img = (img.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.)?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, img)
        .ok_or_else(|| Error::MalformedGeneration("image buffer size mismatch".to_string()))
}

pub struct ImageGenerator<R> {
    replicas: Vec<R>,
    rng: StdRng,
}

impl<R: Replica> ImageGenerator<R> {
    /// `seed` fixes the stream of per-batch seeds, otherwise it comes from
    /// the OS.
    pub fn new(replicas: Vec<R>, seed: Option<u64>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(Error::NoDevice("no model replica".to_string()));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { replicas, rng })
    }

    pub fn device_count(&self) -> usize {
        self.replicas.len()
    }

    /// Generates exactly `num_images` images for `prompt`, batch-major then
    /// device order.
    pub fn generate(&mut self, prompt: &str, num_images: usize) -> Result<Vec<RgbImage>> {
        let devices = self.replicas.len();
        if num_images % devices != 0 {
            return Err(Error::InvalidBatchSize {
                requested: num_images,
                devices,
            });
        }
        let mut images = Vec::with_capacity(num_images);
        for batch in 0..num_images / devices {
            let seed = self.rng.gen_range(0..SEED_RANGE);
            let _span = tracing::debug_span!("batch", batch, seed).entered();
            let mut key_rng = StdRng::seed_from_u64(seed);
            let keys: Vec<u64> = (0..devices).map(|_| key_rng.gen()).collect();

            let sequences = self
                .replicas
                .par_iter()
                .zip(keys.par_iter())
                .map(|(replica, &key)| replica.sample(prompt, key))
                .collect::<Result<Vec<_>>>()?;

            let decoded = self
                .replicas
                .par_iter()
                .zip(sequences.par_iter())
                .map(|(replica, tokens)| {
                    // The first token is the decoder start token, not an image code.
                    let codes = tokens.get(1..).filter(|c| !c.is_empty()).ok_or_else(|| {
                        Error::MalformedGeneration(format!(
                            "sequence of {} tokens has no image codes",
                            tokens.len()
                        ))
                    })?;
                    tensor_to_image(&replica.decode(codes)?)
                })
                .collect::<Result<Vec<_>>>()?;
            images.extend(decoded);
        }
        tracing::debug!(prompt, count = images.len(), "generated candidates");
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Encodes the device index and key parity in the pixels.
    struct FakeReplica {
        index: u32,
        device: Device,
        calls: AtomicUsize,
    }

    impl FakeReplica {
        fn new(index: u32) -> Self {
            Self {
                index,
                device: Device::Cpu,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Replica for FakeReplica {
        fn sample(&self, _prompt: &str, seed: u64) -> Result<Vec<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![16384, self.index, (seed % 2) as u32, 0, 0])
        }

        fn decode(&self, codes: &[u32]) -> Result<Tensor> {
            assert_eq!(codes.len(), 4);
            let index = codes[0] as f32 / 10.;
            let parity = codes[1] as f32;
            Ok(Tensor::new(&[[[index]], [[parity]], [[0f32]]], &self.device)?)
        }
    }

    fn replicas(n: u32) -> Vec<FakeReplica> {
        (0..n).map(FakeReplica::new).collect()
    }

    #[test]
    fn generates_device_minor_order() -> Result<()> {
        let mut generator = ImageGenerator::new(replicas(4), Some(0))?;
        let images = generator.generate("a prompt", 8)?;
        assert_eq!(images.len(), 8);
        let firsts: Vec<u8> = images.iter().map(|i| i.get_pixel(0, 0)[0]).collect();
        // Values 0.0, 0.1, 0.2, 0.3 scaled by 255 and truncated.
        let expected: Vec<u8> = [0f32, 0.1, 0.2, 0.3]
            .iter()
            .map(|v| (v.clamp(0., 1.) * 255.) as u8)
            .collect();
        assert_eq!(&firsts[..4], &expected[..]);
        assert_eq!(&firsts[4..], &expected[..]);
        for replica in generator.replicas.iter() {
            assert_eq!(replica.calls.load(Ordering::SeqCst), 2);
        }
        Ok(())
    }

    #[test]
    fn invalid_batch_size() -> Result<()> {
        let mut generator = ImageGenerator::new(replicas(8), None)?;
        let err = generator.generate("a prompt", 30).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidBatchSize {
                requested: 30,
                devices: 8
            }
        ));
        assert!(generator.generate("a prompt", 0)?.is_empty());
        assert_eq!(generator.generate("a prompt", 16)?.len(), 16);
        Ok(())
    }

    #[test]
    fn fixed_seed_is_reproducible() -> Result<()> {
        let run = |seed| -> Result<Vec<[u8; 3]>> {
            let mut generator = ImageGenerator::new(replicas(2), Some(seed))?;
            let images = generator.generate("a prompt", 16)?;
            Ok(images.iter().map(|img| img.get_pixel(0, 0).0).collect())
        };
        let first = run(7)?;
        assert_eq!(first.len(), 16);
        assert_eq!(first, run(7)?);
        assert!(first.iter().all(|px| px[1] == 0 || px[1] == 255));
        Ok(())
    }

    #[test]
    fn clamps_pixels() -> Result<()> {
        let img = Tensor::new(&[[[-0.5f32, 0.5]], [[1.5, 1.0]], [[0.0, 0.25]]], &Device::Cpu)?;
        let img = tensor_to_image(&img)?;
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0).0, [0, 255, 0]);
        assert_eq!(img.get_pixel(1, 0).0, [127, 255, 63]);
        assert!(tensor_to_image(&Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu)?).is_err());
        Ok(())
    }

    #[test]
    fn no_replicas() {
        assert!(matches!(
            ImageGenerator::<FakeReplica>::new(vec![], None),
            Err(Error::NoDevice(_))
        ));
    }
}
