//! CLIP re-ranking of generated candidates.
use candle::{DType, Device, Tensor};
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::{Error, Result};

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// How candidates are turned into CLIP pixel values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipPreprocess {
    /// Resize-to-fill to the CLIP input size and normalize each channel with
    /// the CLIP training statistics.
    #[default]
    Normalized,
    /// Resize-to-fill only, pixel values mapped linearly to `[-1, 1]`.
    Unnormalized,
}

impl ClipPreprocess {
    /// Returns a `(3, image_size, image_size)` f32 tensor on the CPU.
    pub fn apply(&self, img: &RgbImage, image_size: usize) -> Result<Tensor> {
        let size = image_size as u32;
        let img = if img.dimensions() == (size, size) {
            img.clone()
        } else {
            image::DynamicImage::ImageRgb8(img.clone())
                .resize_to_fill(size, size, image::imageops::FilterType::CatmullRom)
                .to_rgb8()
        };
        let pixels = Tensor::from_vec(img.into_raw(), (image_size, image_size, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        let pixels = match self {
            Self::Unnormalized => pixels.affine(2. / 255., -1.)?,
            Self::Normalized => {
                let mean = Tensor::new(&CLIP_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
                let std = Tensor::new(&CLIP_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
                (pixels / 255.)?.broadcast_sub(&mean)?.broadcast_div(&std)?
            }
        };
        Ok(pixels)
    }
}

/// Scores candidate images against a single prompt, higher is better.
pub trait ImageScorer {
    fn score(&self, prompt: &str, images: &[RgbImage]) -> Result<Vec<f32>>;
}

pub struct ClipScorer {
    model: ClipModel,
    tokenizer: Tokenizer,
    config: ClipConfig,
    preprocess: ClipPreprocess,
    device: Device,
}

impl ClipScorer {
    pub fn new(
        model: ClipModel,
        tokenizer: Tokenizer,
        config: ClipConfig,
        preprocess: ClipPreprocess,
        device: Device,
    ) -> Self {
        Self {
            model,
            tokenizer,
            config,
            preprocess,
            device,
        }
    }

    fn tokenize(&self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::tokenizer)?;
        let ids = fit_to_context(
            encoding.get_ids().to_vec(),
            self.config.text_config.max_position_embeddings,
        );
        Ok(Tensor::new(vec![ids], &self.device)?)
    }
}

/// Truncates prompt ids to the text context. The final end-of-text token is
/// kept, the text embedding is pooled at its position.
fn fit_to_context(mut ids: Vec<u32>, max_len: usize) -> Vec<u32> {
    if ids.len() > max_len && max_len > 0 {
        let last = ids[ids.len() - 1];
        ids.truncate(max_len);
        ids[max_len - 1] = last;
    }
    ids
}

impl ImageScorer for ClipScorer {
    fn score(&self, prompt: &str, images: &[RgbImage]) -> Result<Vec<f32>> {
        if images.is_empty() {
            return Ok(vec![]);
        }
        let _span = tracing::debug_span!("clip-score", n = images.len()).entered();
        let pixels = images
            .iter()
            .map(|img| self.preprocess.apply(img, self.config.image_size))
            .collect::<Result<Vec<_>>>()?;
        let pixels = Tensor::stack(&pixels, 0)?.to_device(&self.device)?;
        let input_ids = self.tokenize(prompt)?;
        let (logits_per_text, _logits_per_image) = self.model.forward(&pixels, &input_ids)?;
        Ok(logits_per_text
            .get(0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?)
    }
}

/// Indices of the `k` best scores, best first. Ties keep their input order.
pub fn top_k_indices(scores: &[f32], k: usize) -> Result<Vec<usize>> {
    if k > scores.len() {
        return Err(Error::InvalidTopK {
            k,
            candidates: scores.len(),
        });
    }
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.truncate(k);
    Ok(order)
}

/// Keeps the `k` images that best match `prompt`, best first.
pub fn top_k<S: ImageScorer + ?Sized>(
    scorer: &S,
    prompt: &str,
    images: &[RgbImage],
    k: usize,
) -> Result<Vec<RgbImage>> {
    if k > images.len() {
        return Err(Error::InvalidTopK {
            k,
            candidates: images.len(),
        });
    }
    let scores = scorer.score(prompt, images)?;
    if scores.len() != images.len() {
        crate::bail!(
            "scorer returned {} scores for {} images",
            scores.len(),
            images.len()
        )
    }
    let order = top_k_indices(&scores, k)?;
    if let Some(&best) = order.first() {
        tracing::debug!(best = scores[best], "ranked {} candidates", images.len());
    }
    Ok(order.into_iter().map(|i| images[i].clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores an image by its red channel.
    struct Redness;

    impl ImageScorer for Redness {
        fn score(&self, _prompt: &str, images: &[RgbImage]) -> Result<Vec<f32>> {
            Ok(images.iter().map(|img| img.get_pixel(0, 0)[0] as f32).collect())
        }
    }

    fn solid(r: u8) -> RgbImage {
        RgbImage::from_pixel(2, 2, image::Rgb([r, 0, 0]))
    }

    #[test]
    fn top_k_orders_and_keeps_ties_stable() -> Result<()> {
        assert_eq!(top_k_indices(&[0.1, 0.9, 0.5, 0.9], 3)?, vec![1, 3, 2]);
        assert_eq!(top_k_indices(&[1., 2.], 0)?, Vec::<usize>::new());

        let images: Vec<_> = [3, 200, 17, 90, 200].into_iter().map(solid).collect();
        let best = top_k(&Redness, "red", &images, 3)?;
        let reds: Vec<u8> = best.iter().map(|i| i.get_pixel(0, 0)[0]).collect();
        assert_eq!(reds, vec![200, 200, 90]);
        Ok(())
    }

    #[test]
    fn long_prompts_keep_end_of_text() {
        let eot = 49407;
        let ids: Vec<u32> = (0..10).chain([eot]).collect();
        assert_eq!(fit_to_context(ids.clone(), 4), vec![0, 1, 2, eot]);
        assert_eq!(fit_to_context(ids.clone(), 11), ids);
        assert_eq!(fit_to_context(vec![5, eot], 77), vec![5, eot]);
    }

    #[test]
    fn top_k_rejects_large_k() {
        let err = top_k(&Redness, "red", &[solid(1)], 2).unwrap_err();
        assert!(matches!(err, Error::InvalidTopK { k: 2, candidates: 1 }));
    }

    #[test]
    fn preprocess_variants() -> Result<()> {
        let white = RgbImage::from_pixel(8, 4, image::Rgb([255, 255, 255]));
        let unnormalized = ClipPreprocess::Unnormalized.apply(&white, 6)?;
        assert_eq!(unnormalized.dims(), &[3, 6, 6]);
        let min = unnormalized.min_all()?.to_scalar::<f32>()?;
        assert!((min - 1.).abs() < 1e-6);

        let normalized = ClipPreprocess::Normalized.apply(&white, 6)?;
        let red = normalized.get(0)?.flatten_all()?.to_vec1::<f32>()?;
        let expected = (1. - CLIP_MEAN[0]) / CLIP_STD[0];
        assert!(red.iter().all(|v| (v - expected).abs() < 1e-4), "{red:?}");

        let black = RgbImage::new(6, 6);
        let px = ClipPreprocess::Unnormalized.apply(&black, 6)?;
        assert_eq!(px.max_all()?.to_scalar::<f32>()?, -1.);
        Ok(())
    }

    #[test]
    fn preprocess_serde() -> serde_json::Result<()> {
        assert_eq!(ClipPreprocess::default(), ClipPreprocess::Normalized);
        let p: ClipPreprocess = serde_json::from_str("\"unnormalized\"")?;
        assert_eq!(p, ClipPreprocess::Unnormalized);
        Ok(())
    }
}
