//! Per-prompt generate, rank and compose loop, flushed as one history row.
use crate::generator::{ImageGenerator, Replica};
use crate::ranker::{self, ImageScorer};
use crate::strip::{captioned_strip, CaptionStyle};
use crate::tracking::{HistoryRow, LogValue, LoggedImage, TrackedRun};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSettings {
    /// Candidates generated per prompt.
    pub num_images: usize,
    /// Candidates kept per prompt.
    pub top_k: usize,
    pub rows: usize,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            num_images: 32,
            top_k: 8,
            rows: 1,
        }
    }
}

pub struct Reporter<'a, R, S: ?Sized> {
    pub generator: &'a mut ImageGenerator<R>,
    pub scorer: &'a S,
    pub style: &'a CaptionStyle,
    pub settings: ReportSettings,
}

impl<R: Replica, S: ImageScorer + ?Sized> Reporter<'_, R, S> {
    /// Best candidates for a single prompt, composed into a captioned strip.
    pub fn strip_for(&mut self, prompt: &str) -> Result<LoggedImage> {
        let images = self.generator.generate(prompt, self.settings.num_images)?;
        let selected = ranker::top_k(self.scorer, prompt, &images, self.settings.top_k)?;
        let image = captioned_strip(&selected, Some(prompt), self.settings.rows, self.style)?;
        Ok(LoggedImage {
            image,
            caption: Some(prompt.to_string()),
        })
    }

    /// Runs every prompt, then logs all strips with the model version in a
    /// single call. Nothing is logged if any prompt fails.
    pub fn report<T: TrackedRun>(
        &mut self,
        run: &mut T,
        prompts: &[String],
        version: &str,
    ) -> Result<usize> {
        let mut strips = Vec::with_capacity(prompts.len());
        for (idx, prompt) in prompts.iter().enumerate() {
            tracing::info!("generating candidates for: {prompt} ({}/{})", idx + 1, prompts.len());
            strips.push(self.strip_for(prompt)?);
        }
        let count = strips.len();
        run.log(
            HistoryRow::new()
                .with("images", LogValue::Images(strips))
                .with("version", LogValue::Text(version.to_string())),
        )
        .map_err(|e| e.context("logging strips"))?;
        tracing::info!(version, count, "logged strips");
        Ok(count)
    }
}
