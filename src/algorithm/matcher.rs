//! Shared sample pipeline used by the in-memory modality algorithms:
//! decode gate, quality gate, feature extraction, similarity matching.

use std::fmt;

pub type Embedding = Vec<f32>;

/// Smallest sample the decode stage will accept.
pub const MIN_SAMPLE_LEN: usize = 16;

/// Number of histogram bins used by the reference feature extractor.
pub const EMBEDDING_DIM: usize = 64;

/// Stage that rejected a sample during enrollment or authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRejection {
    Decode,
    Quality,
    FeatureExtraction,
    FeatureCount,
}

impl fmt::Display for SampleRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SampleRejection::Decode => "decode",
            SampleRejection::Quality => "quality",
            SampleRejection::FeatureExtraction => "feature extraction",
            SampleRejection::FeatureCount => "minimum feature count",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SampleQuality {
    pub brightness_score: f64,
    pub contrast_score: f64,
    pub overall_score: f64,
}

impl SampleQuality {
    /// Score a raw sample from its intensity statistics.
    pub fn measure(sample: &[u8]) -> Self {
        if sample.is_empty() {
            return Self {
                brightness_score: 0.0,
                contrast_score: 0.0,
                overall_score: 0.0,
            };
        }

        let mut sum = 0u64;
        let mut sum_sq = 0u64;
        for &b in sample {
            let v = b as u64;
            sum += v;
            sum_sq += v * v;
        }

        let n = sample.len() as f64;
        let mean = sum as f64 / n;
        let variance = (sum_sq as f64 / n) - mean * mean;
        let std_dev = variance.max(0.0).sqrt();

        // Ideal mean is mid-range; std dev of 64 counts as full contrast.
        let brightness_score = 1.0 - ((mean - 127.5).abs() / 127.5).min(1.0);
        let contrast_score = (std_dev / 64.0).min(1.0);
        let overall_score = brightness_score * 0.5 + contrast_score * 0.5;

        Self {
            brightness_score,
            contrast_score,
            overall_score,
        }
    }

    pub fn meets_minimum(&self, min_quality: f64) -> bool {
        self.overall_score >= min_quality
    }
}

/// Extract a normalized intensity-histogram embedding from a raw sample.
/// Deterministic: the same bytes always produce the same embedding.
pub fn extract_embedding(sample: &[u8]) -> Embedding {
    let mut bins = vec![0f32; EMBEDDING_DIM];
    for &b in sample {
        bins[(b as usize) * EMBEDDING_DIM / 256] += 1.0;
    }

    let norm: f32 = bins.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for b in bins.iter_mut() {
            *b /= norm;
        }
    }
    bins
}

/// Count of non-empty histogram bins, used as the feature-count gate.
pub fn feature_count(embedding: &Embedding) -> usize {
    embedding.iter().filter(|&&v| v > 0.0).count()
}

pub fn cosine_similarity(a: &Embedding, b: &Embedding) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varied_sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 % 256) as u8).collect()
    }

    #[test]
    fn identical_samples_have_unit_similarity() {
        let sample = varied_sample(256);
        let a = extract_embedding(&sample);
        let b = extract_embedding(&sample);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_score_zero() {
        let a = vec![1.0f32; 8];
        let b = vec![1.0f32; 4];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn flat_sample_has_no_contrast() {
        let q = SampleQuality::measure(&[128u8; 64]);
        assert_eq!(q.contrast_score, 0.0);
        assert!(q.brightness_score > 0.99);
    }

    #[test]
    fn varied_sample_passes_default_quality() {
        let q = SampleQuality::measure(&varied_sample(512));
        assert!(q.meets_minimum(0.2), "overall {}", q.overall_score);
    }

    #[test]
    fn feature_count_reflects_spread() {
        let narrow = extract_embedding(&[10u8; 100]);
        let wide = extract_embedding(&varied_sample(512));
        assert_eq!(feature_count(&narrow), 1);
        assert!(feature_count(&wide) > 8);
    }
}
