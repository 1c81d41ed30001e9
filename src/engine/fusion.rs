//! Pure fusion strategies over per-modality authentication results.

use serde::{Deserialize, Serialize};

use crate::algorithm::BiometricResult;
use crate::common::types::Modality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    WeightedAverage,
    MajorityVoting,
    HighestConfidence,
    Cascade,
}

#[derive(Debug, Clone)]
pub struct FusionResult {
    pub success: bool,
    pub confidence: f64,
    pub strategy: FusionStrategy,
    pub message: String,
}

/// Fixed reliability weight per modality. Iris is the most reliable channel,
/// face the least.
pub fn modality_weight(modality: Modality) -> f64 {
    match modality {
        Modality::Iris => 1.0,
        Modality::Fingerprint => 0.9,
        Modality::Palm => 0.85,
        Modality::Face => 0.8,
    }
}

/// Combine per-modality results into one overall decision. `results` pairs
/// each sub-result with the modality that produced it, in dispatch order.
pub fn fuse(
    results: &[(Modality, BiometricResult)],
    strategy: FusionStrategy,
    threshold: f64,
) -> FusionResult {
    if results.is_empty() {
        return FusionResult {
            success: false,
            confidence: 0.0,
            strategy,
            message: "No results to fuse".to_string(),
        };
    }

    match strategy {
        FusionStrategy::WeightedAverage => weighted_average(results, strategy, threshold),
        FusionStrategy::MajorityVoting => majority_voting(results, strategy),
        FusionStrategy::HighestConfidence => highest_confidence(results, strategy),
        FusionStrategy::Cascade => cascade(results, strategy, threshold),
    }
}

fn weighted_average(
    results: &[(Modality, BiometricResult)],
    strategy: FusionStrategy,
    threshold: f64,
) -> FusionResult {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    let mut all_success = true;

    for (modality, result) in results {
        let weight = modality_weight(*modality);
        weighted_sum += weight * result.confidence;
        total_weight += weight;
        all_success &= result.success;
    }

    let confidence = weighted_sum / total_weight;
    let success = all_success && confidence >= threshold;

    FusionResult {
        success,
        confidence,
        strategy,
        message: format!(
            "Weighted average {:.3} over {} modalities (threshold {:.3})",
            confidence,
            results.len(),
            threshold
        ),
    }
}

fn majority_voting(results: &[(Modality, BiometricResult)], strategy: FusionStrategy) -> FusionResult {
    let successes = results.iter().filter(|(_, r)| r.success).count();
    let success = successes * 2 > results.len();
    let confidence =
        results.iter().map(|(_, r)| r.confidence).sum::<f64>() / results.len() as f64;

    FusionResult {
        success,
        confidence,
        strategy,
        message: format!("{} of {} modalities succeeded", successes, results.len()),
    }
}

fn highest_confidence(
    results: &[(Modality, BiometricResult)],
    strategy: FusionStrategy,
) -> FusionResult {
    // results is non-empty, checked by the caller
    let best = results
        .iter()
        .max_by(|(_, a), (_, b)| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(modality, result)| (*modality, result));

    match best {
        Some((modality, result)) => FusionResult {
            success: result.success,
            confidence: result.confidence,
            strategy,
            message: format!("Best result from {} ({:.3})", modality, result.confidence),
        },
        None => FusionResult {
            success: false,
            confidence: 0.0,
            strategy,
            message: "No results to fuse".to_string(),
        },
    }
}

fn cascade(
    results: &[(Modality, BiometricResult)],
    strategy: FusionStrategy,
    threshold: f64,
) -> FusionResult {
    for (modality, result) in results {
        if result.success && result.confidence >= threshold {
            return FusionResult {
                success: true,
                confidence: result.confidence,
                strategy,
                message: format!("Cascade satisfied by {} ({:.3})", modality, result.confidence),
            };
        }
    }

    FusionResult {
        success: false,
        confidence: 0.0,
        strategy,
        message: format!("No modality reached threshold {:.3}", threshold),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ok(confidence: f64) -> BiometricResult {
        BiometricResult::ok(confidence, Duration::from_millis(1), "ok", None)
    }

    fn fail() -> BiometricResult {
        BiometricResult::fail(Duration::from_millis(1), "no match")
    }

    #[test]
    fn weighted_average_matches_hand_computation() {
        // fingerprint 0.9 conf 0.9, iris 1.0 conf 0.8 -> (0.81 + 0.8) / 1.9
        let results = vec![
            (Modality::Fingerprint, ok(0.9)),
            (Modality::Iris, ok(0.8)),
        ];
        let fused = fuse(&results, FusionStrategy::WeightedAverage, 0.8);
        assert!((fused.confidence - 1.61 / 1.9).abs() < 1e-9);
        assert!((fused.confidence - 0.847).abs() < 1e-3);
        assert!(fused.success);
    }

    #[test]
    fn weighted_average_fails_if_any_subresult_failed() {
        let results = vec![(Modality::Iris, ok(0.99)), (Modality::Face, fail())];
        let fused = fuse(&results, FusionStrategy::WeightedAverage, 0.3);
        assert!(!fused.success);
    }

    #[test]
    fn majority_voting_two_of_three_wins() {
        let results = vec![
            (Modality::Face, ok(0.6)),
            (Modality::Iris, ok(0.7)),
            (Modality::Palm, fail()),
        ];
        let fused = fuse(&results, FusionStrategy::MajorityVoting, 0.99);
        assert!(fused.success);
        assert!((fused.confidence - 1.3 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn majority_voting_exact_half_loses() {
        let results = vec![(Modality::Face, ok(0.9)), (Modality::Iris, fail())];
        let fused = fuse(&results, FusionStrategy::MajorityVoting, 0.0);
        assert!(!fused.success);
    }

    #[test]
    fn highest_confidence_adopts_best_verbatim() {
        let results = vec![(Modality::Face, fail()), (Modality::Iris, ok(0.92))];
        let fused = fuse(&results, FusionStrategy::HighestConfidence, 0.99);
        assert!(fused.success);
        assert_eq!(fused.confidence, 0.92);
    }

    #[test]
    fn cascade_takes_first_qualifying_result() {
        let results = vec![
            (Modality::Face, ok(0.5)),
            (Modality::Fingerprint, ok(0.85)),
            (Modality::Iris, ok(0.95)),
        ];
        let fused = fuse(&results, FusionStrategy::Cascade, 0.8);
        assert!(fused.success);
        assert_eq!(fused.confidence, 0.85);
    }

    #[test]
    fn cascade_with_no_qualifier_fails_with_zero_confidence() {
        let results = vec![(Modality::Face, ok(0.5)), (Modality::Iris, fail())];
        let fused = fuse(&results, FusionStrategy::Cascade, 0.8);
        assert!(!fused.success);
        assert_eq!(fused.confidence, 0.0);
    }

    #[test]
    fn empty_input_fails() {
        let fused = fuse(&[], FusionStrategy::WeightedAverage, 0.5);
        assert!(!fused.success);
    }
}
