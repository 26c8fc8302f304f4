//! Thresholding of raw detections into explicit-content flags.

use crate::detection::Detection;
use serde::Serialize;

/// Detections must score strictly above this to be flagged.
pub const EXPLICIT_THRESHOLD: f32 = 0.50;

pub const EXPLICIT_LABELS: [&str; 4] = [
    "FEMALE_BREAST_EXPOSED",
    "BUTTOCKS_EXPOSED",
    "FEMALE_GENITALIA_EXPOSED",
    "MALE_GENITALIA_EXPOSED",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlaggedDetection {
    #[serde(rename = "class")]
    pub label: String,
    pub score_percentage: f64,
    pub explicit: bool,
    #[serde(rename = "box")]
    pub region: [f32; 4],
}

/// Keeps detections with `confidence > threshold` whose label is sensitive, in input order.
pub fn filter(
    detections: &[Detection],
    threshold: f32,
    sensitive_labels: &[&str],
) -> Vec<FlaggedDetection> {
    detections
        .iter()
        .filter(|d| d.confidence > threshold && sensitive_labels.contains(&d.label.as_str()))
        .map(|d| FlaggedDetection {
            label: d.label.clone(),
            score_percentage: to_percentage(d.confidence),
            explicit: true,
            region: d.region,
        })
        .collect()
}

pub fn explicit_content(detections: &[Detection]) -> Vec<FlaggedDetection> {
    filter(detections, EXPLICIT_THRESHOLD, &EXPLICIT_LABELS)
}

fn to_percentage(confidence: f32) -> f64 {
    (f64::from(confidence) * 10_000.0).round() / 100.0
}
