//! Ranking of raw per-label probabilities.

use serde::Serialize;
use std::cmp::Ordering;

use crate::error::{CoachError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

/// Per-label confidences in label order plus a stable descending view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    entries: Vec<Prediction>,
    #[serde(skip)]
    order: Vec<usize>,
}

pub fn rank<S: AsRef<str>>(labels: &[S], probabilities: &[f32]) -> Result<RankedResult> {
    if labels.len() != probabilities.len() {
        return Err(CoachError::ShapeMismatch(format!(
            "{} labels but {} probabilities",
            labels.len(),
            probabilities.len()
        )));
    }
    let entries: Vec<Prediction> = labels
        .iter()
        .zip(probabilities)
        .map(|(l, p)| Prediction { label: l.as_ref().to_string(), confidence: *p })
        .collect();
    let mut order: Vec<usize> = (0..entries.len()).collect();
    // sort_by is stable: equal confidences keep label order
    order.sort_by(|&a, &b| descending(entries[a].confidence, entries[b].confidence));
    Ok(RankedResult { entries, order })
}

// NaN sorts after every number.
fn descending(a: f32, b: f32) -> Ordering {
    let key = |v: f32| if v.is_nan() { f32::NEG_INFINITY } else { v };
    key(b).total_cmp(&key(a))
}

impl RankedResult {
    pub fn entries(&self) -> &[Prediction] { &self.entries }

    /// Entries ordered by confidence, highest first.
    pub fn sorted(&self) -> impl Iterator<Item = &Prediction> + '_ {
        self.order.iter().map(move |&i| &self.entries[i])
    }

    pub fn best(&self) -> Option<&Prediction> {
        self.order.first().map(|&i| &self.entries[i])
    }

    pub fn worst(&self) -> Option<&Prediction> {
        self.order.last().map(|&i| &self.entries[i])
    }

    pub fn top(&self, k: usize) -> Vec<&Prediction> { self.sorted().take(k).collect() }

    pub fn confidence_of(&self, label: &str) -> Option<f32> {
        self.entries.iter().find(|p| p.label == label).map(|p| p.confidence)
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}
