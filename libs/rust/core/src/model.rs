//! Loaded classifier: graph backend + labels + normalization parameters.

use std::time::Instant;
use tracing::{debug, instrument};

use crate::backend::InferenceBackend;
use crate::error::{CoachError, Result};
use crate::metrics::COACH_METRICS;
use crate::normalize::{normalize, ImageSource, NormalizeParams};
use crate::ranking::{rank, RankedResult};

pub const DEFAULT_INPUT_TENSOR: &str = "lambda_input";
pub const DEFAULT_OUTPUT_TENSOR: &str = "output/Softmax";

/// Artifact format revisions this loader understands. Each one fixes the
/// pixel scale its graphs were trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Raw 0..255 pixel values.
    V1,
    /// Pixels scaled to 0..1.
    V2,
}

impl FormatVersion {
    pub const SUPPORTED: [FormatVersion; 2] = [FormatVersion::V1, FormatVersion::V2];

    pub fn number(self) -> f64 {
        match self {
            FormatVersion::V1 => 1.0,
            FormatVersion::V2 => 2.0,
        }
    }

    pub fn pixel_scale(self) -> f32 {
        match self {
            FormatVersion::V1 => 1.0,
            FormatVersion::V2 => 255.0,
        }
    }

    pub fn from_declared(declared: f64) -> Result<Self> {
        Self::SUPPORTED.into_iter().find(|v| v.number() == declared).ok_or_else(|| {
            let supported = Self::SUPPORTED.iter().map(|v| v.number().to_string()).collect::<Vec<_>>().join(", ");
            CoachError::IncompatibleVersion { found: declared, supported }
        })
    }
}

/// Input side length encoded in the last three characters of a base module
/// name, e.g. `mobilenet_v2_224` -> 224, `tiny_035` -> 35.
pub fn input_size_from_module(module: &str) -> Result<u32> {
    let invalid = || CoachError::InvalidBaseModule { module: module.to_string() };
    let bytes = module.as_bytes();
    if bytes.len() < 3 {
        return Err(invalid());
    }
    let suffix = &bytes[bytes.len() - 3..];
    if !suffix.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    let size = suffix.iter().fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0'));
    if size == 0 {
        return Err(invalid());
    }
    Ok(size)
}

pub struct ModelHandle<B: InferenceBackend> {
    graph: B,
    labels: Vec<String>,
    params: NormalizeParams,
    format: FormatVersion,
}

impl<B: InferenceBackend> std::fmt::Debug for ModelHandle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("labels", &self.labels.len())
            .field("params", &self.params)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl<B: InferenceBackend> ModelHandle<B> {
    /// Takes ownership of `graph`. The version gate runs first, so an
    /// unsupported artifact never yields a handle.
    pub fn construct(graph: B, labels: Vec<String>, base_module: &str, format_version: f64) -> Result<Self> {
        let format = FormatVersion::from_declared(format_version)?;
        let target_size = input_size_from_module(base_module)?;
        let params = NormalizeParams { target_size, pixel_mean: 0.0, pixel_scale: format.pixel_scale() };
        debug!(base_module, target_size, ?format, labels = labels.len(), "model handle constructed");
        Ok(Self { graph, labels, params, format })
    }

    pub fn labels(&self) -> &[String] { &self.labels }
    pub fn input_size(&self) -> u32 { self.params.target_size }
    pub fn pixel_mean(&self) -> f32 { self.params.pixel_mean }
    pub fn pixel_scale(&self) -> f32 { self.params.pixel_scale }
    pub fn format_version(&self) -> FormatVersion { self.format }

    #[instrument(skip_all, fields(input = input_name, output = output_name))]
    pub fn predict<'a>(&mut self, image: impl Into<ImageSource<'a>>, input_name: &str, output_name: &str) -> Result<RankedResult> {
        let start = Instant::now();
        let tensor = normalize(image.into(), self.params)?;
        let output = self.graph.run(&tensor, input_name, output_name).map_err(CoachError::Backend)?;

        if output.shape.len() != 2 || output.shape[0] != 1 {
            return Err(CoachError::ShapeMismatch(format!("expected output shape [1, N], got {:?}", output.shape)));
        }
        if output.values.len() != output.shape[1] {
            return Err(CoachError::ShapeMismatch(format!(
                "output declares {} values but carries {}",
                output.shape[1],
                output.values.len()
            )));
        }
        let result = rank(&self.labels, &output.values)?;
        COACH_METRICS.predict_latency_ms.record(start.elapsed().as_secs_f64() * 1000.0, &[]);
        Ok(result)
    }

    /// [`predict`](Self::predict) with the conventional tensor names.
    pub fn classify<'a>(&mut self, image: impl Into<ImageSource<'a>>) -> Result<RankedResult> {
        self.predict(image, DEFAULT_INPUT_TENSOR, DEFAULT_OUTPUT_TENSOR)
    }
}
