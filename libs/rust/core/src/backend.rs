//! Graph execution boundary.
//!
//! A backend is built from serialized graph bytes and evaluates one named
//! output for one named input. It owns whatever native resources the engine
//! needs and releases them on drop.

use crate::error::BackendError;
use crate::normalize::ImageTensor;

/// Raw output tensor as returned by the engine, before any shape checks.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

pub trait InferenceBackend: Send + Sized {
    /// Imports a serialized graph definition.
    fn import(graph_def: &[u8]) -> Result<Self, BackendError>;

    fn run(&mut self, input: &ImageTensor, input_name: &str, output_name: &str) -> Result<RawOutput, BackendError>;
}

#[cfg(feature = "tensorflow")]
pub use self::tract_tf::TractBackend;

#[cfg(feature = "tensorflow")]
mod tract_tf {
    use super::*;
    use std::collections::HashMap;
    use tract_tensorflow::prelude::*;
    use tracing::debug;

    type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

    /// TensorFlow GraphDef executed with tract. Optimized plans are built per
    /// (input, output, size) on first use and kept for the handle's lifetime.
    pub struct TractBackend {
        graph: InferenceModel,
        plans: HashMap<(String, String, usize), Plan>,
    }

    impl TractBackend {
        fn plan(&mut self, input_name: &str, output_name: &str, size: usize) -> TractResult<&Plan> {
            let key = (input_name.to_string(), output_name.to_string(), size);
            if !self.plans.contains_key(&key) {
                debug!(input_name, output_name, size, "building execution plan");
                let plan = self
                    .graph
                    .clone()
                    .with_input_names([input_name])?
                    .with_output_names([output_name])?
                    .with_input_fact(0, f32::fact([1, size, size, 3]).into())?
                    .into_optimized()?
                    .into_runnable()?;
                self.plans.insert(key.clone(), plan);
            }
            Ok(&self.plans[&key])
        }
    }

    impl InferenceBackend for TractBackend {
        fn import(graph_def: &[u8]) -> Result<Self, BackendError> {
            let graph = tract_tensorflow::tensorflow().model_for_read(&mut std::io::Cursor::new(graph_def))?;
            Ok(Self { graph, plans: HashMap::new() })
        }

        fn run(&mut self, input: &ImageTensor, input_name: &str, output_name: &str) -> Result<RawOutput, BackendError> {
            let shape = input.shape();
            let tensor = Tensor::from_shape(&shape, input.data())?;
            let plan = self.plan(input_name, output_name, input.size())?;
            let outputs = plan.run(tvec!(tensor.into()))?;
            let view = outputs[0].to_array_view::<f32>()?;
            Ok(RawOutput { shape: view.shape().to_vec(), values: view.iter().copied().collect() })
        }
    }
}
