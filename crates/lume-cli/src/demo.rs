//! Bundled demo model.
//!
//! | Variable | Role | Binding |
//! |----------|------|---------|
//! | `input1`, `input2` | scalar inputs in `[0, 256]` | Channel Access |
//! | `output1` | 50x50 image drawn uniformly from `[input1, input2]` | pvAccess |
//! | `output2`, `output3` | copies of `input1`, `input2` | pvAccess |

use lume_runtime::config::{PvBinding, ServerConfig, VariableDefinition};
use lume_runtime::{EvaluationError, InputSnapshot, Model, OutputValues};
use lume_types::{ArrayData, AxisBounds, PvValue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const IMAGE_ROWS: usize = 50;
pub const IMAGE_COLS: usize = 50;

/// Variables and bindings the demo model expects, under `prefix`.
#[must_use]
pub fn demo_config(prefix: &str) -> ServerConfig {
    ServerConfig::new()
        .with_prefix(prefix)
        .with_variable(
            "input1",
            VariableDefinition::scalar_input(1.0, 0.0, 256.0).with_units("counts"),
        )
        .with_variable(
            "input2",
            VariableDefinition::scalar_input(2.0, 0.0, 256.0).with_units("counts"),
        )
        .with_variable(
            "output1",
            VariableDefinition::image_output(IMAGE_ROWS, IMAGE_COLS)
                .with_bounds(AxisBounds::new(0.0, 10.0, 0.0, 10.0)),
        )
        .with_variable("output2", VariableDefinition::scalar_output(0.0))
        .with_variable("output3", VariableDefinition::scalar_output(0.0))
        .with_binding("input1", PvBinding::ca())
        .with_binding("input2", PvBinding::ca())
        .with_binding("output1", PvBinding::pva())
        .with_binding("output2", PvBinding::pva())
        .with_binding("output3", PvBinding::pva())
}

/// `output1 = uniform(input1, input2)`, `output2 = input1`,
/// `output3 = input2`.
pub struct DemoModel {
    rng: StdRng,
}

impl DemoModel {
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl Model for DemoModel {
    fn evaluate(&mut self, inputs: &InputSnapshot) -> Result<OutputValues, EvaluationError> {
        let a = inputs.scalar("input1")?;
        let b = inputs.scalar("input2")?;
        let (low, high) = if a <= b { (a, b) } else { (b, a) };

        let data = (0..IMAGE_ROWS * IMAGE_COLS)
            .map(|_| self.rng.gen_range(low..=high))
            .collect();
        let image = ArrayData::new(vec![IMAGE_ROWS, IMAGE_COLS], data);

        Ok(OutputValues::new()
            .with("output1", PvValue::Image(image))
            .with("output2", a)
            .with("output3", b))
    }
}
