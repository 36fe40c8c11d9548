use crate::{Descriptor, ExecutorConfig, HostTensor, Op, Result};

/// A resolved input descriptor handed to shape inference. `content` is only
/// present for inputs the operator's shape depends on.
#[derive(Clone, Debug)]
pub struct InfoInput {
    pub desc: Descriptor,
    pub content: Option<Vec<u8>>,
}

/// Where a unit reads one of its inputs from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitInput {
    /// The k-th external input of the plan.
    External(usize),
    /// An output of an earlier unit of the same plan.
    Internal { unit: usize, output: usize },
}

/// One lowered operator node.
#[derive(Clone, Debug)]
pub struct Unit {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<UnitInput>,
    pub outputs: Vec<Descriptor>,
}

/// A built plan. Units run in order; the returned tensors are every unit's
/// outputs, flattened in unit order.
pub trait Executable {
    fn run(&mut self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>>;

    /// Hand back outputs of a previous run so their memory can be reused.
    fn recycle(&mut self, _outputs: Vec<HostTensor>) {}

    /// Per-unit costs recorded since the last call, when profiling is on.
    fn take_costs(&mut self) -> Vec<OpCost> {
        Vec::new()
    }
}

/// Measured cost of one unit execution.
#[derive(Clone, Debug)]
pub struct OpCost {
    pub kind: &'static str,
    pub time_ms: f32,
    pub flops: f32,
}

/// Operator registry and device runtime consumed by the graph core.
pub trait Backend {
    fn name(&self) -> &str;

    /// Shape inference for one operator given resolved inputs.
    fn compute_info(&self, op: &Op, inputs: &[InfoInput]) -> Result<Vec<Descriptor>> {
        op.infer(inputs)
    }

    /// Lower a topologically ordered list of units to an executable plan.
    fn build_units(&self, units: Vec<Unit>, config: &ExecutorConfig)
        -> Result<Box<dyn Executable>>;
}
