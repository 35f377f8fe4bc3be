//! Ambient state threaded through one compilation.

use std::collections::BTreeSet;

use derivative::Derivative;

use smelt_ir::{DeviceKind, SizeHints, WrapperCode};

use crate::backend::BackendFactory;
use crate::Config;

/// Graph-level bookkeeping shared between the scheduler and the compile
/// driver.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    /// Names of graph inputs.
    pub inputs: BTreeSet<String>,
    /// Names of constant buffers.
    pub constants: BTreeSet<String>,
    /// Names of graph outputs, in declaration order.
    pub outputs: Vec<String>,
    /// Buffers eliminated during scheduling; never allocated or freed.
    pub removed_buffers: BTreeSet<String>,
    /// Graph inputs observed to be mutated in place.
    pub mutated_inputs: BTreeSet<String>,
    /// Device kinds touched by the schedule.
    pub device_kinds: BTreeSet<DeviceKind>,
}

impl Graph {
    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }
}

/// Everything ambient the scheduler needs for one compilation. Passed into
/// `Scheduler::new` and threaded explicitly; there is no process-wide state.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Context {
    pub graph: Graph,
    #[derivative(Debug = "ignore")]
    pub wrapper: Box<dyn WrapperCode>,
    #[derivative(Debug = "ignore")]
    pub backends: Box<dyn BackendFactory>,
    pub config: Config,
    pub size_hints: SizeHints,
}
