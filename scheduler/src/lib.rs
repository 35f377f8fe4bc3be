//! Fusion scheduler at the heart of the smelt tensor-compiler backend.
//!
//! Given a lowered, typed list of IR buffers, the [`Scheduler`] builds a
//! dependency graph honoring aliasing and in-place mutation, topologically
//! orders it, greedily fuses compatible nodes into fused kernels, determines
//! buffer lifetimes, and drives per-device code generation in execution
//! order. Per-device emission is consumed through the narrow
//! [`backend::Backend`] capability; allocation and free bookkeeping goes
//! through `smelt_ir::WrapperCode`.

use failure::Fail;

pub mod backend;
pub mod context;
pub mod loop_order;
pub mod node;

mod scheduler;
pub use crate::scheduler::Scheduler;

#[cfg(test)]
mod test;

/// Compile-time configuration, read once per compilation.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Dump node state around the fusion passes.
    pub debug: bool,
    /// In-place reuse of input storage. Not implemented; must stay `false`.
    pub inplace_buffers: bool,
    /// Let backends reorder loops with the stride heuristic.
    pub pick_loop_orders: bool,
    /// Also offer fusion candidates bucketed by group key, not just by
    /// shared buffer.
    pub aggressive_fusion: bool,
    /// Upper bound on constituents in one fused node.
    pub max_fusion_size: usize,
    /// Emit provenance comments into the wrapper.
    pub comment_origin: bool,
    pub cpu: CpuConfig,
}

/// Knobs specific to the cpu backend.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuConfig {
    /// Smallest per-thread chunk worth parallelizing.
    pub min_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            inplace_buffers: false,
            pick_loop_orders: true,
            aggressive_fusion: false,
            max_fusion_size: 64,
            comment_origin: false,
            cpu: CpuConfig {
                min_chunk_size: 4096,
            },
        }
    }
}

/// Fatal scheduling failures. Heuristic rejections are not errors; the
/// legality predicates just return `false` and the candidate is skipped.
#[derive(Debug, Fail)]
pub enum ScheduleError {
    /// An IR buffer could not be classified into a scheduler node.
    #[fail(display = "buffer {} cannot be classified for scheduling", _0)]
    Unclassifiable(String),

    /// A template kernel arrived with anything but a single write.
    #[fail(display = "template kernel {} must have exactly one write", _0)]
    TemplateWrite(String),

    /// A dependency names a buffer no node produces.
    #[fail(display = "dependency on unknown buffer {}", _0)]
    UnknownBuffer(String),

    /// An operation with no meaning on fused nodes was invoked on one.
    #[fail(display = "{} is not applicable to fused node {}", op, node)]
    NotApplicable { op: &'static str, node: String },

    /// `Config::inplace_buffers` was enabled; the reuse path is not
    /// implemented.
    #[fail(display = "in-place buffer reuse is not implemented")]
    InplaceReuse,

    /// A device backend failed while emitting a node.
    #[fail(display = "codegen failed for {}: {}", node, cause)]
    Backend { node: String, cause: failure::Error },

    /// A device backend failed while flushing pending kernels.
    #[fail(display = "backend flush failed: {}", cause)]
    Flush { cause: failure::Error },
}
