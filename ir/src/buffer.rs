//! Read-only view of lowered IR buffers.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::dep::ReadWrites;
use crate::device::Device;
use crate::expr::{IndexExpr, LoopRanges, SizeTuple};
use crate::wrapper::WrapperCode;

/// Classification of an IR buffer for scheduling purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BufferKind {
    /// Produced by a loop body the device backends can emit themselves.
    Computed,
    /// Opaque call into a prebuilt kernel.
    Extern,
    /// Extern kernel eligible for the template path (epilogue fusion).
    Template,
}

/// Provenance of a buffer, carried for codegen comments.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Origin {
    pub op: String,
    pub target: String,
    pub stack_trace: Option<String>,
}

/// Opaque loop body produced by lowering. Device backends downcast this to
/// the concrete body type they were lowered against.
pub trait LoopBody: fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// Strides of a template kernel's output, one entry per dimension.
pub type StrideTuple = SmallVec<[i64; 4]>;

/// Read-only facade over a lowered IR buffer.
///
/// The variant-specific methods default to `None`; a buffer implements the
/// ones matching its [`BufferKind`].
pub trait Buffer: fmt::Debug {
    fn name(&self) -> &str;

    fn device(&self) -> Device;

    fn kind(&self) -> BufferKind;

    /// Reads and writes of this buffer's body. For computed buffers these
    /// are extracted by symbolically running the body over fresh iteration
    /// symbols, normalized.
    fn read_writes(&self) -> ReadWrites;

    fn origins(&self) -> &[Origin] {
        &[]
    }

    /// Names this buffer aliases (shares storage with).
    fn alias_names(&self) -> &[String] {
        &[]
    }

    /// Names this buffer mutates in place. At most one in practice.
    fn mutation_names(&self) -> &[String] {
        &[]
    }

    fn is_no_op(&self) -> bool {
        false
    }

    fn should_allocate(&self) -> bool {
        false
    }

    /// Iteration domain and loop body of a computed buffer.
    fn simplify_and_reorder(&self) -> Option<(LoopRanges, Rc<dyn LoopBody>)> {
        None
    }

    /// Iteration domain and output strides of a template kernel.
    fn group_stride(&self) -> Option<(LoopRanges, StrideTuple)> {
        None
    }

    /// Canonical output index and size of a template kernel.
    fn canonicalize(&self) -> Option<(IndexExpr, SizeTuple)> {
        None
    }

    /// Emit an extern kernel call against the wrapper.
    fn codegen(&self, _wrapper: &mut dyn WrapperCode) -> Result<(), failure::Error> {
        Err(failure::format_err!(
            "{} has no extern kernel to emit",
            self.name()
        ))
    }
}
