//! Intermediate-representation facade consumed by the smelt fusion scheduler.
//!
//! The scheduler never builds IR itself; lowering hands it a list of buffers
//! that it observes through the read-only [`Buffer`] trait. This crate holds
//! that trait together with the small descriptive vocabulary the scheduler
//! reasons in: dependency records ([`Dep`], [`ReadWrites`]), symbolic sizes
//! and affine index expressions ([`Size`], [`IndexExpr`]), devices, and the
//! wrapper-code capability used for allocation and free bookkeeping.

pub mod buffer;
pub mod dep;
pub mod device;
pub mod expr;
pub mod wrapper;

pub use buffer::{Buffer, BufferKind, LoopBody, Origin, StrideTuple};
pub use dep::{Dep, MemoryDep, ReadWrites, StarDep};
pub use device::{Device, DeviceKind};
pub use expr::{IndexExpr, LoopRanges, Size, SizeHints, SizeTuple};
pub use wrapper::WrapperCode;
