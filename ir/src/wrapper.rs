//! Wrapper-code emitter capability.

use crate::buffer::Buffer;

/// Append-only emitter for the wrapper program that allocates, frees and
/// calls kernels. Owned by the compilation driver; the scheduler and extern
/// kernels write through it.
pub trait WrapperCode {
    /// Emit the allocation for `buffer`.
    fn codegen_allocation(&mut self, buffer: &dyn Buffer);

    /// Emit the free for `buffer`.
    fn codegen_free(&mut self, buffer: &dyn Buffer);

    /// Append an opaque comment line.
    fn comment(&mut self, line: &str);

    /// Whether `buffer`'s storage may be taken over by a later buffer.
    /// Reserved for in-place reuse, which is currently disabled.
    fn can_reuse(&self, _buffer: &dyn Buffer) -> bool {
        false
    }

    /// Emit reuse of `old`'s storage for `new`. Reserved, see [`can_reuse`].
    ///
    /// [`can_reuse`]: WrapperCode::can_reuse
    fn codegen_inplace_reuse(&mut self, _old: &dyn Buffer, _new: &dyn Buffer) {}
}
