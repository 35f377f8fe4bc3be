//! Per-device code-generation capability.

use std::collections::BTreeSet;

use fnv::FnvHashMap;
use smallvec::SmallVec;

use smelt_ir::{Device, LoopRanges, Size, WrapperCode};

use crate::context::Graph;
use crate::node::SchedulerNode;
use crate::{Config, ScheduleError};

/// Opaque iteration-domain key a backend buckets nodes by when searching
/// for horizontal fusion partners.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey(SmallVec<[Size; 8]>);

impl GroupKey {
    pub fn new(parts: impl IntoIterator<Item = Size>) -> Self {
        GroupKey(parts.into_iter().collect())
    }

    pub fn parts(&self) -> &[Size] {
        &self.0
    }
}

/// Creates device backends on first use. Owned by the compilation context;
/// the scheduler instantiates at most one backend per device.
pub trait BackendFactory {
    fn create_backend(&mut self, device: Device) -> Box<dyn Backend>;
}

/// State of the kernel a backend is currently emitting, exposed so the
/// scheduler can drop buffers that never escape it.
pub trait Kernel {
    /// Buffers stored by the kernel body.
    fn store_buffer_names(&self) -> &BTreeSet<String>;

    /// Buffers the kernel insists on keeping regardless of liveness.
    fn must_keep_buffers(&self) -> &BTreeSet<String>;

    fn is_input_buffer(&self, name: &str) -> bool;

    /// Mark `name`'s output slot as removed. The slot itself is retained so
    /// later unique-naming sequences stay stable.
    fn remove_buffer(&mut self, name: &str);
}

/// Scheduler view handed to backends during emission.
pub struct CodegenScope<'a> {
    pub wrapper: &'a mut dyn WrapperCode,
    pub config: &'a Config,
    pub(crate) graph: &'a mut Graph,
    pub(crate) buffer_names_no_longer_needed: &'a BTreeSet<String>,
    pub(crate) mutation_renames: &'a FnvHashMap<String, String>,
    pub(crate) mutation_real_name: &'a FnvHashMap<String, String>,
}

impl<'a> CodegenScope<'a> {
    /// Original name of a post-mutation buffer, for emission.
    pub fn mutation_real_name<'b>(&self, name: &'b str) -> &'b str
    where
        'a: 'b,
    {
        self.mutation_real_name
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }

    /// Drop any buffer both stored by `kernel` and last used inside it,
    /// unless it is a must-keep, a kernel input, or involved in mutation
    /// renaming.
    pub fn remove_kernel_local_buffers(&mut self, kernel: &mut dyn Kernel) {
        let removable: Vec<String> = kernel
            .store_buffer_names()
            .intersection(self.buffer_names_no_longer_needed)
            .filter(|name| {
                !kernel.must_keep_buffers().contains(*name)
                    && !kernel.is_input_buffer(name)
                    && !self.mutation_renames.contains_key(*name)
                    && !self.mutation_real_name.contains_key(*name)
            })
            .cloned()
            .collect();
        for name in removable {
            log::debug!("remove_buffer({:?})", name);
            kernel.remove_buffer(&name);
            self.graph.removed_buffers.insert(name);
        }
    }

    /// Emit the allocation for `node`'s buffer if it needs storage.
    /// Template outputs always allocate; the template kernel cannot
    /// allocate for itself.
    pub fn allocate(&mut self, node: &SchedulerNode) -> Result<(), ScheduleError> {
        let buffer = match node.buffer() {
            Some(buffer) => buffer,
            None => {
                return Err(ScheduleError::NotApplicable {
                    op: "allocate",
                    node: node.name().to_string(),
                })
            }
        };
        if self.config.inplace_buffers
            && node.is_computed()
            && buffer.alias_names().is_empty()
            && buffer.mutation_names().is_empty()
            && buffer.should_allocate()
        {
            // taking over an input's storage is unimplemented; reaching
            // this path would emit wrong code
            return Err(ScheduleError::InplaceReuse);
        }
        if buffer.should_allocate() || node.is_template() {
            self.wrapper.codegen_allocation(buffer.as_ref());
        }
        Ok(())
    }

    /// Emit provenance comments for `node` through the wrapper.
    pub fn codegen_originating_info(&mut self, node: &SchedulerNode, only_once: bool) {
        if !self.config.comment_origin {
            return;
        }
        if only_once && node.written.get() {
            return;
        }
        let buffer = match node.buffer() {
            Some(buffer) => buffer,
            None => return,
        };

        let mut lines = Vec::new();
        for origin in buffer.origins() {
            if origin.op == "output" {
                // boring and samey
                continue;
            }
            lines.push(format!("origin: {} {}", origin.op, origin.target));
            if let Some(trace) = &origin.stack_trace {
                let last = trace.rsplit('|').next().unwrap_or(trace.as_str());
                lines.push(format!("origin: {}", last.trim()));
            }
        }
        if lines.is_empty() {
            return;
        }
        for line in lines {
            self.wrapper.comment(&line);
        }
        node.written.set(true);
    }
}

/// Per-device code-generation backend consumed by the scheduler.
pub trait Backend {
    /// Bucket key for `ranges`, used to restrict horizontal-fusion search.
    fn group_fn(&self, ranges: &LoopRanges) -> GroupKey;

    /// Device-specific legality of fusing `consumer` into `producer`.
    fn can_fuse_vertical(&self, producer: &SchedulerNode, consumer: &SchedulerNode) -> bool;

    /// Device-specific legality of fusing two independent nodes that share
    /// reads.
    fn can_fuse_horizontal(&self, left: &SchedulerNode, right: &SchedulerNode) -> bool;

    /// Whether a pointwise `epilogue` may fuse onto `template`.
    fn can_fuse_template(&self, _template: &SchedulerNode, _epilogue: &SchedulerNode) -> bool {
        false
    }

    /// Emit one kernel realizing the given fusion-grouped nodes.
    fn codegen_nodes(
        &mut self,
        scope: &mut CodegenScope<'_>,
        nodes: &[&SchedulerNode],
    ) -> Result<(), failure::Error>;

    /// Emit a template kernel followed by its fused epilogue.
    fn codegen_template(
        &mut self,
        _scope: &mut CodegenScope<'_>,
        template: &SchedulerNode,
        _epilogue: &[&SchedulerNode],
    ) -> Result<(), failure::Error> {
        failure::bail!("backend cannot emit template kernel {}", template.name())
    }

    /// Finalize pending kernels.
    fn flush(&mut self, scope: &mut CodegenScope<'_>) -> Result<(), failure::Error>;
}
