//! Execution-ordered code generation.
//!
//! Walks the final schedule, switching devices and flushing pending kernels
//! as needed, dispatching each node to its backend, and interleaving
//! wrapper allocations and frees once a buffer's last use has passed.

use log::trace;

use smelt_ir::Device;

use crate::backend::CodegenScope;
use crate::node::{NodeId, SchedulerNode};
use crate::ScheduleError;

use super::Scheduler;

impl Scheduler {
    /// Emit the whole schedule.
    pub fn codegen(&mut self) -> Result<(), ScheduleError> {
        for idx in 0..self.schedule.len() {
            let id = self.schedule[idx];
            let last_usage = self.nodes[id].last_usage.clone();
            self.buffer_names_no_longer_needed
                .extend(last_usage.iter().cloned());

            if !self.nodes[id].is_nop() {
                let device = self.nodes[id].device();
                if self.current_device != Some(device)
                    || self.nodes[id].is_extern()
                    || self.nodes[id].is_template()
                {
                    self.flush()?;
                    self.current_device = Some(device);
                }
            }

            self.buffer_names_to_free.extend(last_usage);

            if self.nodes[id].is_template() {
                self.codegen_template_call(id)?;
            } else if self.nodes[id].is_extern() {
                self.codegen_extern_call(id)?;
            } else if self.nodes[id].is_nop() {
                self.allocate(id)?;
            } else {
                trace!("codegen {}", self.nodes[id].name());
                let device = self.nodes[id].device();
                self.ensure_backend(device);
                let constituents: Vec<NodeId> = self.constituents(id).collect();
                let Scheduler {
                    cx,
                    nodes,
                    backends,
                    buffer_names_no_longer_needed,
                    mutation_renames,
                    mutation_real_name,
                    ..
                } = self;
                let mut scope = CodegenScope {
                    wrapper: cx.wrapper.as_mut(),
                    config: &cx.config,
                    graph: &mut cx.graph,
                    buffer_names_no_longer_needed,
                    mutation_renames,
                    mutation_real_name,
                };
                let refs: Vec<&SchedulerNode> = constituents
                    .iter()
                    .map(|&constituent| &nodes[constituent])
                    .collect();
                backends
                    .get_mut(&device)
                    .unwrap()
                    .codegen_nodes(&mut scope, &refs)
                    .map_err(|cause| ScheduleError::Backend {
                        node: nodes[id].name().to_string(),
                        cause,
                    })?;
            }

            // the node's buffers are materialized from here on
            let names: Vec<String> = self.nodes[id].names().map(str::to_string).collect();
            self.available_buffer_names.extend(names);
        }
        self.flush()
    }

    fn codegen_extern_call(&mut self, id: NodeId) -> Result<(), ScheduleError> {
        trace!("codegen extern {}", self.nodes[id].name());
        self.allocate(id)?;
        {
            let Scheduler { cx, nodes, .. } = self;
            let node = &nodes[id];
            let buffer = match node.buffer() {
                Some(buffer) => buffer,
                None => {
                    return Err(ScheduleError::NotApplicable {
                        op: "codegen_extern_call",
                        node: node.name().to_string(),
                    })
                }
            };
            buffer
                .codegen(cx.wrapper.as_mut())
                .map_err(|cause| ScheduleError::Backend {
                    node: node.name().to_string(),
                    cause,
                })?;
        }
        self.free_buffers()
    }

    fn codegen_template_call(&mut self, id: NodeId) -> Result<(), ScheduleError> {
        trace!("codegen template {}", self.nodes[id].name());
        let constituents: Vec<NodeId> = self.constituents(id).collect();
        let head = constituents[0];
        self.allocate(head)?;
        let device = self.nodes[id].device();
        self.ensure_backend(device);
        {
            let Scheduler {
                cx,
                nodes,
                backends,
                buffer_names_no_longer_needed,
                mutation_renames,
                mutation_real_name,
                ..
            } = self;
            let mut scope = CodegenScope {
                wrapper: cx.wrapper.as_mut(),
                config: &cx.config,
                graph: &mut cx.graph,
                buffer_names_no_longer_needed,
                mutation_renames,
                mutation_real_name,
            };
            let epilogue: Vec<&SchedulerNode> = constituents[1..]
                .iter()
                .map(|&constituent| &nodes[constituent])
                .collect();
            backends
                .get_mut(&device)
                .unwrap()
                .codegen_template(&mut scope, &nodes[head], &epilogue)
                .map_err(|cause| ScheduleError::Backend {
                    node: nodes[id].name().to_string(),
                    cause,
                })?;
        }
        self.free_buffers()
    }

    /// Ask every active backend to emit pending kernels, then free dead
    /// buffers.
    pub fn flush(&mut self) -> Result<(), ScheduleError> {
        let mut devices: Vec<Device> = self.backends.keys().copied().collect();
        devices.sort();
        for device in devices {
            let Scheduler {
                cx,
                backends,
                buffer_names_no_longer_needed,
                mutation_renames,
                mutation_real_name,
                ..
            } = self;
            let mut scope = CodegenScope {
                wrapper: cx.wrapper.as_mut(),
                config: &cx.config,
                graph: &mut cx.graph,
                buffer_names_no_longer_needed,
                mutation_renames,
                mutation_real_name,
            };
            backends
                .get_mut(&device)
                .unwrap()
                .flush(&mut scope)
                .map_err(|cause| ScheduleError::Flush { cause })?;
        }
        self.free_buffers()
    }

    /// Free any buffer whose last use has passed, unless the graph pinned
    /// it as an output.
    fn free_buffers(&mut self) -> Result<(), ScheduleError> {
        let to_free: Vec<String> = self
            .buffer_names_to_free
            .difference(&self.cx.graph.removed_buffers)
            .cloned()
            .collect();
        for name in to_free {
            if let Some(&id) = self.name_to_node.get(&name) {
                if self.can_free(id)? {
                    let Scheduler { cx, nodes, .. } = self;
                    if let Some(buffer) = nodes[id].buffer() {
                        trace!("free {}", name);
                        cx.wrapper.codegen_free(buffer.as_ref());
                    }
                }
            }
        }
        self.buffer_names_to_free.clear();
        Ok(())
    }

    /// A buffer may be freed only when none of its users is an output sink.
    fn can_free(&self, id: NodeId) -> Result<bool, ScheduleError> {
        let node = &self.nodes[id];
        if node.is_fused() {
            return Err(ScheduleError::NotApplicable {
                op: "can_free",
                node: node.name().to_string(),
            });
        }
        Ok(!node.users.iter().any(|user| user.node.is_output()))
    }

    /// Emit the allocation for a node's buffer.
    fn allocate(&mut self, id: NodeId) -> Result<(), ScheduleError> {
        let Scheduler {
            cx,
            nodes,
            buffer_names_no_longer_needed,
            mutation_renames,
            mutation_real_name,
            ..
        } = self;
        let mut scope = CodegenScope {
            wrapper: cx.wrapper.as_mut(),
            config: &cx.config,
            graph: &mut cx.graph,
            buffer_names_no_longer_needed,
            mutation_renames,
            mutation_real_name,
        };
        scope.allocate(&nodes[id])
    }
}
