//! The scheduler core.
//!
//! `Scheduler::new` runs the whole planning pipeline: classify buffers into
//! nodes, compute dependency edges (aliasing and mutation included), sort
//! topologically, close over predecessors, drop dead nodes, fuse to a fixed
//! point, and annotate last usage. `codegen` (in `codegen.rs`) then walks
//! the result in execution order.

use std::collections::BTreeSet;
use std::rc::Rc;

use cranelift_entity::PrimaryMap;
use either::Either;
use fnv::{FnvHashMap, FnvHashSet};
use log::trace;

use smelt_ir::{Buffer, BufferKind, Dep, Device};

use crate::backend::Backend;
use crate::context::{Context, Graph};
use crate::node::{
    Group, NodeId, NodeKind, NodeUser, OutputId, OutputNode, SchedulerNode, UserRef,
};
use crate::ScheduleError;

mod codegen;
mod fusion;

/// Per-buffer user lists. Names in one alias equivalence class share a
/// single list; a union-find keyed by name picks the representative that
/// owns it.
#[derive(Default)]
struct UserLists {
    parent: FnvHashMap<String, String>,
    lists: FnvHashMap<String, Vec<NodeUser>>,
}

impl UserLists {
    fn repr(&mut self, name: &str) -> String {
        let mut root = name.to_string();
        let mut path = Vec::new();
        while let Some(next) = self.parent.get(&root) {
            path.push(root.clone());
            root = next.clone();
        }
        for hop in path {
            self.parent.insert(hop, root.clone());
        }
        root
    }

    fn merge(&mut self, left: &str, right: &str) {
        let left = self.repr(left);
        let right = self.repr(right);
        if left == right {
            return;
        }
        let users = self.lists.remove(&right).unwrap_or_default();
        self.lists.entry(left.clone()).or_default().extend(users);
        self.parent.insert(right, left);
    }

    fn push(&mut self, name: &str, user: NodeUser) {
        let root = self.repr(name);
        self.lists.entry(root).or_default().push(user);
    }

    fn get(&mut self, name: &str) -> Vec<NodeUser> {
        let root = self.repr(name);
        self.lists.get(&root).cloned().unwrap_or_default()
    }
}

/// Plans and emits one compilation's worth of buffers.
pub struct Scheduler {
    pub(crate) cx: Context,
    pub(crate) nodes: PrimaryMap<NodeId, SchedulerNode>,
    pub(crate) outputs: PrimaryMap<OutputId, OutputNode>,
    /// Live nodes in schedule order. Fused-away constituents are retired
    /// from here but stay in the arena.
    pub(crate) schedule: Vec<NodeId>,
    pub(crate) backends: FnvHashMap<Device, Box<dyn Backend>>,
    /// Graph inputs, constants, and every buffer already emitted.
    pub(crate) available_buffer_names: BTreeSet<String>,
    /// Original node per buffer name. Never rebuilt after ingestion.
    pub(crate) name_to_node: FnvHashMap<String, NodeId>,
    /// Current (possibly fused) owner per buffer name.
    pub(crate) name_to_fused_node: FnvHashMap<String, NodeId>,
    /// Current name for a mutated buffer, changed once per mutation.
    pub(crate) mutation_renames: FnvHashMap<String, String>,
    /// Maps a mutation's writer back to the original name for codegen.
    pub(crate) mutation_real_name: FnvHashMap<String, String>,
    pub(crate) num_orig_nodes: usize,
    // codegen state
    pub(crate) current_device: Option<Device>,
    pub(crate) buffer_names_to_free: BTreeSet<String>,
    pub(crate) buffer_names_no_longer_needed: BTreeSet<String>,
}

impl Scheduler {
    /// Plan the given buffers. The list must already be topologically valid
    /// in declaration order.
    pub fn new(buffers: Vec<Rc<dyn Buffer>>, cx: Context) -> Result<Self, ScheduleError> {
        let available = cx
            .graph
            .inputs
            .union(&cx.graph.constants)
            .cloned()
            .collect();
        let mut scheduler = Scheduler {
            cx,
            nodes: PrimaryMap::new(),
            outputs: PrimaryMap::new(),
            schedule: Vec::new(),
            backends: FnvHashMap::default(),
            available_buffer_names: available,
            name_to_node: FnvHashMap::default(),
            name_to_fused_node: FnvHashMap::default(),
            mutation_renames: FnvHashMap::default(),
            mutation_real_name: FnvHashMap::default(),
            num_orig_nodes: 0,
            current_device: None,
            buffer_names_to_free: BTreeSet::new(),
            buffer_names_no_longer_needed: BTreeSet::new(),
        };

        trace!("==== scheduling {} buffers", buffers.len());
        scheduler.ingest(buffers)?;

        // classification may have minted new constants
        let constants: Vec<String> = scheduler.cx.graph.constants.iter().cloned().collect();
        scheduler.available_buffer_names.extend(constants);
        for &id in &scheduler.schedule {
            scheduler.nodes[id].prune_deps(&scheduler.available_buffer_names);
        }

        trace!("==== compute_dependencies");
        scheduler.compute_dependencies()?;
        trace!("==== topological_sort_schedule");
        scheduler.topological_sort_schedule()?;
        scheduler.compute_predecessors()?;
        scheduler.dead_node_elimination();

        scheduler.debug_print_nodes("nodes before fusion");
        scheduler.num_orig_nodes = scheduler.schedule.len();
        for &id in &scheduler.schedule {
            for name in scheduler.nodes[id].names() {
                scheduler.name_to_fused_node.insert(name.to_string(), id);
            }
        }
        trace!("==== fuse_nodes");
        scheduler.fuse_nodes()?;
        scheduler.compute_last_usage();
        scheduler.debug_print_nodes("nodes after fusion");
        scheduler.debug_draw_graph();

        Ok(scheduler)
    }

    /// Wrap each buffer in its scheduler-node variant, in declaration
    /// order. Every input must be classifiable.
    fn ingest(&mut self, buffers: Vec<Rc<dyn Buffer>>) -> Result<(), ScheduleError> {
        for buffer in buffers {
            let name = buffer.name().to_string();
            let device = buffer.device();
            let kind = if buffer.is_no_op() {
                NodeKind::Nop {
                    buffer: buffer.clone(),
                }
            } else {
                match buffer.kind() {
                    BufferKind::Computed => {
                        let (ranges, body) = buffer
                            .simplify_and_reorder()
                            .ok_or_else(|| ScheduleError::Unclassifiable(name.clone()))?;
                        let key = self.get_backend(device).group_fn(&ranges);
                        NodeKind::Computed {
                            buffer: buffer.clone(),
                            ranges,
                            body,
                            group: Group { device, key },
                        }
                    }
                    BufferKind::Template => {
                        let (ranges, stride) = buffer
                            .group_stride()
                            .ok_or_else(|| ScheduleError::Unclassifiable(name.clone()))?;
                        let key = self.get_backend(device).group_fn(&ranges);
                        NodeKind::Template {
                            buffer: buffer.clone(),
                            ranges,
                            stride,
                            group: Group { device, key },
                        }
                    }
                    BufferKind::Extern => NodeKind::Extern {
                        buffer: buffer.clone(),
                    },
                }
            };

            let mut node = SchedulerNode::new(name.clone(), kind);
            node.set_read_writes(buffer.read_writes(), &self.available_buffer_names);

            if node.is_computed() && node.is_reduction() {
                // a reduction keeps the reduced dim in its sizes, which
                // confuses downstream consumers; widen the writes with
                // stripped copies so the non-reduction prefix matches.
                // (also swapping sizes for reductions off the last dim
                // breaks downstream symbolic size comparison, so the
                // writes stay unswapped.)
                let widened: Vec<Dep> = node
                    .read_writes
                    .writes
                    .iter()
                    .map(|write| write.strip_last_size())
                    .collect();
                node.read_writes.writes.extend(widened);
            }

            if node.is_template() {
                canonicalize_template_write(&mut node, buffer.as_ref())?;
            }

            let id = self.nodes.push(node);
            self.schedule.push(id);
            self.name_to_node.insert(name, id);
        }
        Ok(())
    }

    /// Create dependency edges between nodes, handling aliasing and
    /// mutation.
    fn compute_dependencies(&mut self) -> Result<(), ScheduleError> {
        let mut users = UserLists::default();

        // names in one alias class share a single user list, so writes to
        // any of them are visible to readers of any other
        for idx in 0..self.schedule.len() {
            let id = self.schedule[idx];
            let node_name = self.nodes[id].name().to_string();
            let aliases = self.nodes[id].aliases()?.to_vec();
            for alias in aliases {
                users.merge(&node_name, &alias);
            }
        }

        for idx in 0..self.schedule.len() {
            let id = self.schedule[idx];
            let node_name = self.nodes[id].name().to_string();

            // a node will mutate either 0 or 1 buffers
            let mutations = self.nodes[id].mutations()?.to_vec();
            for alt_name in &mutations {
                let alt_name = self.resolve_rename(alt_name);
                // this node must run after the prior writer
                users.push(
                    &alt_name,
                    NodeUser {
                        node: UserRef::Node(id),
                        can_inplace: false,
                    },
                );
                self.nodes[id].add_mutation_dep(&alt_name, &self.available_buffer_names)?;

                // and after all prior readers, unless a true dependency
                // already orders it behind them
                let known_deps = self.dep_closure(&node_name);
                for other in users.get(&alt_name) {
                    let other_id = match other.node {
                        UserRef::Node(other_id) => other_id,
                        UserRef::Output(_) => continue,
                    };
                    let other_name = self.resolve_rename(self.nodes[other_id].name());
                    if !known_deps.contains(&other_name) {
                        self.nodes[id]
                            .add_mutation_dep(&other_name, &self.available_buffer_names)?;
                        users.push(
                            &other_name,
                            NodeUser {
                                node: UserRef::Node(id),
                                can_inplace: false,
                            },
                        );
                    }
                }
            }

            // normal data edges
            let reads: Vec<Dep> = self.nodes[id].read_writes.reads.iter().cloned().collect();
            for read in reads {
                let can_inplace = self.nodes[id].can_inplace(&read)?;
                let key = self.resolve_rename(read.name());
                users.push(
                    &key,
                    NodeUser {
                        node: UserRef::Node(id),
                        can_inplace,
                    },
                );
            }

            self.nodes[id]
                .update_mutated_names(&self.mutation_renames, &self.available_buffer_names)?;

            // future references to the mutated buffer resolve to this node
            for alt_name in &mutations {
                let resolved = self.resolve_rename(alt_name);
                self.mutation_renames.insert(resolved, node_name.clone());
                self.mutation_renames
                    .insert(alt_name.clone(), node_name.clone());
                let real = self
                    .mutation_real_name
                    .get(alt_name)
                    .cloned()
                    .unwrap_or_else(|| alt_name.clone());
                self.mutation_real_name.insert(node_name.clone(), real);
            }
        }

        // make sure outputs aren't dead-code-eliminated
        for name in self.cx.graph.outputs.clone() {
            let output = self.outputs.push(OutputNode {
                dep: Dep::star(name.as_str()),
                inverse_users: Vec::new(),
            });
            let key = self.resolve_rename(&name);
            users.push(
                &key,
                NodeUser {
                    node: UserRef::Output(output),
                    can_inplace: false,
                },
            );
        }

        // make sure input mutation isn't dead-code-eliminated either
        let mut mutated: Vec<String> = self.mutation_renames.keys().cloned().collect();
        mutated.sort();
        for name in mutated {
            if self.cx.graph.inputs.contains(&name) {
                let output = self.outputs.push(OutputNode {
                    dep: Dep::star(name.as_str()),
                    inverse_users: Vec::new(),
                });
                let key = self.resolve_rename(&name);
                users.push(
                    &key,
                    NodeUser {
                        node: UserRef::Output(output),
                        can_inplace: false,
                    },
                );
                self.cx.graph.mutated_inputs.insert(name);
            }
        }

        // copy users onto the nodes, deduplicated
        for idx in 0..self.schedule.len() {
            let id = self.schedule[idx];
            let list = users.get(self.nodes[id].name());
            self.nodes[id].set_users(list)?;
        }

        // populate inverse_users
        for idx in 0..self.schedule.len() {
            let id = self.schedule[idx];
            let user_list = self.nodes[id].users.clone();
            for user in user_list {
                match user.node {
                    UserRef::Node(other) => self.nodes[other].inverse_users.push(id),
                    UserRef::Output(output) => self.outputs[output].inverse_users.push(id),
                }
            }
        }
        Ok(())
    }

    /// Transitive lookup through `mutation_renames`.
    pub(crate) fn resolve_rename(&self, name: &str) -> String {
        let mut current = name;
        while let Some(next) = self.mutation_renames.get(current) {
            current = next;
        }
        current.to_string()
    }

    /// Names reachable from `node_name` by following reads whose memory dep
    /// exactly matches the node's write. Used to skip redundant ordering
    /// edges when a true dependency already exists.
    fn dep_closure(&self, node_name: &str) -> BTreeSet<String> {
        let mut reachable = BTreeSet::new();
        self.dep_closure_into(node_name, &mut reachable);
        reachable
    }

    fn dep_closure_into(&self, node_name: &str, reachable: &mut BTreeSet<String>) {
        if !reachable.insert(node_name.to_string()) {
            return;
        }
        let id = match self.name_to_node.get(node_name) {
            Some(&id) => id,
            None => return,
        };
        let node = &self.nodes[id];
        let write = match node.read_writes.writes.iter().next().and_then(Dep::as_memory) {
            Some(write) => write.clone(),
            None => return,
        };
        for read in &node.read_writes.reads {
            if let Some(read) = read.as_memory() {
                if self.name_to_node.contains_key(&read.name)
                    && read.index == write.index
                    && read.size == write.size
                {
                    self.dep_closure_into(&read.name, reachable);
                }
            }
        }
    }

    /// Ensure `schedule` is topologically sorted with respect to unmet
    /// dependencies. Deps are visited in name order so the result is
    /// deterministic.
    pub(crate) fn topological_sort_schedule(&mut self) -> Result<(), ScheduleError> {
        fn visit(
            id: NodeId,
            nodes: &PrimaryMap<NodeId, SchedulerNode>,
            by_name: &FnvHashMap<String, NodeId>,
            seen: &mut FnvHashSet<NodeId>,
            result: &mut Vec<NodeId>,
        ) -> Result<(), ScheduleError> {
            if !seen.insert(id) {
                return Ok(());
            }
            let mut deps: Vec<&Dep> = nodes[id].unmet_dependencies.iter().collect();
            deps.sort_by(|a, b| a.name().cmp(b.name()));
            for dep in deps {
                let target = by_name
                    .get(dep.name())
                    .copied()
                    .ok_or_else(|| ScheduleError::UnknownBuffer(dep.name().to_string()))?;
                visit(target, nodes, by_name, seen, result)?;
            }
            result.push(id);
            Ok(())
        }

        let mut by_name = FnvHashMap::default();
        for &id in &self.schedule {
            for name in self.nodes[id].names() {
                by_name.insert(name.to_string(), id);
            }
        }
        let mut seen = FnvHashSet::default();
        let mut result = Vec::with_capacity(self.schedule.len());
        for &id in &self.schedule {
            visit(id, &self.nodes, &by_name, &mut seen, &mut result)?;
        }
        self.schedule = result;
        Ok(())
    }

    /// Populate each node's `recursive_predecessors` and its order bounds.
    /// Relies on `schedule` being topologically sorted.
    pub(crate) fn compute_predecessors(&mut self) -> Result<(), ScheduleError> {
        let mut name_to_predecessors: FnvHashMap<String, BTreeSet<String>> = FnvHashMap::default();
        for idx in 0..self.schedule.len() {
            let id = self.schedule[idx];
            let dep_names: Vec<String> = self.nodes[id]
                .unmet_dependencies
                .iter()
                .map(|dep| dep.name().to_string())
                .collect();
            let mut predecessors = BTreeSet::new();
            for name in dep_names {
                let upstream = name_to_predecessors
                    .get(&name)
                    .ok_or_else(|| ScheduleError::UnknownBuffer(name.clone()))?;
                predecessors.extend(upstream.iter().cloned());
                predecessors.insert(name);
            }
            name_to_predecessors.insert(self.nodes[id].name().to_string(), predecessors.clone());
            self.nodes[id].recursive_predecessors = predecessors;
        }

        for (order, &id) in self.schedule.iter().enumerate() {
            self.nodes[id].min_order = order;
            self.nodes[id].max_order = order;
        }
        Ok(())
    }

    /// Remove any node without users. Outputs survive because dependency
    /// computation pinned them with output sinks.
    pub(crate) fn dead_node_elimination(&mut self) {
        let mut updated = Vec::with_capacity(self.schedule.len());
        for &id in &self.schedule {
            if !self.nodes[id].users.is_empty() {
                updated.push(id);
            } else {
                log::debug!("removed dead node: {}", self.nodes[id].name());
                self.cx
                    .graph
                    .removed_buffers
                    .insert(self.nodes[id].name().to_string());
            }
        }
        self.schedule = updated;
    }

    /// Populate each node's `last_usage` by walking the schedule backwards.
    /// Renamed post-mutation buffers count as uses of their original.
    pub(crate) fn compute_last_usage(&mut self) {
        let mut future_used: BTreeSet<String> = self.cx.graph.outputs.iter().cloned().collect();
        for idx in (0..self.schedule.len()).rev() {
            let id = self.schedule[idx];
            let used: BTreeSet<String> = self.nodes[id]
                .used_buffer_names()
                .into_iter()
                .map(|name| {
                    self.mutation_real_name
                        .get(&name)
                        .cloned()
                        .unwrap_or(name)
                })
                .collect();
            self.nodes[id].last_usage = used.difference(&future_used).cloned().collect();
            future_used.extend(used);
        }
    }

    pub(crate) fn ensure_backend(&mut self, device: Device) {
        if !self.backends.contains_key(&device) {
            trace!("creating {} backend", device);
            self.cx.graph.device_kinds.insert(device.kind());
            let backend = self.cx.backends.create_backend(device);
            self.backends.insert(device, backend);
        }
    }

    /// The backend for `device`, created on first use.
    pub fn get_backend(&mut self, device: Device) -> &mut dyn Backend {
        self.ensure_backend(device);
        self.backends.get_mut(&device).unwrap().as_mut()
    }

    // --- read-only views ---------------------------------------------------

    /// Live nodes in schedule order.
    pub fn schedule(&self) -> &[NodeId] {
        &self.schedule
    }

    pub fn node(&self, id: NodeId) -> &SchedulerNode {
        &self.nodes[id]
    }

    /// Original node for a buffer name, fused-away constituents included.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }

    /// Current (possibly fused) owner of a buffer name.
    pub fn fused_node_id(&self, name: &str) -> Option<NodeId> {
        self.name_to_fused_node.get(name).copied()
    }

    /// Constituents of a node; the node itself when unfused.
    pub fn constituents(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        match &self.nodes[id].kind {
            NodeKind::Fused { snodes, .. } => Either::Left(snodes.iter().copied()),
            _ => Either::Right(std::iter::once(id)),
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.cx.graph
    }

    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// Hand the ambient context back to the driver.
    pub fn into_context(self) -> Context {
        self.cx
    }

    pub fn mutation_renames(&self) -> &FnvHashMap<String, String> {
        &self.mutation_renames
    }

    pub fn mutation_real_names(&self) -> &FnvHashMap<String, String> {
        &self.mutation_real_name
    }

    /// Display name of a user edge's target.
    pub fn user_name(&self, user: &NodeUser) -> &str {
        match user.node {
            UserRef::Node(id) => self.nodes[id].name(),
            UserRef::Output(_) => "OUTPUT",
        }
    }

    fn debug_print_nodes(&self, label: &str) {
        if !self.cx.config.debug && !log::log_enabled!(log::Level::Debug) {
            return;
        }
        log::debug!("{}:", label);
        for &id in &self.schedule {
            let node = &self.nodes[id];
            log::debug!(
                "  {}: unmet = {}, writes = {}",
                node.name(),
                fmt_deps(&node.unmet_dependencies),
                fmt_deps(&node.read_writes.writes),
            );
        }
    }

    /// Dump the dependency graph in dot format when
    /// `INDUCTOR_WRITE_SCHEDULER_GRAPH=1` is set.
    fn debug_draw_graph(&self) {
        match std::env::var("INDUCTOR_WRITE_SCHEDULER_GRAPH") {
            Ok(ref value) if value == "1" => {}
            _ => return,
        }
        let mut dot = String::from("digraph schedule {\n");
        for &id in &self.schedule {
            let node = &self.nodes[id];
            for dep in &node.unmet_dependencies {
                dot.push_str(&format!("  \"{}\" -> \"{}\"\n", dep.name(), node.name()));
            }
        }
        for output in self.outputs.values() {
            dot.push_str(&format!("  \"{}\" -> \"OUTPUT\"\n", output.dep.name()));
        }
        dot.push_str("}\n");
        log::info!("scheduler graph:\n{}", dot);
    }
}

fn fmt_deps(deps: &BTreeSet<Dep>) -> String {
    let mut out = String::from("[");
    for (i, dep) in deps.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&dep.to_string());
    }
    out.push(']');
    out
}

/// A lone star write of a template kernel becomes a memory dep with the
/// buffer's canonical index and size, so epilogues can match on it.
fn canonicalize_template_write(
    node: &mut SchedulerNode,
    buffer: &dyn Buffer,
) -> Result<(), ScheduleError> {
    if node.read_writes.writes.len() != 1 {
        return Err(ScheduleError::TemplateWrite(node.name().to_string()));
    }
    let write = match node.read_writes.writes.iter().next() {
        Some(write) => write.clone(),
        None => return Err(ScheduleError::TemplateWrite(node.name().to_string())),
    };
    if let Dep::Star(star) = write {
        let (index, size) = buffer
            .canonicalize()
            .ok_or_else(|| ScheduleError::Unclassifiable(node.name().to_string()))?;
        node.read_writes.writes.clear();
        node.read_writes.writes.insert(Dep::memory(star.name, index, size));
    }
    Ok(())
}
