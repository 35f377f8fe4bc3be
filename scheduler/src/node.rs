//! Scheduler node variants.
//!
//! Every node carries the same header (dependencies, users, order bounds)
//! over a variant payload. Nodes live in an arena keyed by [`NodeId`];
//! fusing retires constituents from the working schedule but their arena
//! slots stay alive, referenced by the fused node.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::iter;
use std::rc::Rc;

use cranelift_entity::entity_impl;
use either::Either;
use fnv::FnvHashMap;

use smelt_ir::{Buffer, Dep, Device, LoopBody, LoopRanges, ReadWrites, StrideTuple};

use crate::backend::GroupKey;
use crate::ScheduleError;

/// Identifies a scheduler node in the arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);
entity_impl!(NodeId, "node");

/// Identifies a synthetic output sink.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputId(u32);
entity_impl!(OutputId, "output");

/// Target of a user edge: a real node or a synthetic output sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UserRef {
    Node(NodeId),
    Output(OutputId),
}

impl UserRef {
    pub fn is_output(&self) -> bool {
        match self {
            UserRef::Output(_) => true,
            UserRef::Node(_) => false,
        }
    }
}

/// Downstream consumer edge out of a producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeUser {
    pub node: UserRef,
    pub can_inplace: bool,
}

/// Synthetic terminal pinning a graph output against dead-code elimination
/// and frees.
#[derive(Clone, Debug)]
pub struct OutputNode {
    pub dep: Dep,
    pub inverse_users: Vec<NodeId>,
}

/// Iteration-domain bucket a node belongs to: its device plus the backend's
/// group key over its sizes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Group {
    pub device: Device,
    pub key: GroupKey,
}

/// Variant payload of a scheduler node.
#[derive(Debug)]
pub enum NodeKind {
    /// Loop body the device backend emits itself.
    Computed {
        buffer: Rc<dyn Buffer>,
        ranges: LoopRanges,
        body: Rc<dyn LoopBody>,
        group: Group,
    },
    /// Template kernel; may head an epilogue fusion chain.
    Template {
        buffer: Rc<dyn Buffer>,
        ranges: LoopRanges,
        stride: StrideTuple,
        group: Group,
    },
    /// Opaque extern kernel. Never fuses.
    Extern { buffer: Rc<dyn Buffer> },
    /// Produces nothing; kept only so its name stays resolvable.
    Nop { buffer: Rc<dyn Buffer> },
    /// Stand-in for a group of fused constituents.
    Fused {
        snodes: Vec<NodeId>,
        names: BTreeSet<String>,
        first_name: String,
        group: Group,
        reduction: bool,
        template: bool,
    },
}

/// One schedulable unit.
#[derive(Debug)]
pub struct SchedulerNode {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub read_writes: ReadWrites,
    /// Reads whose producer has not yet been declared available.
    pub unmet_dependencies: BTreeSet<Dep>,
    pub users: Vec<NodeUser>,
    pub inverse_users: Vec<NodeId>,
    /// Names transitively required before this node may run.
    pub recursive_predecessors: BTreeSet<String>,
    pub min_order: usize,
    pub max_order: usize,
    /// Buffers that will not be used by any later node.
    pub last_usage: BTreeSet<String>,
    pub(crate) written: Cell<bool>,
}

impl SchedulerNode {
    pub(crate) fn new(name: String, kind: NodeKind) -> Self {
        SchedulerNode {
            name,
            kind,
            read_writes: ReadWrites::default(),
            unmet_dependencies: BTreeSet::new(),
            users: Vec::new(),
            inverse_users: Vec::new(),
            recursive_predecessors: BTreeSet::new(),
            min_order: 0,
            max_order: 0,
            last_usage: BTreeSet::new(),
            written: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// First constituent's name; the node's own name when unfused.
    pub fn first_name(&self) -> &str {
        match &self.kind {
            NodeKind::Fused { first_name, .. } => first_name,
            _ => &self.name,
        }
    }

    /// All buffer names this node covers.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        match &self.kind {
            NodeKind::Fused { names, .. } => Either::Left(names.iter().map(String::as_str)),
            _ => Either::Right(iter::once(self.name.as_str())),
        }
    }

    pub fn contains_name(&self, name: &str) -> bool {
        match &self.kind {
            NodeKind::Fused { names, .. } => names.contains(name),
            _ => self.name == name,
        }
    }

    pub fn name_set(&self) -> BTreeSet<String> {
        match &self.kind {
            NodeKind::Fused { names, .. } => names.clone(),
            _ => iter::once(self.name.clone()).collect(),
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The underlying IR buffer. `None` for fused nodes.
    pub fn buffer(&self) -> Option<&Rc<dyn Buffer>> {
        match &self.kind {
            NodeKind::Computed { buffer, .. }
            | NodeKind::Template { buffer, .. }
            | NodeKind::Extern { buffer }
            | NodeKind::Nop { buffer } => Some(buffer),
            NodeKind::Fused { .. } => None,
        }
    }

    pub fn group(&self) -> Option<&Group> {
        match &self.kind {
            NodeKind::Computed { group, .. }
            | NodeKind::Template { group, .. }
            | NodeKind::Fused { group, .. } => Some(group),
            _ => None,
        }
    }

    /// Iteration ranges of a computed or template node.
    pub fn ranges(&self) -> Option<&LoopRanges> {
        match &self.kind {
            NodeKind::Computed { ranges, .. } | NodeKind::Template { ranges, .. } => Some(ranges),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&Rc<dyn LoopBody>> {
        match &self.kind {
            NodeKind::Computed { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn device(&self) -> Device {
        match &self.kind {
            NodeKind::Computed { buffer, .. }
            | NodeKind::Template { buffer, .. }
            | NodeKind::Extern { buffer }
            | NodeKind::Nop { buffer } => buffer.device(),
            NodeKind::Fused { group, .. } => group.device,
        }
    }

    pub fn is_computed(&self) -> bool {
        match &self.kind {
            NodeKind::Computed { .. } => true,
            _ => false,
        }
    }

    pub fn is_extern(&self) -> bool {
        match &self.kind {
            NodeKind::Extern { .. } => true,
            _ => false,
        }
    }

    pub fn is_nop(&self) -> bool {
        match &self.kind {
            NodeKind::Nop { .. } => true,
            _ => false,
        }
    }

    pub fn is_fused(&self) -> bool {
        match &self.kind {
            NodeKind::Fused { .. } => true,
            _ => false,
        }
    }

    pub fn is_template(&self) -> bool {
        match &self.kind {
            NodeKind::Template { .. } => true,
            NodeKind::Fused { template, .. } => *template,
            _ => false,
        }
    }

    pub fn is_reduction(&self) -> bool {
        match &self.kind {
            NodeKind::Computed { ranges, .. } => ranges.is_reduction(),
            NodeKind::Fused { reduction, .. } => *reduction,
            _ => false,
        }
    }

    /// Number of constituents this node stands for.
    pub fn node_count(&self) -> usize {
        match &self.kind {
            NodeKind::Fused { snodes, .. } => snodes.len(),
            _ => 1,
        }
    }

    /// Buffer names touched by this node's reads or writes.
    pub fn used_buffer_names(&self) -> BTreeSet<String> {
        self.read_writes.buffer_names()
    }

    /// Whether this node may write its output over `read`'s storage.
    pub fn can_inplace(&self, read: &Dep) -> Result<bool, ScheduleError> {
        match &self.kind {
            NodeKind::Fused { .. } => Err(self.not_applicable("can_inplace")),
            NodeKind::Computed { buffer, .. } => {
                if !buffer.alias_names().is_empty() {
                    return Ok(false);
                }
                if self.read_writes.writes.len() == 1 {
                    if let Some(write) = self.read_writes.writes.iter().next() {
                        if let (Some(read), Some(write)) = (read.as_memory(), write.as_memory()) {
                            return Ok(read.index == write.index && read.size == write.size);
                        }
                    }
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Names this node aliases. Meaningless on fused nodes.
    pub fn aliases(&self) -> Result<&[String], ScheduleError> {
        match self.buffer() {
            Some(buffer) => Ok(buffer.alias_names()),
            None => Err(self.not_applicable("aliases")),
        }
    }

    /// Names this node mutates in place. Meaningless on fused nodes.
    pub fn mutations(&self) -> Result<&[String], ScheduleError> {
        match self.buffer() {
            Some(buffer) => Ok(buffer.mutation_names()),
            None => Err(self.not_applicable("mutations")),
        }
    }

    pub(crate) fn set_read_writes(&mut self, read_writes: ReadWrites, available: &BTreeSet<String>) {
        self.read_writes = read_writes;
        self.unmet_dependencies = self.read_writes.reads.clone();
        self.prune_deps(available);
    }

    /// Drop unmet deps on buffers already declared available.
    pub(crate) fn prune_deps(&mut self, available: &BTreeSet<String>) {
        let unmet = std::mem::replace(&mut self.unmet_dependencies, BTreeSet::new());
        self.unmet_dependencies = unmet
            .into_iter()
            .filter(|dep| !available.contains(dep.name()))
            .collect();
    }

    /// Add a whole-buffer ordering read on `name`.
    pub(crate) fn add_mutation_dep(
        &mut self,
        name: &str,
        available: &BTreeSet<String>,
    ) -> Result<(), ScheduleError> {
        if self.is_fused() {
            return Err(self.not_applicable("add_mutation_dep"));
        }
        let read_writes = self.read_writes.with_read(name);
        self.set_read_writes(read_writes, available);
        Ok(())
    }

    /// Rewrite this node's deps through the current mutation renames.
    pub(crate) fn update_mutated_names(
        &mut self,
        renames: &FnvHashMap<String, String>,
        available: &BTreeSet<String>,
    ) -> Result<(), ScheduleError> {
        if self.is_fused() {
            return Err(self.not_applicable("update_mutated_names"));
        }
        let read_writes = self.read_writes.rename(renames);
        self.set_read_writes(read_writes, available);
        Ok(())
    }

    /// Install the user list, deduplicated by target with `can_inplace`
    /// AND-ed across duplicates.
    pub(crate) fn set_users(&mut self, users: Vec<NodeUser>) -> Result<(), ScheduleError> {
        if self.is_fused() {
            return Err(self.not_applicable("set_users"));
        }
        let mut result: Vec<NodeUser> = Vec::with_capacity(users.len());
        for user in users {
            match result.iter_mut().find(|existing| existing.node == user.node) {
                Some(existing) => existing.can_inplace = existing.can_inplace && user.can_inplace,
                None => result.push(user),
            }
        }
        self.users = result;
        Ok(())
    }

    fn not_applicable(&self, op: &'static str) -> ScheduleError {
        ScheduleError::NotApplicable {
            op,
            node: self.name.clone(),
        }
    }
}
