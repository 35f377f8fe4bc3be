//! Greedy fusion to a bounded fixed point.
//!
//! Candidates are bucketed by shared buffer (and, aggressively, by group
//! key), filtered through the legality predicates and the cycle check, then
//! applied in decreasing score order. Each pass re-sorts and re-runs the
//! topological sort so the schedule invariant holds between passes.

use std::collections::{BTreeMap, BTreeSet};

use fnv::FnvHashSet;
use log::trace;

use smelt_ir::{Dep, ReadWrites};

use crate::node::{Group, NodeId, NodeKind, SchedulerNode};
use crate::ScheduleError;

use super::Scheduler;

/// Score of one candidate pair; compared lexicographically, higher first.
type FusionScore = (bool, u64, i64);

impl Scheduler {
    /// Fuse until nothing shrinks. Bounded so pathological graphs cannot
    /// stall compilation; the cap only matters pathologically.
    pub(crate) fn fuse_nodes(&mut self) -> Result<(), ScheduleError> {
        for _ in 0..10 {
            let old_len = self.schedule.len();
            self.fuse_nodes_once()?;
            if self.schedule.len() == old_len {
                break;
            }
        }
        trace!(
            "fused {} nodes into {}",
            self.num_orig_nodes,
            self.schedule.len()
        );
        Ok(())
    }

    /// One fusion pass over the current candidate set.
    pub(crate) fn fuse_nodes_once(&mut self) -> Result<(), ScheduleError> {
        let mut live: FnvHashSet<NodeId> = self.schedule.iter().copied().collect();
        for (left, right) in self.get_possible_fusions() {
            // candidates were generated against an older schedule; resolve
            // both sides to their current fused owners first
            let left = self.name_to_fused_node[self.nodes[left].first_name()];
            let right = self.name_to_fused_node[self.nodes[right].first_name()];
            if self.can_fuse(left, right) && !self.will_fusion_create_cycle(left, right) {
                let merged = self.fuse(left, right)?;
                trace!("fused {} into {}", self.nodes[left].name(), self.nodes[merged].name());
                live.remove(&left);
                live.remove(&right);
                live.insert(merged);
                for name in self.nodes[merged].name_set() {
                    self.name_to_fused_node.insert(name, merged);
                }
            }
        }
        let mut order: Vec<NodeId> = live.into_iter().collect();
        order.sort_by_key(|&id| self.nodes[id].min_order);
        self.schedule = order;
        self.topological_sort_schedule()
    }

    /// All candidate pairs worth trying, best score first.
    pub(crate) fn get_possible_fusions(&mut self) -> Vec<(NodeId, NodeId)> {
        let mut possible: Vec<(NodeId, NodeId)> = Vec::new();
        let mut seen: FnvHashSet<(NodeId, NodeId)> = FnvHashSet::default();

        let mut buffer_grouping: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();
        for &id in &self.schedule {
            for name in self.nodes[id].used_buffer_names() {
                buffer_grouping.entry(name).or_default().push(id);
            }
        }
        for bucket in buffer_grouping.values() {
            self.check_all_pairs(bucket, &mut seen, &mut possible);
        }

        if self.cx.config.aggressive_fusion {
            let mut group_grouping: BTreeMap<Group, Vec<NodeId>> = BTreeMap::new();
            for &id in &self.schedule {
                if let Some(group) = self.nodes[id].group() {
                    group_grouping.entry(group.clone()).or_default().push(id);
                }
            }
            for bucket in group_grouping.values() {
                self.check_all_pairs(bucket, &mut seen, &mut possible);
            }
        }

        let mut scored: Vec<((NodeId, NodeId), FusionScore)> = possible
            .into_iter()
            .map(|pair| {
                let score = self.score_fusion(pair.0, pair.1);
                (pair, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored.into_iter().map(|(pair, _)| pair).collect()
    }

    fn check_all_pairs(
        &mut self,
        bucket: &[NodeId],
        seen: &mut FnvHashSet<(NodeId, NodeId)>,
        possible: &mut Vec<(NodeId, NodeId)>,
    ) {
        for (index, &left) in bucket.iter().enumerate() {
            for &right in &bucket[index + 1..] {
                let key = (left, right);
                if !seen.insert(key) {
                    continue;
                }
                if self.can_fuse(left, right) {
                    possible.push(key);
                } else if self.nodes[right].is_template() && self.can_fuse(right, left) {
                    // epilogue fusions are order dependent
                    possible.push((right, left));
                }
            }
        }
    }

    /// Whether combining `left` and `right` into one fused node is legal.
    pub(crate) fn can_fuse(&mut self, left: NodeId, right: NodeId) -> bool {
        if left == right {
            return false;
        }
        {
            let node1 = &self.nodes[left];
            let node2 = &self.nodes[right];
            if node1.is_extern() || node1.is_nop() {
                return false;
            }
            if node2.is_extern() || node2.is_nop() {
                return false;
            }
            if node2
                .names()
                .any(|name| node1.recursive_predecessors.contains(name))
            {
                return false; // node2 must go before node1
            }
            if node2.is_template() {
                return false; // only epilogues
            }
            if node1.device() != node2.device() {
                return false; // wrong device
            }
        }
        let device = self.nodes[left].device();

        let no_shared_data = self.score_fusion_memory(left, right) == 0;
        if no_shared_data
            && (!self.cx.config.aggressive_fusion
                || self.nodes[left].is_reduction()
                || self.nodes[right].is_reduction())
        {
            return false; // heuristic, not needed for correctness
        }

        if self.nodes[left].node_count() + self.nodes[right].node_count()
            > self.cx.config.max_fusion_size
        {
            return false; // heuristic, not needed for correctness
        }

        let depends = self.nodes[left]
            .names()
            .any(|name| self.nodes[right].recursive_predecessors.contains(name));
        if depends {
            // node2 consumes node1's output
            if !self.can_fuse_vertical(left, right) {
                return false;
            }
            self.ensure_backend(device);
            let Scheduler {
                backends, nodes, ..
            } = self;
            let backend = backends.get_mut(&device).unwrap();
            if nodes[left].is_template() {
                backend.can_fuse_template(&nodes[left], &nodes[right])
            } else {
                backend.can_fuse_vertical(&nodes[left], &nodes[right])
            }
        } else {
            // independent nodes, but they may share reads
            if self.nodes[left].is_template() {
                return false;
            }
            self.ensure_backend(device);
            let Scheduler {
                backends, nodes, ..
            } = self;
            let backend = backends.get_mut(&device).unwrap();
            backend.can_fuse_horizontal(&nodes[left], &nodes[right])
        }
    }

    /// A consumer may fuse into a producer only when each of its remaining
    /// reads either matches a producer write exactly or is produced by a
    /// node that can still be scheduled before the pair.
    pub(crate) fn can_fuse_vertical(&self, producer: NodeId, consumer: NodeId) -> bool {
        let node1 = &self.nodes[producer];
        let node2 = &self.nodes[consumer];
        let remaining: BTreeSet<&str> = node2
            .unmet_dependencies
            .difference(&node1.read_writes.writes)
            .map(Dep::name)
            .collect();
        for name in &remaining {
            if node1.contains_name(name) {
                // reads the producer at a different index or size, or via a
                // star dep; incompatible
                return false;
            }
        }
        for name in &remaining {
            if let Some(&owner) = self.name_to_fused_node.get(*name) {
                let predecessors = &self.nodes[owner].recursive_predecessors;
                if node1.names().any(|n| predecessors.contains(n)) {
                    return false;
                }
            }
        }
        true
    }

    /// Whether fusing the pair would close a path back into it through the
    /// currently fused graph.
    pub(crate) fn will_fusion_create_cycle(&self, left: NodeId, right: NodeId) -> bool {
        fn check(
            scheduler: &Scheduler,
            id: NodeId,
            combined_names: &BTreeSet<String>,
            combined_predecessors: &BTreeSet<String>,
            visited: &mut FnvHashSet<NodeId>,
        ) -> bool {
            let node = &scheduler.nodes[id];
            if !node.is_fused() || !visited.insert(id) {
                return false;
            }
            if node
                .recursive_predecessors
                .iter()
                .any(|name| combined_names.contains(name))
            {
                return true;
            }
            node.recursive_predecessors
                .iter()
                .filter(|name| !combined_predecessors.contains(*name))
                .filter_map(|name| scheduler.name_to_fused_node.get(name).copied())
                .any(|next| check(scheduler, next, combined_names, combined_predecessors, visited))
        }

        let mut combined_names = self.nodes[left].name_set();
        combined_names.extend(self.nodes[right].name_set());
        let union: BTreeSet<String> = self.nodes[left]
            .recursive_predecessors
            .union(&self.nodes[right].recursive_predecessors)
            .cloned()
            .collect();
        let combined_predecessors: BTreeSet<String> =
            union.difference(&combined_names).cloned().collect();

        let mut visited = FnvHashSet::default();
        combined_predecessors
            .iter()
            .filter_map(|name| self.name_to_fused_node.get(name).copied())
            .any(|id| {
                check(
                    self,
                    id,
                    &combined_names,
                    &combined_predecessors,
                    &mut visited,
                )
            })
    }

    /// Higher scores fuse first: reuse within the same reduction class,
    /// then saved memory traffic, then proximity in the original order.
    pub(crate) fn score_fusion(&self, left: NodeId, right: NodeId) -> FusionScore {
        let node1 = &self.nodes[left];
        let node2 = &self.nodes[right];
        let memory_score = self.score_fusion_memory(left, right);
        let spread_a = (node1.min_order as i64 - node2.max_order as i64).abs();
        let spread_b = (node2.min_order as i64 - node1.max_order as i64).abs();
        (
            node1.is_reduction() == node2.is_reduction() && memory_score > 0,
            memory_score,
            -spread_a.max(spread_b),
        )
    }

    /// Estimated memory operations saved by fusing the pair: total element
    /// hints of the deps the two sides share.
    pub(crate) fn score_fusion_memory(&self, left: NodeId, right: NodeId) -> u64 {
        let node1 = &self.nodes[left];
        let node2 = &self.nodes[right];
        let deps1: BTreeSet<&Dep> = node1
            .read_writes
            .reads
            .iter()
            .chain(node1.read_writes.writes.iter())
            .collect();
        let deps2: BTreeSet<&Dep> = node2
            .read_writes
            .reads
            .iter()
            .chain(node2.read_writes.writes.iter())
            .collect();
        deps1
            .intersection(&deps2)
            .map(|dep| dep.numel_hint(&self.cx.size_hints))
            .sum()
    }

    /// Replace `left` and `right` with one fused node covering both.
    fn fuse(&mut self, left: NodeId, right: NodeId) -> Result<NodeId, ScheduleError> {
        let snodes: Vec<NodeId> = self
            .constituents(left)
            .chain(self.constituents(right))
            .collect();

        let mut names: BTreeSet<String> = BTreeSet::new();
        let mut read_writes = ReadWrites::default();
        let mut recursive_predecessors: BTreeSet<String> = BTreeSet::new();
        let mut unmet: BTreeSet<Dep> = BTreeSet::new();
        let mut min_order = usize::max_value();
        let mut max_order = 0;
        let mut reduction = false;
        let mut template = false;
        for &constituent in &snodes {
            let node = &self.nodes[constituent];
            for name in node.names() {
                names.insert(name.to_string());
            }
            read_writes = read_writes.merge(&node.read_writes);
            recursive_predecessors.extend(node.recursive_predecessors.iter().cloned());
            unmet.extend(node.unmet_dependencies.iter().cloned());
            min_order = min_order.min(node.min_order);
            max_order = max_order.max(node.max_order);
            reduction = reduction || node.is_reduction();
            template = template || node.is_template();
        }

        // the group comes from the first reduction constituent if there is
        // one, else from the first constituent
        let group = snodes
            .iter()
            .map(|&constituent| &self.nodes[constituent])
            .find(|node| node.is_reduction())
            .or_else(|| snodes.first().map(|&constituent| &self.nodes[constituent]))
            .and_then(|node| node.group().cloned())
            .ok_or_else(|| ScheduleError::NotApplicable {
                op: "fuse",
                node: self.nodes[left].name().to_string(),
            })?;

        // internal edges collapse, and deps the fused bundle itself writes
        // are satisfied by construction
        let unmet: BTreeSet<Dep> = unmet
            .into_iter()
            .filter(|dep| !names.contains(dep.name()))
            .filter(|dep| !read_writes.writes.contains(dep))
            .collect();
        let recursive_predecessors: BTreeSet<String> = recursive_predecessors
            .difference(&names)
            .cloned()
            .collect();

        let first_name = self.nodes[snodes[0]].name().to_string();
        let joined = snodes
            .iter()
            .map(|&constituent| self.nodes[constituent].name())
            .collect::<Vec<_>>()
            .join("_");

        let mut node = SchedulerNode::new(
            joined,
            NodeKind::Fused {
                snodes,
                names,
                first_name,
                group,
                reduction,
                template,
            },
        );
        node.read_writes = read_writes;
        node.unmet_dependencies = unmet;
        node.recursive_predecessors = recursive_predecessors;
        node.min_order = min_order;
        node.max_order = max_order;
        Ok(self.nodes.push(node))
    }
}
