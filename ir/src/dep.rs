//! Dependency records extracted from buffer bodies.

use std::collections::BTreeSet;
use std::fmt;

use fnv::FnvHashMap;

use crate::expr::{IndexExpr, SizeHints, SizeTuple};

/// Read or write of a named buffer at a symbolic index over a symbolic size.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryDep {
    pub name: String,
    pub index: IndexExpr,
    pub size: SizeTuple,
}

/// Conservative whole-buffer dependency, used for mutation ordering edges
/// and graph outputs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StarDep {
    pub name: String,
}

/// A single dependency. A star dep and a memory dep on the same buffer never
/// compare equal; vertical fusion legality relies on that.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dep {
    Memory(MemoryDep),
    Star(StarDep),
}

impl Dep {
    pub fn memory(name: impl Into<String>, index: IndexExpr, size: impl IntoIterator<Item = crate::expr::Size>) -> Self {
        Dep::Memory(MemoryDep {
            name: name.into(),
            index,
            size: size.into_iter().collect(),
        })
    }

    pub fn star(name: impl Into<String>) -> Self {
        Dep::Star(StarDep { name: name.into() })
    }

    pub fn name(&self) -> &str {
        match self {
            Dep::Memory(dep) => &dep.name,
            Dep::Star(dep) => &dep.name,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryDep> {
        match self {
            Dep::Memory(dep) => Some(dep),
            Dep::Star(_) => None,
        }
    }

    /// Same dependency against a renamed buffer. Single-step lookup; the
    /// scheduler keeps its rename map collapsed as mutations are processed.
    pub fn rename(&self, renames: &FnvHashMap<String, String>) -> Dep {
        match renames.get(self.name()) {
            Some(new_name) => match self {
                Dep::Memory(dep) => Dep::Memory(MemoryDep {
                    name: new_name.clone(),
                    index: dep.index.clone(),
                    size: dep.size.clone(),
                }),
                Dep::Star(_) => Dep::Star(StarDep {
                    name: new_name.clone(),
                }),
            },
            None => self.clone(),
        }
    }

    /// Estimated element count touched, for the fusion memory score.
    pub fn numel_hint(&self, hints: &SizeHints) -> u64 {
        match self {
            Dep::Memory(dep) => hints.numel(&dep.size),
            Dep::Star(_) => 1,
        }
    }

    /// Copy of this dep with the trailing (reduced) size dropped, so writes
    /// of a reduction compare equal to its non-reduction consumers' reads.
    pub fn strip_last_size(&self) -> Dep {
        match self {
            Dep::Memory(dep) if !dep.size.is_empty() => {
                let mut size = dep.size.clone();
                size.pop();
                Dep::Memory(MemoryDep {
                    name: dep.name.clone(),
                    index: dep.index.clone(),
                    size,
                })
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for Dep {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dep::Memory(dep) => {
                write!(fmt, "{}[{}", dep.name, dep.index)?;
                for size in &dep.size {
                    write!(fmt, "; {}", size)?;
                }
                write!(fmt, "]")
            }
            Dep::Star(dep) => write!(fmt, "{}*", dep.name),
        }
    }
}

/// The reads and writes of one buffer's loop body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadWrites {
    pub reads: BTreeSet<Dep>,
    pub writes: BTreeSet<Dep>,
}

impl ReadWrites {
    pub fn new(
        reads: impl IntoIterator<Item = Dep>,
        writes: impl IntoIterator<Item = Dep>,
    ) -> Self {
        ReadWrites {
            reads: reads.into_iter().collect(),
            writes: writes.into_iter().collect(),
        }
    }

    /// Rename every dep through `renames`.
    pub fn rename(&self, renames: &FnvHashMap<String, String>) -> ReadWrites {
        ReadWrites {
            reads: self.reads.iter().map(|dep| dep.rename(renames)).collect(),
            writes: self.writes.iter().map(|dep| dep.rename(renames)).collect(),
        }
    }

    /// Union of two bundles, used when forming fused nodes.
    pub fn merge(&self, other: &ReadWrites) -> ReadWrites {
        ReadWrites {
            reads: self.reads.union(&other.reads).cloned().collect(),
            writes: self.writes.union(&other.writes).cloned().collect(),
        }
    }

    /// Same bundle with a conservative whole-buffer read added.
    pub fn with_read(&self, name: impl Into<String>) -> ReadWrites {
        let mut reads = self.reads.clone();
        reads.insert(Dep::star(name));
        ReadWrites {
            reads,
            writes: self.writes.clone(),
        }
    }

    /// Buffer names touched by either side.
    pub fn buffer_names(&self) -> BTreeSet<String> {
        self.reads
            .iter()
            .chain(self.writes.iter())
            .map(|dep| dep.name().to_string())
            .collect()
    }
}
