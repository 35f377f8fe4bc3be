//! Symbolic sizes and affine index expressions.
//!
//! Shape and stride algebra proper lives in the lowering layer. The
//! scheduler only ever needs three queries: structural equality of indices,
//! per-symbol strides for loop ordering, and rough element counts for the
//! fusion score. This module is the smallest algebra answering those.

use std::collections::BTreeMap;
use std::fmt;

use fnv::FnvHashMap;
use smallvec::SmallVec;

/// Extent of one dimension, literal or symbolic.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Size {
    Lit(u64),
    Sym(String),
}

impl Size {
    pub fn sym(name: impl Into<String>) -> Self {
        Size::Sym(name.into())
    }

    pub fn is_one(&self) -> bool {
        match self {
            Size::Lit(1) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Size::Lit(value) => write!(fmt, "{}", value),
            Size::Sym(name) => write!(fmt, "{}", name),
        }
    }
}

/// Tuple of sizes describing a dependency footprint or an iteration domain.
pub type SizeTuple = SmallVec<[Size; 4]>;

/// Concrete guesses for symbolic sizes, fed by the shape layer.
///
/// Unknown symbols resolve to `fallback` so scoring stays total when a
/// dynamic dimension has no recorded hint.
#[derive(Clone, Debug)]
pub struct SizeHints {
    hints: FnvHashMap<String, u64>,
    fallback: u64,
}

impl Default for SizeHints {
    fn default() -> Self {
        SizeHints {
            hints: FnvHashMap::default(),
            fallback: 8192,
        }
    }
}

impl SizeHints {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_fallback(fallback: u64) -> Self {
        SizeHints {
            hints: FnvHashMap::default(),
            fallback,
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, hint: u64) {
        self.hints.insert(name.into(), hint);
    }

    pub fn hint(&self, size: &Size) -> u64 {
        match size {
            Size::Lit(value) => *value,
            Size::Sym(name) => self.hints.get(name).copied().unwrap_or(self.fallback),
        }
    }

    /// Estimated element count of a size tuple. Empty tuples are scalars.
    pub fn numel(&self, sizes: &[Size]) -> u64 {
        sizes.iter().map(|size| self.hint(size)).product()
    }
}

/// Canonical affine index over iteration symbols: `Σ stride·symbol + offset`.
///
/// Terms are kept sorted by symbol, deduplicated and stripped of zero
/// strides, so two indices address the same locations exactly when they
/// compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexExpr {
    terms: SmallVec<[(String, i64); 2]>,
    offset: i64,
}

impl IndexExpr {
    pub fn constant(offset: i64) -> Self {
        IndexExpr {
            terms: SmallVec::new(),
            offset,
        }
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        IndexExpr::affine(Some((name.into(), 1)), 0)
    }

    pub fn affine(terms: impl IntoIterator<Item = (String, i64)>, offset: i64) -> Self {
        let mut collected: BTreeMap<String, i64> = BTreeMap::new();
        for (symbol, stride) in terms {
            *collected.entry(symbol).or_insert(0) += stride;
        }
        IndexExpr {
            terms: collected
                .into_iter()
                .filter(|(_, stride)| *stride != 0)
                .collect(),
            offset,
        }
    }

    /// Stride of `symbol` in this index, zero when the symbol is absent.
    pub fn stride_of(&self, symbol: &str) -> i64 {
        self.terms
            .iter()
            .find(|(name, _)| name == symbol)
            .map(|(_, stride)| *stride)
            .unwrap_or(0)
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn terms(&self) -> &[(String, i64)] {
        &self.terms
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }
}

impl fmt::Display for IndexExpr {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(fmt, "{}", self.offset);
        }
        for (i, (symbol, stride)) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(fmt, " + ")?;
            }
            if *stride == 1 {
                write!(fmt, "{}", symbol)?;
            } else {
                write!(fmt, "{}*{}", stride, symbol)?;
            }
        }
        if self.offset != 0 {
            write!(fmt, " + {}", self.offset)?;
        }
        Ok(())
    }
}

/// Iteration domain of a computed buffer, split into the pointwise and
/// reduction parts produced by `simplify_and_reorder`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopRanges {
    pub iter: SizeTuple,
    pub reduce: SizeTuple,
}

impl LoopRanges {
    pub fn pointwise(iter: impl IntoIterator<Item = Size>) -> Self {
        LoopRanges {
            iter: iter.into_iter().collect(),
            reduce: SmallVec::new(),
        }
    }

    pub fn reduction(
        iter: impl IntoIterator<Item = Size>,
        reduce: impl IntoIterator<Item = Size>,
    ) -> Self {
        LoopRanges {
            iter: iter.into_iter().collect(),
            reduce: reduce.into_iter().collect(),
        }
    }

    pub fn is_reduction(&self) -> bool {
        !self.reduce.is_empty()
    }
}
