//! Result aggregation for fanned-out calls
//!
//! Every fan-out result type implements `Merge`; a fan-out over a type
//! without an implementation does not compile. Inputs always arrive in
//! topology order, never arrival order.

use crate::model::Record;
use crate::shard::FindAndCount;

/// Result shape of an operation, used as a log and metrics label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    List,
    Scalar,
    OptionalSingle,
    Boolean,
    ListAndCount,
    Unit,
}

impl ResultShape {
    pub fn label(&self) -> &'static str {
        match self {
            ResultShape::List => "list",
            ResultShape::Scalar => "scalar",
            ResultShape::OptionalSingle => "optional_single",
            ResultShape::Boolean => "boolean",
            ResultShape::ListAndCount => "list_and_count",
            ResultShape::Unit => "unit",
        }
    }
}

/// Merge per-shard results, given in topology order, into one result
pub trait Merge: Sized {
    const SHAPE: ResultShape;

    fn merge(parts: Vec<Self>) -> Self;
}

/// Concatenate in topology order; no global re-sort, even when the filter
/// asked for an ordering.
impl Merge for Vec<Record> {
    const SHAPE: ResultShape = ResultShape::List;

    fn merge(parts: Vec<Self>) -> Self {
        let total = parts.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for part in parts {
            out.extend(part);
        }
        out
    }
}

impl Merge for u64 {
    const SHAPE: ResultShape = ResultShape::Scalar;

    fn merge(parts: Vec<Self>) -> Self {
        parts.into_iter().sum()
    }
}

/// First non-null in topology order
impl Merge for Option<Record> {
    const SHAPE: ResultShape = ResultShape::OptionalSingle;

    fn merge(parts: Vec<Self>) -> Self {
        parts.into_iter().flatten().next()
    }
}

impl Merge for bool {
    const SHAPE: ResultShape = ResultShape::Boolean;

    fn merge(parts: Vec<Self>) -> Self {
        parts.into_iter().any(|flag| flag)
    }
}

/// Rows concatenated, counts summed. Each shard applied LIMIT/OFFSET on its
/// own, so the merged window is up to N times the requested limit and is
/// not a global page.
impl Merge for FindAndCount {
    const SHAPE: ResultShape = ResultShape::ListAndCount;

    fn merge(parts: Vec<Self>) -> Self {
        let mut rows = Vec::new();
        let mut count = 0;
        for part in parts {
            rows.extend(part.rows);
            count += part.count;
        }
        FindAndCount { rows, count }
    }
}

impl Merge for () {
    const SHAPE: ResultShape = ResultShape::Unit;

    fn merge(_parts: Vec<Self>) -> Self {}
}
