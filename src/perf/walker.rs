//! Decoding the instances of an object into rows.

use super::block::{Instance, PerfObject};
use super::offsets::{CounterField, OffsetTable};
use crate::error::Result;
use crate::platform::CpuTopology;
use std::fmt;
use std::marker::PhantomData;
use std::ops::ControlFlow;
use tracing::trace;

/// The decoded fields of one instance, or of a group of merged siblings.
#[derive(Clone, PartialEq, Eq)]
pub struct Row<F> {
    /// Position of the (first) instance in the walk.
    pub index: usize,
    pub name: String,
    values: Vec<u64>,
    _fields: PhantomData<F>,
}

impl<F: CounterField> Row<F> {
    pub fn get(&self, field: F) -> u64 {
        self.values[field.slot()]
    }

    /// Add every field of `other` into this row.
    pub fn merge(&mut self, other: &Row<F>) {
        for (mine, theirs) in self.values.iter_mut().zip(&other.values) {
            *mine = mine.saturating_add(*theirs);
        }
    }
}

impl<F: CounterField> fmt::Debug for Row<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Row")
            .field("index", &self.index)
            .field("name", &self.name)
            .field(
                "values",
                &F::ALL
                    .iter()
                    .map(|&field| (field, self.get(field)))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Walks the instances of one object, applying an offset table.
///
/// ```ignore
/// let rows = InstanceWalker::new(&object, &offsets)
///     .skip_first()
///     .merge_siblings(Some(2))
///     .collect()?;
/// ```
pub struct InstanceWalker<'w, 'a, F> {
    object: &'w PerfObject<'a>,
    offsets: &'w OffsetTable<F>,
    skip_first: bool,
    exclude: Option<Box<dyn Fn(&Row<F>) -> bool + 'w>>,
    group_size: usize,
}

impl<'w, 'a, F: CounterField> InstanceWalker<'w, 'a, F> {
    pub fn new(object: &'w PerfObject<'a>, offsets: &'w OffsetTable<F>) -> Self {
        Self {
            object,
            offsets,
            skip_first: false,
            exclude: None,
            group_size: 1,
        }
    }

    /// Drop the first instance (a totals row) before indexing starts.
    pub fn skip_first(mut self) -> Self {
        self.skip_first = true;
        self
    }

    /// Leave out rows matching `sentinel`. Excluded rows still take up
    /// their index, and siblings of an excluded row are dropped with it.
    pub fn exclude(mut self, sentinel: impl Fn(&Row<F>) -> bool + 'w) -> Self {
        self.exclude = Some(Box::new(sentinel));
        self
    }

    /// Merge every `group` consecutive instances into the row of the first
    /// one. `None` or a group of 1 keeps instances apart.
    pub fn merge_siblings(mut self, group: Option<usize>) -> Self {
        self.group_size = group.unwrap_or(1).max(1);
        self
    }

    fn decode(&self, index: usize, instance: &Instance<'_>) -> Result<Row<F>> {
        let values = F::ALL
            .iter()
            .map(|&field| self.offsets.read(&instance.counters, field))
            .collect::<Result<Vec<_>>>()?;

        Ok(Row {
            index,
            name: instance.name.clone(),
            values,
            _fields: PhantomData,
        })
    }

    fn is_excluded(&self, row: &Row<F>) -> bool {
        self.exclude.as_ref().map_or(false, |sentinel| sentinel(row))
    }

    /// Hand every row to `visit` until it breaks. Breaking is not an error.
    pub fn for_each(self, mut visit: impl FnMut(Row<F>) -> ControlFlow<()>) -> Result<()> {
        let mut instances = self.object.instances()?;
        if self.skip_first {
            if let Some(first) = instances.next() {
                first?;
            }
        }

        let k = self.group_size;
        let mut pending: Option<Row<F>> = None;

        for (index, instance) in instances.enumerate() {
            let row = self.decode(index, &instance?)?;

            if index % k == 0 {
                if self.is_excluded(&row) {
                    trace!(index, name = %row.name, "skipping sentinel instance");
                } else {
                    pending = Some(row);
                }
            } else if let Some(current) = pending.as_mut() {
                current.merge(&row);
            }

            if (index + 1) % k == 0 {
                if let Some(done) = pending.take() {
                    if visit(done).is_break() {
                        return Ok(());
                    }
                }
            }
        }

        if let Some(done) = pending.take() {
            let _ = visit(done);
        }
        Ok(())
    }

    pub fn collect(self) -> Result<Vec<Row<F>>> {
        let mut rows = Vec::new();
        self.for_each(|row| {
            rows.push(row);
            ControlFlow::Continue(())
        })?;
        Ok(rows)
    }

    /// Stop at the first row matching `key`. `Ok(None)` when the walk
    /// completes without a match.
    pub fn find(self, key: impl Fn(&Row<F>) -> bool) -> Result<Option<Row<F>>> {
        let mut found = None;
        self.for_each(|row| {
            if key(&row) {
                found = Some(row);
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(found)
    }
}

// ============================================================================
// Sibling policies
// ============================================================================

/// Decides how many consecutive processor instances make up one reported CPU.
pub trait SiblingPolicy: fmt::Debug {
    /// Group size for `instances` per-processor records, or `None` to report
    /// each record on its own.
    fn group_size(&self, topology: &CpuTopology, instances: usize) -> Option<usize>;
}

/// Assume one record per logical processor when hyper-threading is on and
/// `physical_cores * threads_per_core` equals the record count, and merge
/// the threads of each core.
///
/// This is a heuristic: nothing guarantees that sibling threads are
/// numbered consecutively.
#[derive(Debug, Clone, Copy, Default)]
pub struct HyperThreadHeuristic;

impl SiblingPolicy for HyperThreadHeuristic {
    fn group_size(&self, topology: &CpuTopology, instances: usize) -> Option<usize> {
        let threads = topology.threads_per_core as usize;
        let logical = (topology.physical_cores as usize).checked_mul(threads)?;

        (topology.hyperthreading && threads > 1 && logical == instances).then_some(threads)
    }
}

/// Report every processor record as its own CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSiblingMerge;

impl SiblingPolicy for NoSiblingMerge {
    fn group_size(&self, _topology: &CpuTopology, _instances: usize) -> Option<usize> {
        None
    }
}
