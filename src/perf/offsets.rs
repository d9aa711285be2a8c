//! Counter title index to byte offset mapping, rebuilt on every query.

use super::block::{CounterData, PerfObject};
use crate::error::Result;
use crate::util::ticks_to_ms;
use std::fmt;
use std::marker::PhantomData;

/// Unit of a raw counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Used as is.
    Raw,
    /// 100 ns ticks, reported in milliseconds.
    Ticks,
}

impl Unit {
    pub fn convert(self, raw: u64) -> u64 {
        match self {
            Unit::Raw => raw,
            Unit::Ticks => ticks_to_ms(raw),
        }
    }
}

/// A closed set of counters one metric family is interested in.
pub trait CounterField: Copy + Eq + fmt::Debug + 'static {
    const ALL: &'static [Self];

    fn title_index(self) -> u32;

    fn unit(self) -> Unit;

    /// Position of the field in [`CounterField::ALL`].
    fn slot(self) -> usize;
}

/// Declare a [`CounterField`] enum from `Variant = title_index [as Unit]` pairs.
macro_rules! counter_fields {
    (@unit) => { $crate::perf::offsets::Unit::Raw };
    (@unit $unit:ident) => { $crate::perf::offsets::Unit::$unit };

    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $variant:ident = $title:literal $(as $unit:ident)? ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $variant ),+
        }

        impl $crate::perf::offsets::CounterField for $name {
            const ALL: &'static [Self] = &[ $( $name::$variant ),+ ];

            fn title_index(self) -> u32 {
                match self {
                    $( $name::$variant => $title ),+
                }
            }

            fn unit(self) -> $crate::perf::offsets::Unit {
                match self {
                    $( $name::$variant => $crate::perf::offsets::counter_fields!(@unit $($unit)?) ),+
                }
            }

            fn slot(self) -> usize {
                self as usize
            }
        }
    };
}

pub(crate) use counter_fields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Slot {
    offset: u32,
    size: u32,
}

/// Where each field of `F` lives in an instance's counter block.
///
/// An offset of 0 means the counter is not provided by this system; reading
/// such a field yields 0.
#[derive(Clone, PartialEq, Eq)]
pub struct OffsetTable<F> {
    slots: Vec<Slot>,
    _fields: PhantomData<F>,
}

impl<F: CounterField> OffsetTable<F> {
    fn empty() -> Self {
        Self {
            slots: vec![Slot::default(); F::ALL.len()],
            _fields: PhantomData,
        }
    }

    pub fn offset(&self, field: F) -> u32 {
        self.slots[field.slot()].offset
    }

    pub fn is_present(&self, field: F) -> bool {
        self.offset(field) != 0
    }

    pub fn found_any(&self) -> bool {
        self.slots.iter().any(|s| s.offset != 0)
    }

    /// The raw value of `field`, or 0 when the counter is absent.
    pub fn read_raw(&self, counters: &CounterData<'_>, field: F) -> Result<u64> {
        let slot = self.slots[field.slot()];
        if slot.offset == 0 {
            return Ok(0);
        }
        counters.read(slot.offset, slot.size)
    }

    /// Like [`OffsetTable::read_raw`], converted to the field's unit.
    pub fn read(&self, counters: &CounterData<'_>, field: F) -> Result<u64> {
        self.read_raw(counters, field).map(|raw| field.unit().convert(raw))
    }
}

impl<F: CounterField> fmt::Debug for OffsetTable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(F::ALL.iter().map(|&field| (field, self.offset(field))))
            .finish()
    }
}

/// One pass over the counter definitions of `object`.
pub fn build_offsets<F: CounterField>(object: &PerfObject<'_>) -> Result<OffsetTable<F>> {
    let mut table = OffsetTable::<F>::empty();

    for counter in object.counters() {
        let counter = counter?;
        if let Some(&field) = F::ALL
            .iter()
            .find(|f| f.title_index() == counter.title_index)
        {
            table.slots[field.slot()] = Slot {
                offset: counter.offset,
                size: counter.size,
            };
        }
    }

    Ok(table)
}
