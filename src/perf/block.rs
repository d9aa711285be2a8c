//! Bounds-checked views over a performance data block.
//!
//! Layout (all little-endian):
//!
//! ```text
//! PERF_DATA_BLOCK          88 bytes, "PERF" in UTF-16 at 0
//!   PERF_OBJECT_TYPE       64 bytes header
//!     PERF_COUNTER_DEFINITION * NumCounters     at object + HeaderLength
//!     PERF_INSTANCE_DEFINITION                  at object + DefinitionLength
//!       name (UTF-16)
//!       PERF_COUNTER_BLOCK                      at instance + ByteLength
//!     PERF_INSTANCE_DEFINITION ...              at counter block + ByteLength
//!   PERF_OBJECT_TYPE ...                        at object + TotalByteLength
//! ```
//!
//! Every declared length and count is checked against the bytes actually
//! returned before anything is dereferenced.

use crate::error::{ProbeError, Result};
use crate::util::{read_i32, read_u32, read_u32_as_usize, read_u64, read_utf16z};

/// `NumInstances` value of an object that has a single counter block.
pub const PERF_NO_INSTANCES: i32 = -1;

pub const DATA_BLOCK_LEN: usize = 88;
pub const OBJECT_TYPE_LEN: usize = 64;
pub const COUNTER_DEFINITION_LEN: usize = 40;
pub const INSTANCE_DEFINITION_LEN: usize = 24;
/// Smallest counter block: its own `ByteLength` field.
pub const COUNTER_BLOCK_MIN_LEN: usize = 4;

const SIGNATURE: [u8; 8] = [b'P', 0, b'E', 0, b'R', 0, b'F', 0];

fn malformed(what: impl Into<String>) -> ProbeError {
    ProbeError::Malformed(what.into())
}

/// The whole block returned by one counter read.
#[derive(Debug, Clone, Copy)]
pub struct PerfDataBlock<'a> {
    data: &'a [u8],
    header_len: usize,
    num_object_types: u32,
}

impl<'a> PerfDataBlock<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < DATA_BLOCK_LEN {
            return Err(malformed(format!("data block is {} bytes", data.len())));
        }
        if data[..SIGNATURE.len()] != SIGNATURE {
            return Err(malformed("bad data block signature"));
        }

        let total = read_u32_as_usize(data, 20).ok_or_else(|| malformed("data block length"))?;
        let header_len =
            read_u32_as_usize(data, 24).ok_or_else(|| malformed("data block header length"))?;
        let num_object_types = read_u32(data, 28).ok_or_else(|| malformed("object type count"))?;

        if total > data.len() || header_len < DATA_BLOCK_LEN || header_len > total {
            return Err(malformed(format!(
                "data block declares {} bytes with a {} byte header, {} available",
                total,
                header_len,
                data.len()
            )));
        }

        Ok(Self {
            data: &data[..total],
            header_len,
            num_object_types,
        })
    }

    pub fn num_object_types(&self) -> u32 {
        self.num_object_types
    }

    /// Object types in block order.
    pub fn objects(&self) -> Objects<'a> {
        Objects {
            data: self.data,
            offset: self.header_len,
            remaining: self.num_object_types,
        }
    }
}

/// Iterator over the object types of a block. Stops after the first error.
#[derive(Debug)]
pub struct Objects<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for Objects<'a> {
    type Item = Result<PerfObject<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        match PerfObject::parse(self.data, self.offset) {
            Ok(object) => {
                self.offset += object.data.len();
                Some(Ok(object))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// One object type (processor, process, disk, ...) and everything under it.
///
/// All offsets handed out by this view are relative to the start of the
/// object.
#[derive(Debug, Clone, Copy)]
pub struct PerfObject<'a> {
    data: &'a [u8],
    definition_len: usize,
    header_len: usize,
    title_index: u32,
    num_counters: u32,
    num_instances: i32,
}

impl<'a> PerfObject<'a> {
    fn parse(block: &'a [u8], offset: usize) -> Result<Self> {
        let header = block
            .get(offset..)
            .filter(|rest| rest.len() >= OBJECT_TYPE_LEN)
            .ok_or_else(|| malformed(format!("object type at {} past end of block", offset)))?;

        let total = read_u32_as_usize(header, 0).unwrap_or(0);
        let definition_len = read_u32_as_usize(header, 4).unwrap_or(0);
        let header_len = read_u32_as_usize(header, 8).unwrap_or(0);

        if total > header.len()
            || header_len < OBJECT_TYPE_LEN
            || definition_len < header_len
            || definition_len > total
        {
            return Err(malformed(format!(
                "object type at {}: total {} definition {} header {}",
                offset, total, definition_len, header_len
            )));
        }

        let data = &header[..total];
        let num_counters = read_u32(data, 32).unwrap_or(0);
        let num_instances = read_i32(data, 40).unwrap_or(0);

        let counter_room = (definition_len - header_len) / COUNTER_DEFINITION_LEN;
        if num_counters as usize > counter_room {
            return Err(malformed(format!(
                "object type declares {} counters, room for {}",
                num_counters, counter_room
            )));
        }

        if num_instances > 0 {
            let per_instance = INSTANCE_DEFINITION_LEN + COUNTER_BLOCK_MIN_LEN;
            let instance_room = (total - definition_len) / per_instance;
            if num_instances as usize > instance_room {
                return Err(malformed(format!(
                    "object type declares {} instances, room for {}",
                    num_instances, instance_room
                )));
            }
        }

        Ok(Self {
            data,
            definition_len,
            header_len,
            title_index: read_u32(data, 12).unwrap_or(0),
            num_counters,
            num_instances,
        })
    }

    pub fn title_index(&self) -> u32 {
        self.title_index
    }

    pub fn num_counters(&self) -> u32 {
        self.num_counters
    }

    /// Raw instance count; [`PERF_NO_INSTANCES`] for single-block objects.
    pub fn num_instances(&self) -> i32 {
        self.num_instances
    }

    pub fn has_instances(&self) -> bool {
        self.num_instances != PERF_NO_INSTANCES
    }

    pub fn counters(&self) -> Counters<'a> {
        Counters {
            data: &self.data[..self.definition_len],
            offset: self.header_len,
            remaining: self.num_counters,
        }
    }

    pub fn instances(&self) -> Result<Instances<'a>> {
        let remaining = usize::try_from(self.num_instances).map_err(|_| {
            malformed(format!(
                "object type {} has no instance list ({})",
                self.title_index, self.num_instances
            ))
        })?;

        Ok(Instances {
            data: self.data,
            offset: self.definition_len,
            remaining,
        })
    }
}

/// One counter definition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDefinition {
    pub title_index: u32,
    pub counter_type: u32,
    /// Width of the value in the counter block, in bytes.
    pub size: u32,
    /// Byte offset of the value from the start of each counter block.
    pub offset: u32,
}

#[derive(Debug)]
pub struct Counters<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for Counters<'a> {
    type Item = Result<CounterDefinition>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let at = self.offset;
        let len = read_u32_as_usize(self.data, at).unwrap_or(0);
        let end = at.checked_add(len).unwrap_or(usize::MAX);

        if len < COUNTER_DEFINITION_LEN || end > self.data.len() {
            self.remaining = 0;
            return Some(Err(malformed(format!(
                "counter definition at {} has length {}",
                at, len
            ))));
        }

        let record = &self.data[at..end];
        self.offset = end;

        Some(Ok(CounterDefinition {
            title_index: read_u32(record, 4).unwrap_or(0),
            counter_type: read_u32(record, 28).unwrap_or(0),
            size: read_u32(record, 32).unwrap_or(0),
            offset: read_u32(record, 36).unwrap_or(0),
        }))
    }
}

#[derive(Debug)]
pub struct Instances<'a> {
    data: &'a [u8],
    offset: usize,
    remaining: usize,
}

impl<'a> Instances<'a> {
    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    fn parse_one(&self) -> Result<(Instance<'a>, usize)> {
        let at = self.offset;
        let record = self
            .data
            .get(at..)
            .ok_or_else(|| malformed(format!("instance at {} past end of object", at)))?;

        let def_len = read_u32_as_usize(record, 0).unwrap_or(0);
        if def_len < INSTANCE_DEFINITION_LEN || def_len > record.len() {
            return Err(malformed(format!("instance at {} has length {}", at, def_len)));
        }

        let name_offset = read_u32_as_usize(record, 16).unwrap_or(0);
        let name_len = read_u32_as_usize(record, 20).unwrap_or(0);
        let name = if name_len == 0 {
            String::new()
        } else {
            read_utf16z(&record[..def_len], name_offset, name_len)
                .ok_or_else(|| malformed(format!("instance name at {} out of bounds", at)))?
        };

        let block = &record[def_len..];
        let block_len = read_u32_as_usize(block, 0).unwrap_or(0);
        if block_len < COUNTER_BLOCK_MIN_LEN || block_len > block.len() {
            return Err(malformed(format!(
                "counter block of instance at {} has length {}",
                at, block_len
            )));
        }

        let instance = Instance {
            name,
            unique_id: read_i32(record, 12).unwrap_or(-1),
            counters: CounterData {
                data: &block[..block_len],
            },
        };
        Ok((instance, def_len + block_len))
    }
}

impl<'a> Iterator for Instances<'a> {
    type Item = Result<Instance<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        match self.parse_one() {
            Ok((instance, advance)) => {
                self.offset += advance;
                Some(Ok(instance))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

/// One instance record and its counter values.
#[derive(Debug, Clone)]
pub struct Instance<'a> {
    pub name: String,
    pub unique_id: i32,
    pub counters: CounterData<'a>,
}

/// The counter block of one instance.
#[derive(Debug, Clone, Copy)]
pub struct CounterData<'a> {
    data: &'a [u8],
}

impl<'a> CounterData<'a> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read a `size`-byte value at `offset`. Eight-byte counters are read
    /// whole; any other width is read as a 32-bit value.
    pub fn read(&self, offset: u32, size: u32) -> Result<u64> {
        let at = offset as usize;
        let value = if size == 8 {
            read_u64(self.data, at)
        } else {
            read_u32(self.data, at).map(u64::from)
        };

        value.ok_or_else(|| {
            malformed(format!(
                "counter offset {} (size {}) outside {} byte counter block",
                offset,
                size,
                self.data.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::BlockBuilder;

    fn sample() -> Vec<u8> {
        BlockBuilder::new()
            .object(238, &[142, 144])
            .counter64(1746)
            .instance("_Total", &[7, 8, 9])
            .instance("0", &[1, 2, 3])
            .build()
    }

    #[test]
    fn test_parse_walks_counters_and_instances() {
        let data = sample();
        let block = PerfDataBlock::parse(&data).unwrap();
        assert_eq!(block.num_object_types(), 1);

        let object = block.objects().next().unwrap().unwrap();
        assert_eq!(object.title_index(), 238);
        assert_eq!(object.num_instances(), 2);

        let counters: Vec<_> = object.counters().collect::<Result<_>>().unwrap();
        assert_eq!(
            counters.iter().map(|c| c.title_index).collect::<Vec<_>>(),
            vec![142, 144, 1746]
        );
        assert_eq!(counters[2].size, 8);

        let instances: Vec<_> = object.instances().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(instances[0].name, "_Total");
        assert_eq!(instances[1].name, "0");

        let idle = counters[2];
        assert_eq!(instances[1].counters.read(idle.offset, idle.size).unwrap(), 3);
    }

    #[test]
    fn test_rejects_short_or_unsigned_data() {
        assert!(matches!(
            PerfDataBlock::parse(&[0u8; 10]),
            Err(ProbeError::Malformed(_))
        ));

        let mut data = sample();
        data[0] = b'X';
        assert!(matches!(
            PerfDataBlock::parse(&data),
            Err(ProbeError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_block_is_rejected() {
        let data = sample();
        let cut = &data[..data.len() - 8];
        assert!(matches!(
            PerfDataBlock::parse(cut),
            Err(ProbeError::Malformed(_))
        ));
    }

    #[test]
    fn test_inflated_instance_count_is_rejected() {
        let mut data = sample();
        // NumInstances of the first object
        data[DATA_BLOCK_LEN + 40..DATA_BLOCK_LEN + 44].copy_from_slice(&1000i32.to_le_bytes());

        let block = PerfDataBlock::parse(&data).unwrap();
        let err = block.objects().next().unwrap().unwrap_err();
        assert!(matches!(err, ProbeError::Malformed(_)));
    }

    #[test]
    fn test_counter_read_out_of_bounds() {
        let data = sample();
        let block = PerfDataBlock::parse(&data).unwrap();
        let object = block.objects().next().unwrap().unwrap();
        let instance = object.instances().unwrap().next().unwrap().unwrap();

        let past_end = instance.counters.len() as u32;
        assert!(matches!(
            instance.counters.read(past_end, 4),
            Err(ProbeError::Malformed(_))
        ));
    }

    #[test]
    fn test_single_block_object_has_no_instance_list() {
        let data = BlockBuilder::new().no_instances_object(230).build();
        let block = PerfDataBlock::parse(&data).unwrap();
        let object = block.objects().next().unwrap().unwrap();

        assert!(!object.has_instances());
        assert!(object.instances().is_err());
    }
}
