//! Performance counter blocks: the query protocol, offset discovery and the
//! instance walker.

pub mod block;
pub mod offsets;
pub mod walker;

pub use block::{CounterDefinition, PerfDataBlock, PerfObject, PERF_NO_INSTANCES};
pub use offsets::{build_offsets, CounterField, OffsetTable, Unit};
pub use walker::{HyperThreadHeuristic, InstanceWalker, NoSiblingMerge, Row, SiblingPolicy};

use crate::buffer::ScratchBuffer;
use crate::error::{ProbeError, Result};
use crate::platform::{CounterSource, ReadError};
use tracing::{debug, trace};

/// Counter key of the processor object.
pub const KEY_PROCESSOR: &str = "238";
/// Counter key of the process object.
pub const KEY_PROCESS: &str = "230";
/// Counter key of the logical disk object.
pub const KEY_DISK: &str = "236";

/// Read the counter block for `key` into `buffer` and return its first object
/// type that has instances.
///
/// The buffer grows one increment at a time for as long as the source says
/// it is too small. The returned view borrows the buffer, so it is gone by
/// the next query.
pub fn query<'b, S>(source: &mut S, buffer: &'b mut ScratchBuffer, key: &str) -> Result<PerfObject<'b>>
where
    S: CounterSource + ?Sized,
{
    buffer.ensure(0);

    let len = loop {
        match source.read_counters(key, buffer.as_mut_slice()) {
            Ok(len) => break len,
            Err(ReadError::MoreData) => {
                let size = buffer.grow();
                trace!(key, size, "counter block did not fit");
            }
            Err(ReadError::Os(code)) => {
                debug!(key, code, "counter read failed");
                return Err(ProbeError::from_os(code));
            }
        }
    };

    let buffer: &'b ScratchBuffer = buffer;
    let data = buffer
        .as_slice()
        .get(..len)
        .ok_or_else(|| ProbeError::Malformed(format!("read reported {} bytes", len)))?;

    first_object_with_instances(PerfDataBlock::parse(data)?, key)
}

fn first_object_with_instances<'a>(block: PerfDataBlock<'a>, key: &str) -> Result<PerfObject<'a>> {
    let mut objects = block.objects();

    let first = objects
        .next()
        .ok_or_else(|| ProbeError::NoInstances(key.to_string()))??;
    if first.has_instances() {
        return Ok(first);
    }

    // Seen when the same process also has the PDH library loaded: the
    // requested object reports no instances and a later one carries them.
    debug!(
        key,
        object_types = block.num_object_types(),
        "first object type has no instances, scanning the rest"
    );
    for object in objects {
        let object = object?;
        if object.has_instances() {
            return Ok(object);
        }
    }

    debug!(key, "no object type with instances");
    Err(ProbeError::NoInstances(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::BlockBuilder;

    /// Reports "more data" until the buffer fits its block.
    struct SizedSource {
        data: Vec<u8>,
        reads: usize,
    }

    impl CounterSource for SizedSource {
        fn read_counters(&mut self, _key: &str, buf: &mut [u8]) -> std::result::Result<usize, ReadError> {
            self.reads += 1;
            if buf.len() < self.data.len() {
                return Err(ReadError::MoreData);
            }
            buf[..self.data.len()].copy_from_slice(&self.data);
            Ok(self.data.len())
        }
    }

    struct FailingSource(u32);

    impl CounterSource for FailingSource {
        fn read_counters(&mut self, _key: &str, _buf: &mut [u8]) -> std::result::Result<usize, ReadError> {
            Err(ReadError::Os(self.0))
        }
    }

    fn big_block(instances: usize) -> Vec<u8> {
        let mut builder = BlockBuilder::new().object(230, &[784, 6, 28, 174, 180]);
        for i in 0..instances {
            builder = builder.instance(&format!("process{}", i), &[i as u64, 0, 0, 0, 0]);
        }
        builder.build()
    }

    #[test]
    fn test_growth_is_bounded_by_data_size() {
        let data = big_block(40);
        let size = data.len();
        let increment = 64;

        let mut source = SizedSource { data, reads: 0 };
        let mut buffer = ScratchBuffer::new(increment);
        let object = query(&mut source, &mut buffer, KEY_PROCESS).unwrap();
        assert_eq!(object.num_instances(), 40);

        let grows = source.reads - 1;
        assert!(grows <= (size + increment - 1) / increment);
        assert!(buffer.capacity() >= size);
        assert!(buffer.capacity() < size + increment);
    }

    #[test]
    fn test_buffer_is_reused_without_growth() {
        let mut source = SizedSource {
            data: big_block(3),
            reads: 0,
        };
        let mut buffer = ScratchBuffer::new(16);
        query(&mut source, &mut buffer, KEY_PROCESS).unwrap();
        let capacity = buffer.capacity();

        source.reads = 0;
        query(&mut source, &mut buffer, KEY_PROCESS).unwrap();
        assert_eq!(source.reads, 1);
        assert_eq!(buffer.capacity(), capacity);
    }

    #[test]
    fn test_other_failures_surface_the_code() {
        let mut buffer = ScratchBuffer::new(16);
        let err = query(&mut FailingSource(5), &mut buffer, KEY_DISK).unwrap_err();
        assert_eq!(err, ProbeError::Os(5));
    }

    #[test]
    fn test_scans_past_object_without_instances() {
        let data = BlockBuilder::new()
            .no_instances_object(230)
            .object(230, &[784])
            .instance("System", &[4])
            .build();
        let mut source = SizedSource { data, reads: 0 };
        let mut buffer = ScratchBuffer::default();

        let object = query(&mut source, &mut buffer, KEY_PROCESS).unwrap();
        assert_eq!(object.num_instances(), 1);
    }

    #[test]
    fn test_no_instances_anywhere_is_a_lookup_failure() {
        let data = BlockBuilder::new()
            .no_instances_object(230)
            .no_instances_object(232)
            .build();
        let mut source = SizedSource { data, reads: 0 };
        let mut buffer = ScratchBuffer::default();

        let err = query(&mut source, &mut buffer, KEY_PROCESS).unwrap_err();
        assert_eq!(err, ProbeError::NoInstances("230".to_string()));
        assert!(err.is_not_found());
    }
}
