//! Bolero fuzzer for framed wire write/read sequences.
//!
//! Properties tested:
//! - Frames come out in the order they went in, index and payload intact
//! - Occupancy always equals the bytes of buffered frames
//! - Oversized payloads are rejected without touching the ring
//! - Wrap-around at every offset keeps payloads intact

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bolero::check;
use ogawayama_transport::layout::{MESSAGE_HEADER_SIZE, wire_footprint};
use ogawayama_transport::{AlwaysAlive, FramedWire, Liveness, TransportError};
use shm_primitives::{HeapRegion, MappedRegion};

#[derive(Debug, Clone, Copy)]
enum WireOp {
    Write { len: usize, index: u16 },
    Read,
}

fn pair(capacity: u64) -> (FramedWire, FramedWire) {
    let Some(size) = wire_footprint(capacity) else {
        panic!("capacity {capacity} has no footprint");
    };
    let backing: Arc<dyn MappedRegion> = Arc::new(HeapRegion::new_zeroed(size));
    let liveness: Arc<dyn Liveness> = Arc::new(AlwaysAlive);
    let timeout = Duration::from_millis(1);
    // SAFETY: fresh zeroed backing sized for one wire at offset 0.
    let writer =
        unsafe { FramedWire::init(backing.clone(), 0, capacity, liveness.clone(), timeout, "fuzz") };
    let reader = match unsafe { FramedWire::attach(backing, 0, liveness, timeout, "fuzz") } {
        Ok(reader) => reader,
        Err(e) => panic!("attach failed: {e}"),
    };
    (writer, reader)
}

fn payload(len: usize, index: u16) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ index as u8).collect()
}

fn execute_and_verify(capacity: u64, ops: &[WireOp]) -> Result<(), String> {
    let (writer, reader) = pair(capacity);
    let mut model: VecDeque<(u16, Vec<u8>)> = VecDeque::new();
    let mut used = 0u64;

    for (step, op) in ops.iter().enumerate() {
        match *op {
            WireOp::Write { len, index } => {
                let bytes = payload(len, index);
                let frame = (MESSAGE_HEADER_SIZE + len) as u64;
                if len > writer.max_payload() {
                    match writer.write(&bytes, index) {
                        Err(TransportError::MessageTooLarge { .. }) => {}
                        other => return Err(format!("step {step}: oversized write gave {other:?}")),
                    }
                } else if capacity - used >= frame {
                    writer
                        .write(&bytes, index)
                        .map_err(|e| format!("step {step}: write failed: {e}"))?;
                    used += frame;
                    model.push_back((index, bytes));
                }
            }
            WireOp::Read => {
                let read = reader
                    .read_message(false)
                    .map_err(|e| format!("step {step}: read failed: {e}"))?;
                match (read, model.pop_front()) {
                    (None, None) => {}
                    (Some((header, got)), Some((index, expected))) => {
                        if header.index != index || got != expected {
                            return Err(format!(
                                "step {step}: got frame {} of {} bytes, expected {index} of {}",
                                header.index,
                                got.len(),
                                expected.len()
                            ));
                        }
                        used -= (MESSAGE_HEADER_SIZE + expected.len()) as u64;
                    }
                    (read, expected) => {
                        return Err(format!("step {step}: read {read:?}, model had {expected:?}"));
                    }
                }
            }
        }
        if writer.occupied() != used {
            return Err(format!(
                "step {step}: occupied {} but model holds {used}",
                writer.occupied()
            ));
        }
    }
    Ok(())
}

fn main() {
    check!()
        .with_type::<(u8, Vec<(bool, u8, u16)>)>()
        .for_each(|(capacity_byte, ops_data)| {
            // 64..=1024 bytes, small enough to wrap often.
            let capacity = 64u64 << (capacity_byte % 5);
            let ops: Vec<WireOp> = ops_data
                .iter()
                .map(|(is_write, len, index)| {
                    if *is_write {
                        WireOp::Write {
                            len: *len as usize * 4,
                            index: *index,
                        }
                    } else {
                        WireOp::Read
                    }
                })
                .collect();

            if let Err(e) = execute_and_verify(capacity, &ops) {
                panic!("Invariant violated: {}", e);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzz_wire_wraps() {
        let mut ops = Vec::new();
        for i in 0..50u16 {
            ops.push(WireOp::Write {
                len: (i as usize * 7) % 40,
                index: i,
            });
            ops.push(WireOp::Read);
        }
        execute_and_verify(64, &ops).unwrap();
    }

    #[test]
    fn fuzz_wire_fill_then_drain() {
        let mut ops = vec![WireOp::Write { len: 1000, index: 0 }];
        for i in 0..20 {
            ops.push(WireOp::Write { len: 24, index: i });
        }
        ops.extend(std::iter::repeat_n(WireOp::Read, 25));
        execute_and_verify(256, &ops).unwrap();
    }
}
