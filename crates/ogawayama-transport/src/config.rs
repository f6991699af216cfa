use std::time::Duration;

use crate::layout::{LENGTH_PREFIX_SIZE, LayoutError, MESSAGE_HEADER_SIZE};

/// Default bound on every blocking wait before liveness is re-checked.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default request wire capacity (client -> server).
pub const DEFAULT_REQUEST_CAPACITY: u64 = 32 * 1024;

/// Default response wire capacity (server -> client).
pub const DEFAULT_RESPONSE_CAPACITY: u64 = 32 * 1024;

/// Default capacity of each result-set wire.
pub const DEFAULT_RESULT_SET_CAPACITY: u64 = 64 * 1024;

/// Default number of result sets a session can stream at once.
pub const DEFAULT_RESULT_SET_SLOTS: u32 = 16;

/// Default number of parallel producers per result set.
pub const DEFAULT_WRITERS_PER_RESULT_SET: u32 = 4;

/// Default number of response slots per client session.
pub const DEFAULT_RESPONSE_SLOTS: usize = 16;

/// Transport configuration shared by server and client.
///
/// Layout fields only matter to the side that creates a segment; the opener
/// reads them back from the segment header.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on each blocking wait.
    pub timeout: Duration,
    /// Request wire capacity in bytes.
    pub request_capacity: u64,
    /// Response wire capacity in bytes.
    pub response_capacity: u64,
    /// Capacity of each result-set wire in bytes.
    pub result_set_capacity: u64,
    /// Result sets per session.
    pub result_set_slots: u32,
    /// Wires (parallel producers) per result set.
    pub writers_per_result_set: u32,
    /// Response slots per client session.
    pub response_slots: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            response_capacity: DEFAULT_RESPONSE_CAPACITY,
            result_set_capacity: DEFAULT_RESULT_SET_CAPACITY,
            result_set_slots: DEFAULT_RESULT_SET_SLOTS,
            writers_per_result_set: DEFAULT_WRITERS_PER_RESULT_SET,
            response_slots: DEFAULT_RESPONSE_SLOTS,
        }
    }
}

impl TransportConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_wire_capacities(mut self, request: u64, response: u64) -> Self {
        self.request_capacity = request;
        self.response_capacity = response;
        self
    }

    pub fn with_result_sets(mut self, slots: u32, writers: u32, capacity: u64) -> Self {
        self.result_set_slots = slots;
        self.writers_per_result_set = writers;
        self.result_set_capacity = capacity;
        self
    }

    pub fn with_response_slots(mut self, slots: usize) -> Self {
        self.response_slots = slots;
        self
    }

    /// Reject configurations no segment could be laid out for.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.timeout.is_zero() {
            return Err(LayoutError::InvalidConfig("timeout must be > 0"));
        }
        if self.request_capacity <= MESSAGE_HEADER_SIZE as u64
            || self.response_capacity <= MESSAGE_HEADER_SIZE as u64
        {
            return Err(LayoutError::InvalidConfig(
                "wire capacity must exceed the message header",
            ));
        }
        if self.request_capacity > u32::MAX as u64 || self.response_capacity > u32::MAX as u64 {
            return Err(LayoutError::InvalidConfig(
                "wire capacity must fit the u32 length field",
            ));
        }
        if self.result_set_capacity <= LENGTH_PREFIX_SIZE as u64
            || self.result_set_capacity > u32::MAX as u64
        {
            return Err(LayoutError::InvalidConfig(
                "result set capacity must exceed the length prefix and fit in u32",
            ));
        }
        if self.result_set_slots == 0 || self.writers_per_result_set == 0 {
            return Err(LayoutError::InvalidConfig(
                "result set slots and writers must be > 0",
            ));
        }
        if self.response_slots == 0 || self.response_slots > u16::MAX as usize + 1 {
            return Err(LayoutError::InvalidConfig(
                "response slots must be within the u16 index range",
            ));
        }
        Ok(())
    }
}
