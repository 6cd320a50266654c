//! TigerStyle constants for selkie
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Service Identity
// =============================================================================

/// Number of low bits of a service id holding the worker-local sequence.
///
/// A service id is `worker_id << WORKER_ID_SHIFT | local_sequence`. Worker
/// ids are 1-based, so no valid service id is ever 0.
pub const WORKER_ID_SHIFT: u32 = 24;

/// Mask extracting the worker-local sequence from a service id
pub const SERVICE_SEQUENCE_MASK: u32 = (1 << WORKER_ID_SHIFT) - 1;

/// Maximum number of workers a server may host
pub const WORKER_COUNT_MAX: usize = 255;

/// Maximum worker-local service sequence before a worker refuses spawns
pub const SERVICE_SEQUENCE_COUNT_MAX: u32 = SERVICE_SEQUENCE_MASK;

// =============================================================================
// Sessions
// =============================================================================

/// Reserved session value; never valid as a request or response token
pub const SESSION_RESERVED: i32 = i32::MIN;

// =============================================================================
// Worker Loop
// =============================================================================

/// Maximum messages drained per queue wake, to amortise wake cost
pub const WORKER_BATCH_COUNT_MAX: usize = 1024;

/// Upper bound on how long a worker sleeps with no timer due (milliseconds)
pub const WORKER_IDLE_WAIT_MS_MAX: u64 = 100;

// =============================================================================
// Timer Wheel
// =============================================================================

/// Slots in the near wheel (must be a power of two)
pub const TIMER_NEAR_SLOTS: usize = 256;

/// Slots per cascade level (must be a power of two)
pub const TIMER_LEVEL_SLOTS: usize = 64;

/// Number of cascade levels above the near wheel
pub const TIMER_LEVEL_COUNT: usize = 4;

// =============================================================================
// Buffer
// =============================================================================

/// Bytes reserved in front of a fresh buffer for cheap prepends
pub const BUFFER_HEAD_RESERVED_BYTES: usize = 16;

/// Default initial buffer capacity in bytes
pub const BUFFER_CAPACITY_BYTES_DEFAULT: usize = 128;

// =============================================================================
// Cluster Envelope
// =============================================================================

/// Maximum payload carried by one cluster envelope (u16 length prefix)
pub const CLUSTER_PAYLOAD_BYTES_MAX: usize = u16::MAX as usize;

// =============================================================================
// Sockets
// =============================================================================

/// Default send-queue size at which a warning is logged (bytes)
pub const SEND_QUEUE_WARN_BYTES_DEFAULT: usize = 4 * 1024 * 1024;

/// Default send-queue size past which writes are rejected (bytes)
pub const SEND_QUEUE_ERROR_BYTES_DEFAULT: usize = 16 * 1024 * 1024;

/// Segment size used when write-chunked mode splits a payload (bytes)
pub const SOCKET_CHUNK_SIZE_BYTES: usize = 32 * 1024;

/// Interval between idle-timeout sweeps over a worker's connections (ms)
pub const SOCKET_SWEEP_INTERVAL_MS: u64 = 1000;

/// Timeout for the synchronous reachability probe (ms)
pub const CONNECT_PROBE_TIMEOUT_MS: u64 = 2000;

// Compile-time assertions for constant validity
const _: () = {
    assert!(WORKER_ID_SHIFT < 32);
    assert!(WORKER_COUNT_MAX <= (u32::MAX >> WORKER_ID_SHIFT) as usize);
    assert!(TIMER_NEAR_SLOTS.is_power_of_two());
    assert!(TIMER_LEVEL_SLOTS.is_power_of_two());
    assert!(SEND_QUEUE_WARN_BYTES_DEFAULT < SEND_QUEUE_ERROR_BYTES_DEFAULT);
    assert!(BUFFER_HEAD_RESERVED_BYTES >= 2); // cluster length prefix fits the headroom
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id_bits_partition_u32() {
        // worker bits and sequence bits together cover the id space
        let worker_bits = 32 - WORKER_ID_SHIFT;
        assert_eq!(WORKER_COUNT_MAX, (1usize << worker_bits) - 1);
        assert_eq!(SERVICE_SEQUENCE_MASK as u64, (1u64 << WORKER_ID_SHIFT) - 1);
    }

    #[test]
    fn test_limits_have_units_in_names() {
        // All byte limits end in _BYTES_, all time limits in _MS_,
        // all count limits in _COUNT_ or _SLOTS.
        let _: usize = CLUSTER_PAYLOAD_BYTES_MAX;
        let _: u64 = WORKER_IDLE_WAIT_MS_MAX;
        let _: usize = WORKER_BATCH_COUNT_MAX;
    }
}
