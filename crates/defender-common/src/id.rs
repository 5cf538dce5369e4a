use snowflake::SnowflakeIdBucket;
use std::sync::{Mutex, PoisonError};

static ID_GENERATOR: Mutex<Option<SnowflakeIdBucket>> = Mutex::new(None);

/// Initializes the report id generator.
///
/// `machine_id`: machine identifier (0-31)
/// `node_id`: node identifier (0-31)
pub fn init(machine_id: i32, node_id: i32) {
    let mut gen = ID_GENERATOR.lock().unwrap_or_else(PoisonError::into_inner);
    *gen = Some(SnowflakeIdBucket::new(machine_id, node_id));
}

/// Returns the next report id.
///
/// Ids are time ordered, so every report carries a larger id than the ones
/// published before it by this process.
pub fn next_report_id() -> u64 {
    let mut gen = ID_GENERATOR.lock().unwrap_or_else(PoisonError::into_inner);
    let bucket = gen.get_or_insert_with(|| SnowflakeIdBucket::new(1, 1));
    bucket.get_id().unsigned_abs()
}
