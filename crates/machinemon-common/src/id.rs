//! Client ids: snowflake numbers rendered as decimal strings, so they sort by
//! registration time.

use snowflake::SnowflakeIdBucket;
use std::sync::{Mutex, OnceLock};

/// Machine and node ids occupy five bits each in a snowflake.
const WORKER_MASK: i32 = 0x1f;

static CLIENT_IDS: OnceLock<Mutex<SnowflakeIdBucket>> = OnceLock::new();

fn bucket(machine_id: i32, node_id: i32) -> Mutex<SnowflakeIdBucket> {
    Mutex::new(SnowflakeIdBucket::new(
        machine_id & WORKER_MASK,
        node_id & WORKER_MASK,
    ))
}

/// Sets the worker identity stamped into new client ids. Only the first call
/// takes effect; returns false when the generator was already configured.
pub fn init(machine_id: i32, node_id: i32) -> bool {
    CLIENT_IDS.set(bucket(machine_id, node_id)).is_ok()
}

/// Mints an id for a newly registered client. Uses worker `(1, 1)` when
/// [`init`] was never called.
pub fn new_client_id() -> String {
    let ids = CLIENT_IDS.get_or_init(|| bucket(1, 1));
    let mut ids = ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    ids.get_id().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn ids_are_unique_across_threads() {
        init(1, 1);
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..250).map(|_| new_client_id()).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn ids_sort_by_creation() {
        let first: i64 = new_client_id().parse().unwrap();
        let second: i64 = new_client_id().parse().unwrap();
        assert!(first > 0);
        assert!(second > first);
    }

    #[test]
    fn later_init_is_ignored() {
        init(1, 1);
        assert!(!init(40, 99));
        assert!(!new_client_id().is_empty());
    }
}
