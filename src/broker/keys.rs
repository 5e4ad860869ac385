//! Key naming for every bucket in the store.
//!
//! All keys of one queue share the `{<qname>}` hash tag so that they land on
//! a single shard and can be touched together from one script.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const NAMESPACE: &str = "dispatchq";

/// Pub/sub channel carrying `cancel` messages (payload = task id)
pub const CANCELLATION_CHANNEL: &str = "dispatchq:cancelation";

/// Roster of live servers (zset, score = record expiry)
pub const ALL_SERVERS: &str = "dispatchq:servers";

/// Roster of live worker sets (zset, score = record expiry)
pub const ALL_WORKERS: &str = "dispatchq:workers";

/// `dispatchq:{<qname>}:` — prefix shared by every key of a queue
pub fn queue_prefix(qname: &str) -> String {
    format!("{NAMESPACE}:{{{qname}}}:")
}

/// `dispatchq:{<qname>}:t:` — prefix of task hashes, passed into scripts
pub fn task_prefix(qname: &str) -> String {
    format!("{}t:", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:t:<id>` — the task hash (msg, state, …)
pub fn task_key(qname: &str, id: &str) -> String {
    format!("{}{}", task_prefix(qname), id)
}

/// `dispatchq:{<qname>}:pending` (list)
pub fn pending_key(qname: &str) -> String {
    format!("{}pending", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:active` (list)
pub fn active_key(qname: &str) -> String {
    format!("{}active", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:lease` (zset, score = lease expiry)
pub fn lease_key(qname: &str) -> String {
    format!("{}lease", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:scheduled` (zset, score = process-at)
pub fn scheduled_key(qname: &str) -> String {
    format!("{}scheduled", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:retry` (zset, score = retry-at)
pub fn retry_key(qname: &str) -> String {
    format!("{}retry", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:archived` (zset, score = archive time)
pub fn archived_key(qname: &str) -> String {
    format!("{}archived", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:completed` (zset, score = retention expiry)
pub fn completed_key(qname: &str) -> String {
    format!("{}completed", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:paused` — existence pauses dequeues
pub fn paused_key(qname: &str) -> String {
    format!("{}paused", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:g:` — prefix of group zsets, passed into scripts
pub fn group_prefix(qname: &str) -> String {
    format!("{}g:", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:g:<group>` (zset, score = first-seen time)
pub fn group_key(qname: &str, group: &str) -> String {
    format!("{}{}", group_prefix(qname), group)
}

/// `dispatchq:{<qname>}:groups` — set of group names with members
pub fn all_groups_key(qname: &str) -> String {
    format!("{}groups", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:g:<group>:<set_id>` — an aggregation set snapshot
pub fn aggregation_set_key(qname: &str, group: &str, set_id: &str) -> String {
    format!("{}:{}", group_key(qname, group), set_id)
}

/// `dispatchq:{<qname>}:aggregation_sets` (zset, score = set expiry)
pub fn all_aggregation_sets_key(qname: &str) -> String {
    format!("{}aggregation_sets", queue_prefix(qname))
}

/// `dispatchq:{<qname>}:unique:<raw>` — TTL-bearing deduplication lock
pub fn unique_key(qname: &str, raw: &str) -> String {
    format!("{}unique:{}", queue_prefix(qname), raw)
}

/// Default uniqueness token for a task: a stable hash over
/// (queue, type, payload)
pub fn unique_fingerprint(qname: &str, task_type: &str, payload: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    qname.hash(&mut hasher);
    task_type.hash(&mut hasher);
    payload.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// `dispatchq:servers:<host:pid:server_id>` — TTL-bearing server record
pub fn server_info_key(hostname: &str, pid: u32, server_id: &str) -> String {
    format!("{NAMESPACE}:servers:{{{hostname}:{pid}:{server_id}}}")
}

/// `dispatchq:workers:<host:pid:server_id>` — TTL-bearing worker snapshot hash
pub fn workers_key(hostname: &str, pid: u32, server_id: &str) -> String {
    format!("{NAMESPACE}:workers:{{{hostname}:{pid}:{server_id}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_share_the_hash_tag() {
        assert_eq!(pending_key("default"), "dispatchq:{default}:pending");
        assert_eq!(active_key("critical"), "dispatchq:{critical}:active");
        assert_eq!(lease_key("default"), "dispatchq:{default}:lease");
        assert_eq!(scheduled_key("default"), "dispatchq:{default}:scheduled");
        assert_eq!(retry_key("default"), "dispatchq:{default}:retry");
        assert_eq!(archived_key("default"), "dispatchq:{default}:archived");
        assert_eq!(completed_key("default"), "dispatchq:{default}:completed");
        assert_eq!(paused_key("default"), "dispatchq:{default}:paused");
        assert_eq!(task_key("default", "abc"), "dispatchq:{default}:t:abc");
    }

    #[test]
    fn group_and_aggregation_keys() {
        assert_eq!(group_key("default", "g1"), "dispatchq:{default}:g:g1");
        assert_eq!(all_groups_key("default"), "dispatchq:{default}:groups");
        assert_eq!(
            aggregation_set_key("default", "g1", "set9"),
            "dispatchq:{default}:g:g1:set9"
        );
        assert_eq!(
            all_aggregation_sets_key("default"),
            "dispatchq:{default}:aggregation_sets"
        );
    }

    #[test]
    fn unique_fingerprint_is_stable_and_input_sensitive() {
        let a = unique_fingerprint("q", "email:deliver", b"payload");
        let b = unique_fingerprint("q", "email:deliver", b"payload");
        let c = unique_fingerprint("q", "email:deliver", b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn server_keys_embed_the_identity_triple() {
        assert_eq!(
            server_info_key("host1", 42, "sid"),
            "dispatchq:servers:{host1:42:sid}"
        );
        assert_eq!(
            workers_key("host1", 42, "sid"),
            "dispatchq:workers:{host1:42:sid}"
        );
    }
}
