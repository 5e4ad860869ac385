//! Lua scripts for multi-key state transitions.
//!
//! Every transition touching more than one key runs as a script so that
//! concurrent servers only ever observe complete transitions. Scripts return
//! small status codes (or error replies) that the broker translates into
//! typed errors; they never decide policy, only move state.

/// `KEYS[1]` -> task hash
/// `KEYS[2]` -> pending list
/// `ARGV[1]` -> encoded task message
/// `ARGV[2]` -> task id
/// `ARGV[3]` -> current unix time
///
/// Returns 1 if enqueued, 0 if the task id already exists.
pub const ENQUEUE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
redis.call("HSET", KEYS[1],
           "msg", ARGV[1],
           "state", "pending",
           "pending_since", ARGV[3])
redis.call("LPUSH", KEYS[2], ARGV[2])
return 1
"#;

/// `KEYS[1]` -> unique key
/// `KEYS[2]` -> task hash
/// `KEYS[3]` -> pending list
/// `ARGV[1]` -> task id
/// `ARGV[2]` -> uniqueness lock TTL in seconds
/// `ARGV[3]` -> encoded task message
/// `ARGV[4]` -> current unix time
///
/// Returns 1 if enqueued, 0 on task id conflict, -1 if the unique key is
/// already held.
pub const ENQUEUE_UNIQUE: &str = r#"
local ok = redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2])
if not ok then
  return -1
end
if redis.call("EXISTS", KEYS[2]) == 1 then
  return 0
end
redis.call("HSET", KEYS[2],
           "msg", ARGV[3],
           "state", "pending",
           "pending_since", ARGV[4],
           "unique_key", KEYS[1])
redis.call("LPUSH", KEYS[3], ARGV[1])
return 1
"#;

/// `KEYS[1]` -> task hash
/// `KEYS[2]` -> scheduled zset
/// `ARGV[1]` -> encoded task message
/// `ARGV[2]` -> process-at unix time
/// `ARGV[3]` -> task id
/// `ARGV[4]` -> group name, empty for none (routes the task back to its
///              group on promotion)
///
/// Returns 1 if scheduled, 0 if the task id already exists.
pub const SCHEDULE: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
redis.call("HSET", KEYS[1],
           "msg", ARGV[1],
           "state", "scheduled")
if ARGV[4] ~= '' then
    redis.call("HSET", KEYS[1], "group", ARGV[4])
end
redis.call("ZADD", KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

/// `KEYS[1]` -> unique key
/// `KEYS[2]` -> task hash
/// `KEYS[3]` -> scheduled zset
/// `ARGV[1]` -> task id
/// `ARGV[2]` -> uniqueness lock TTL in seconds
/// `ARGV[3]` -> encoded task message
/// `ARGV[4]` -> process-at unix time
/// `ARGV[5]` -> group name, empty for none
///
/// Returns 1 if scheduled, 0 on task id conflict, -1 if the unique key is
/// already held.
pub const SCHEDULE_UNIQUE: &str = r#"
local ok = redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2])
if not ok then
  return -1
end
if redis.call("EXISTS", KEYS[2]) == 1 then
  return 0
end
redis.call("HSET", KEYS[2],
           "msg", ARGV[3],
           "state", "scheduled",
           "unique_key", KEYS[1])
if ARGV[5] ~= '' then
    redis.call("HSET", KEYS[2], "group", ARGV[5])
end
redis.call("ZADD", KEYS[3], ARGV[4], ARGV[1])
return 1
"#;

/// `KEYS[1]` -> task hash
/// `KEYS[2]` -> group zset
/// `KEYS[3]` -> all-groups set
/// `ARGV[1]` -> encoded task message
/// `ARGV[2]` -> task id
/// `ARGV[3]` -> current unix time
/// `ARGV[4]` -> group name
///
/// Returns 1 if added, 0 if the task id already exists.
pub const ADD_TO_GROUP: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
redis.call("HSET", KEYS[1],
           "msg", ARGV[1],
           "state", "aggregating",
           "group", ARGV[4])
redis.call("ZADD", KEYS[2], ARGV[3], ARGV[2])
redis.call("SADD", KEYS[3], ARGV[4])
return 1
"#;

/// `KEYS[1]` -> unique key
/// `KEYS[2]` -> task hash
/// `KEYS[3]` -> group zset
/// `KEYS[4]` -> all-groups set
/// `ARGV[1]` -> task id
/// `ARGV[2]` -> uniqueness lock TTL in seconds
/// `ARGV[3]` -> encoded task message
/// `ARGV[4]` -> current unix time
/// `ARGV[5]` -> group name
///
/// Returns 1 if added, 0 on task id conflict, -1 if the unique key is
/// already held.
pub const ADD_TO_GROUP_UNIQUE: &str = r#"
local ok = redis.call("SET", KEYS[1], ARGV[1], "NX", "EX", ARGV[2])
if not ok then
  return -1
end
if redis.call("EXISTS", KEYS[2]) == 1 then
  return 0
end
redis.call("HSET", KEYS[2],
           "msg", ARGV[3],
           "state", "aggregating",
           "group", ARGV[5],
           "unique_key", KEYS[1])
redis.call("ZADD", KEYS[3], ARGV[4], ARGV[1])
redis.call("SADD", KEYS[4], ARGV[5])
return 1
"#;

/// `KEYS[1]` -> pending list
/// `KEYS[2]` -> paused flag
/// `KEYS[3]` -> active list
/// `KEYS[4]` -> lease zset
/// `ARGV[1]` -> lease expiry unix time
/// `ARGV[2]` -> task key prefix
///
/// Pops the head of pending into active and records the lease. Returns the
/// encoded task message, or nil when the queue is paused or empty.
pub const DEQUEUE: &str = r#"
if redis.call("EXISTS", KEYS[2]) == 0 then
    local id = redis.call("RPOPLPUSH", KEYS[1], KEYS[3])
    if id then
        local key = ARGV[2] .. id
        redis.call("HSET", key, "state", "active")
        redis.call("HDEL", key, "pending_since")
        redis.call("ZADD", KEYS[4], ARGV[1], id)
        return redis.call("HGET", key, "msg")
    end
end
return nil
"#;

/// `KEYS[1]` -> active list
/// `KEYS[2]` -> lease zset
/// `KEYS[3]` -> task hash
/// `ARGV[1]` -> task id
///
/// Removes a finished task entirely. The NOT FOUND reply means the lease was
/// lost before settling.
pub const DONE: &str = r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("DEL", KEYS[3]) == 0 then
  return redis.error_reply("NOT FOUND")
end
return redis.status_reply("OK")
"#;

/// As [`DONE`], and releases the unique key when it still belongs to this
/// task.
///
/// `KEYS[4]` -> unique key
pub const DONE_UNIQUE: &str = r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("DEL", KEYS[3]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("GET", KEYS[4]) == ARGV[1] then
  redis.call("DEL", KEYS[4])
end
return redis.status_reply("OK")
"#;

/// `KEYS[1]` -> active list
/// `KEYS[2]` -> lease zset
/// `KEYS[3]` -> completed zset
/// `KEYS[4]` -> task hash
/// `ARGV[1]` -> task id
/// `ARGV[2]` -> retention expiry unix time (completed_at + retention)
/// `ARGV[3]` -> updated encoded task message
///
/// Retains a finished task until its retention expires.
pub const MARK_COMPLETE: &str = r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("ZADD", KEYS[3], ARGV[2], ARGV[1]) ~= 1 then
  return redis.error_reply("INTERNAL")
end
redis.call("HSET", KEYS[4], "msg", ARGV[3], "state", "completed")
return redis.status_reply("OK")
"#;

/// As [`MARK_COMPLETE`], and releases the unique key when it still belongs
/// to this task.
///
/// `KEYS[5]` -> unique key
pub const MARK_COMPLETE_UNIQUE: &str = r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("ZADD", KEYS[3], ARGV[2], ARGV[1]) ~= 1 then
  return redis.error_reply("INTERNAL")
end
redis.call("HSET", KEYS[4], "msg", ARGV[3], "state", "completed")
if redis.call("GET", KEYS[5]) == ARGV[1] then
  redis.call("DEL", KEYS[5])
end
return redis.status_reply("OK")
"#;

/// `KEYS[1]` -> task hash
/// `KEYS[2]` -> active list
/// `KEYS[3]` -> lease zset
/// `KEYS[4]` -> retry zset
/// `ARGV[1]` -> task id
/// `ARGV[2]` -> updated encoded task message
/// `ARGV[3]` -> retry-at unix time
///
/// Moves a failed task into the retry bucket. The NOT FOUND reply means the
/// lease was lost before settling.
pub const RETRY: &str = r#"
if redis.call("LREM", KEYS[2], 0, ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("ZREM", KEYS[3], ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
redis.call("ZADD", KEYS[4], ARGV[3], ARGV[1])
redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "retry")
return redis.status_reply("OK")
"#;

/// `KEYS[1]` -> task hash
/// `KEYS[2]` -> active list
/// `KEYS[3]` -> lease zset
/// `KEYS[4]` -> archived zset
/// `ARGV[1]` -> task id
/// `ARGV[2]` -> updated encoded task message
/// `ARGV[3]` -> archive unix time
/// `ARGV[4]` -> age cutoff unix time (entries older are evicted)
/// `ARGV[5]` -> archive capacity
/// `ARGV[6]` -> task key prefix
///
/// Archives a task from active, then trims the archive: first entries past
/// the age cutoff, then everything beyond capacity, oldest first. Evicted
/// entries have their task hashes deleted.
pub const ARCHIVE: &str = r#"
if redis.call("LREM", KEYS[2], 0, ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("ZREM", KEYS[3], ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
redis.call("ZADD", KEYS[4], ARGV[3], ARGV[1])
local old = redis.call("ZRANGE", KEYS[4], "-inf", ARGV[4], "BYSCORE")
if #old > 0 then
    for _, id in ipairs(old) do
        redis.call("DEL", ARGV[6] .. id)
    end
    redis.call("ZREM", KEYS[4], unpack(old))
end
local extra = redis.call("ZRANGE", KEYS[4], 0, -ARGV[5])
if #extra > 0 then
    for _, id in ipairs(extra) do
        redis.call("DEL", ARGV[6] .. id)
    end
    redis.call("ZREM", KEYS[4], unpack(extra))
end
redis.call("HSET", KEYS[1], "msg", ARGV[2], "state", "archived")
return redis.status_reply("OK")
"#;

/// `KEYS[1]` -> source zset (scheduled or retry)
/// `KEYS[2]` -> pending list
/// `ARGV[1]` -> current unix time
/// `ARGV[2]` -> task key prefix
/// `ARGV[3]` -> group key prefix
///
/// Promotes due entries. Entries carrying a group go back to their group
/// zset for aggregation; everything else joins pending. Moves at most 100
/// per call to keep script runtime short. Returns the number moved.
pub const FORWARD: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, 100)
for _, id in ipairs(ids) do
    local taskKey = ARGV[2] .. id
    local group = redis.call("HGET", taskKey, "group")
    if group and group ~= '' then
        redis.call("ZADD", ARGV[3] .. group, ARGV[1], id)
        redis.call("ZREM", KEYS[1], id)
        redis.call("HSET", taskKey,
                   "state", "aggregating")
    else
        redis.call("LPUSH", KEYS[2], id)
        redis.call("ZREM", KEYS[1], id)
        redis.call("HSET", taskKey,
                   "state", "pending",
                   "pending_since", ARGV[1])
    end
end
return table.getn(ids)
"#;

/// `KEYS[1]` -> lease zset
/// `ARGV[1]` -> new lease expiry unix time
/// `ARGV[2..]` -> task ids
///
/// Extends leases still present in the zset; `XX GT` keeps a score written
/// by a newer owner from moving backwards.
pub const EXTEND_LEASE: &str = r#"
for i = 2, #ARGV do
    redis.call("ZADD", KEYS[1], "XX", "GT", ARGV[1], ARGV[i])
end
return redis.status_reply("OK")
"#;

/// `KEYS[1]` -> lease zset
/// `ARGV[1]` -> cutoff unix time
/// `ARGV[2]` -> task key prefix
///
/// Returns the encoded messages of tasks whose lease expired at or before
/// the cutoff.
pub const LIST_LEASE_EXPIRED: &str = r#"
local res = {}
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
for _, id in ipairs(ids) do
    local key = ARGV[2] .. id
    local v = redis.call("HGET", key, "msg")
    if v then
        table.insert(res, v)
    end
end
return res
"#;

/// `KEYS[1]` -> active list
/// `KEYS[2]` -> lease zset
/// `KEYS[3]` -> pending list
/// `KEYS[4]` -> task hash
/// `ARGV[1]` -> task id
///
/// Puts an abandoned active task back at the head of pending so recovery
/// does not add queueing latency on top of the lost lease.
pub const REQUEUE: &str = r#"
if redis.call("LREM", KEYS[1], 0, ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
if redis.call("ZREM", KEYS[2], ARGV[1]) == 0 then
  return redis.error_reply("NOT FOUND")
end
redis.call("RPUSH", KEYS[3], ARGV[1])
redis.call("HSET", KEYS[4], "state", "pending")
return redis.status_reply("OK")
"#;

/// Checks one group against the aggregation policy and, when a criterion is
/// met, snapshots the batch into an aggregation set:
/// 1) the group reached max size,
/// 2) the oldest member exceeded the max delay,
/// 3) the newest member exceeded the grace period.
///
/// The group name is cleared from the all-groups set when the snapshot
/// empties the group.
///
/// `KEYS[1]` -> group zset
/// `KEYS[2]` -> aggregation set to create
/// `KEYS[3]` -> all-aggregation-sets zset
/// `KEYS[4]` -> all-groups set
/// `ARGV[1]` -> max size (0 = disabled)
/// `ARGV[2]` -> max delay in seconds (0 = disabled)
/// `ARGV[3]` -> grace period in seconds
/// `ARGV[4]` -> aggregation set expiry unix time
/// `ARGV[5]` -> current unix time
/// `ARGV[6]` -> group name
///
/// Returns 1 if an aggregation set was created, 0 otherwise.
pub const AGGREGATION_CHECK: &str = r#"
local size = redis.call("ZCARD", KEYS[1])
if size == 0 then
    return 0
end
local maxSize = tonumber(ARGV[1])
if maxSize ~= 0 and size >= maxSize then
    local res = redis.call("ZRANGE", KEYS[1], 0, maxSize-1, "WITHSCORES")
    for i=1, table.getn(res)-1, 2 do
        redis.call("ZADD", KEYS[2], tonumber(res[i+1]), res[i])
    end
    redis.call("ZREMRANGEBYRANK", KEYS[1], 0, maxSize-1)
    redis.call("ZADD", KEYS[3], ARGV[4], KEYS[2])
    if size == maxSize then
        redis.call("SREM", KEYS[4], ARGV[6])
    end
    return 1
end
local maxDelay = tonumber(ARGV[2])
local currentTime = tonumber(ARGV[5])
if maxDelay ~= 0 then
    local oldestEntry = redis.call("ZRANGE", KEYS[1], 0, 0, "WITHSCORES")
    local oldestEntryScore = tonumber(oldestEntry[2])
    local maxDelayTime = currentTime - maxDelay
    if oldestEntryScore <= maxDelayTime then
        local res = redis.call("ZRANGE", KEYS[1], 0, maxSize-1, "WITHSCORES")
        for i=1, table.getn(res)-1, 2 do
            redis.call("ZADD", KEYS[2], tonumber(res[i+1]), res[i])
        end
        redis.call("ZREMRANGEBYRANK", KEYS[1], 0, maxSize-1)
        redis.call("ZADD", KEYS[3], ARGV[4], KEYS[2])
        if size <= maxSize or maxSize == 0 then
            redis.call("SREM", KEYS[4], ARGV[6])
        end
        return 1
    end
end
local latestEntry = redis.call("ZREVRANGE", KEYS[1], 0, 0, "WITHSCORES")
local latestEntryScore = tonumber(latestEntry[2])
local gracePeriodStartTime = currentTime - tonumber(ARGV[3])
if latestEntryScore <= gracePeriodStartTime then
    local res = redis.call("ZRANGE", KEYS[1], 0, maxSize-1, "WITHSCORES")
    for i=1, table.getn(res)-1, 2 do
        redis.call("ZADD", KEYS[2], tonumber(res[i+1]), res[i])
    end
    redis.call("ZREMRANGEBYRANK", KEYS[1], 0, maxSize-1)
    redis.call("ZADD", KEYS[3], ARGV[4], KEYS[2])
    if size <= maxSize or maxSize == 0 then
        redis.call("SREM", KEYS[4], ARGV[6])
    end
    return 1
end
return 0
"#;

/// `KEYS[1]` -> aggregation set
/// `ARGV[1]` -> task key prefix
///
/// Returns the encoded messages of every member, oldest first.
pub const READ_AGGREGATION_SET: &str = r#"
local msgs = {}
local ids = redis.call("ZRANGE", KEYS[1], 0, -1)
for _, id in ipairs(ids) do
    local key = ARGV[1] .. id
    table.insert(msgs, redis.call("HGET", key, "msg"))
end
return msgs
"#;

/// `KEYS[1]` -> aggregation set
/// `KEYS[2]` -> all-aggregation-sets zset
/// `ARGV[1]` -> task key prefix
///
/// Deletes an aggregation set and its members' task hashes, once the
/// combined task has been enqueued.
pub const DELETE_AGGREGATION_SET: &str = r#"
local ids = redis.call("ZRANGE", KEYS[1], 0, -1)
for _, id in ipairs(ids)  do
    redis.call("DEL", ARGV[1] .. id)
end
redis.call("DEL", KEYS[1])
redis.call("ZREM", KEYS[2], KEYS[1])
return redis.status_reply("OK")
"#;

/// `KEYS[1]` -> all-aggregation-sets zset
/// `ARGV[1]` -> current unix time
///
/// Moves members of expired aggregation sets (the aggregating server died
/// mid-flight) back into their group zsets with their original scores.
pub const RECLAIM_STALE_AGGREGATION_SETS: &str = r#"
local staleSetKeys = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
for _, key in ipairs(staleSetKeys) do
    local idx = string.find(key, ":[^:]*$")
    local groupKey = string.sub(key, 1, idx-1)
    local res = redis.call("ZRANGE", key, 0, -1, "WITHSCORES")
    for i=1, table.getn(res)-1, 2 do
        redis.call("ZADD", groupKey, tonumber(res[i+1]), res[i])
    end
    redis.call("DEL", key)
end
redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
return redis.status_reply("OK")
"#;

/// `KEYS[1]` -> completed zset
/// `ARGV[1]` -> current unix time
/// `ARGV[2]` -> task key prefix
/// `ARGV[3]` -> batch size
///
/// Deletes completed tasks whose retention expired. Returns the number
/// deleted.
pub const DELETE_EXPIRED_COMPLETED: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[3]))
for _, id in ipairs(ids) do
    redis.call("DEL", ARGV[2] .. id)
    redis.call("ZREM", KEYS[1], id)
end
return table.getn(ids)
"#;

/// `KEYS[1]` -> server info key
/// `KEYS[2]` -> workers key
/// `KEYS[3]` -> all-servers roster zset
/// `KEYS[4]` -> all-workers roster zset
/// `ARGV[1]` -> TTL in seconds
/// `ARGV[2]` -> record expiry unix time (roster score)
/// `ARGV[3]` -> encoded server info
/// `ARGV[4..]` -> alternating task id, encoded worker snapshot
pub const WRITE_SERVER_STATE: &str = r#"
redis.call("SETEX", KEYS[1], ARGV[1], ARGV[3])
redis.call("ZADD", KEYS[3], ARGV[2], KEYS[1])
redis.call("DEL", KEYS[2])
for i = 4, table.getn(ARGV)-1, 2 do
    redis.call("HSET", KEYS[2], ARGV[i], ARGV[i+1])
end
redis.call("EXPIRE", KEYS[2], ARGV[1])
redis.call("ZADD", KEYS[4], ARGV[2], KEYS[2])
return redis.status_reply("OK")
"#;

/// `KEYS[1]` -> server info key
/// `KEYS[2]` -> workers key
/// `KEYS[3]` -> all-servers roster zset
/// `KEYS[4]` -> all-workers roster zset
pub const CLEAR_SERVER_STATE: &str = r#"
redis.call("DEL", KEYS[1])
redis.call("DEL", KEYS[2])
redis.call("ZREM", KEYS[3], KEYS[1])
redis.call("ZREM", KEYS[4], KEYS[2])
return redis.status_reply("OK")
"#;

/// `KEYS[1]` -> task hash
/// `ARGV[1]` -> result bytes
///
/// Writes handler-produced result bytes, but never resurrects a task hash
/// that was deleted while the handler ran. Returns 1 if written.
pub const WRITE_RESULT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    redis.call("HSET", KEYS[1], "result", ARGV[1])
    return 1
end
return 0
"#;

/// `KEYS[1]` -> pending list
/// `KEYS[2]` -> active list
/// `KEYS[3]` -> scheduled zset
/// `KEYS[4]` -> retry zset
/// `KEYS[5]` -> archived zset
/// `KEYS[6]` -> completed zset
/// `KEYS[7]` -> lease zset
/// `KEYS[8]` -> paused flag
/// `ARGV[1]` -> task key prefix
/// `ARGV[2]` -> force flag ("1" removes a non-empty queue)
///
/// Removes every key of a queue. Returns 1 on success, -1 if the queue is
/// not empty (without force), -2 if tasks are still active.
pub const REMOVE_QUEUE: &str = r#"
if redis.call("LLEN", KEYS[2]) > 0 then
    return -2
end
if ARGV[2] ~= "1" then
    local total = redis.call("LLEN", KEYS[1])
        + redis.call("ZCARD", KEYS[3])
        + redis.call("ZCARD", KEYS[4])
        + redis.call("ZCARD", KEYS[5])
        + redis.call("ZCARD", KEYS[6])
    if total > 0 then
        return -1
    end
end
for _, id in ipairs(redis.call("LRANGE", KEYS[1], 0, -1)) do
    redis.call("DEL", ARGV[1] .. id)
end
for i = 3, 6 do
    for _, id in ipairs(redis.call("ZRANGE", KEYS[i], 0, -1)) do
        redis.call("DEL", ARGV[1] .. id)
    end
end
for i = 1, 8 do
    redis.call("DEL", KEYS[i])
end
return 1
"#;

/// `KEYS[1]` -> task hash
/// `ARGV[1]` -> task id
/// `ARGV[2]` -> current unix time
/// `ARGV[3]` -> queue key prefix
///
/// Returns {msg, state, next_process_at, result}; next_process_at is 0 when
/// not applicable. Error reply NOT FOUND when the task does not exist.
pub const GET_TASK_INFO: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    return redis.error_reply("NOT FOUND")
end
local msg, state, result = unpack(redis.call("HMGET", KEYS[1], "msg", "state", "result"))
if state == "scheduled" or state == "retry" then
    return {msg, state, redis.call("ZSCORE", ARGV[3] .. state, ARGV[1]), result}
end
if state == "pending" then
    return {msg, state, ARGV[2], result}
end
return {msg, state, 0, result}
"#;
