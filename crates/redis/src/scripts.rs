//! Server-side scripts keeping record blobs and their index in step.
//!
//! Each script runs atomically on the server, so no reader ever sees an index
//! without the expiry covering its newest member, and no index survives its
//! last member.

use std::sync::LazyLock;

use deadpool_redis::redis::Script;

/// KEYS: record, index. ARGV: blob, ttl millis, score.
///
/// Writes the blob with its TTL, adds it to the index and extends the index
/// expiry when the new member outlives it.
pub(crate) static PUT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], KEYS[1])
local ttl = tonumber(ARGV[2])
if redis.call('PTTL', KEYS[2]) < ttl then
  redis.call('PEXPIRE', KEYS[2], ttl)
end
return 1
",
    )
});

/// KEYS: index, then the record keys to remove from it.
///
/// Returns how many record blobs still existed.
pub(crate) static DELETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local removed = 0
for i = 2, #KEYS do
  redis.call('ZREM', KEYS[1], KEYS[i])
  removed = removed + redis.call('DEL', KEYS[i])
end
if redis.call('ZCARD', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[1])
end
return removed
",
    )
});

/// KEYS: index.
///
/// Removes every member blob and the index itself. Returns how many record
/// blobs still existed.
pub(crate) static DELETE_ALL: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local removed = 0
for _, key in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
  removed = removed + redis.call('DEL', key)
end
redis.call('DEL', KEYS[1])
return removed
",
    )
});
