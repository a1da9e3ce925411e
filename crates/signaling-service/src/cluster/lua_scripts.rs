//! Lua scripts for atomic Redis operations.

/// Fixed-window counter increment.
///
/// Arguments:
/// - KEYS[1]: Counter key (`ratelimit:{class}:{identity}:{window_index}`)
/// - ARGV[1]: Window size in seconds, used as the key TTL
///
/// Returns the post-increment count. The TTL is set only by the first
/// increment of a window so later requests never extend it.
pub const FIXED_WINDOW_INCREMENT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
end
return count
";

/// Refresh the TTL of a session and its connection index together.
///
/// Arguments:
/// - KEYS[1]: Session key (`session:{id}`)
/// - KEYS[2]: Connection index key (`session:conn:{connection_id}`)
/// - ARGV[1]: TTL in seconds
///
/// Returns:
/// - 1: Session existed and was refreshed
/// - 0: Session absent (expired or deleted)
pub const TOUCH_SESSION: &str = r"
if redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1])) == 0 then
    return 0
end
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[1]))
return 1
";
