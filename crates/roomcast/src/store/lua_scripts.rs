//! Lua scripts for atomic session store operations.

/// Read and delete a session together with its missed-packet list.
///
/// Arguments:
/// - KEYS[1]: Session key (e.g., `roomcast:session:{pid}`)
/// - KEYS[2]: Missed-packet list key (e.g., `roomcast:missed:{pid}`)
///
/// Returns `{session_json | nil, {packet_json...}}`.
pub const TAKE_SESSION: &str = r#"
local session = redis.call('GET', KEYS[1])
local missed = redis.call('LRANGE', KEYS[2], 0, -1)
redis.call('DEL', KEYS[1], KEYS[2])
return {session, missed}
"#;

/// Append a packet to a live session's missed list, aligning its expiry
/// with the session key.
///
/// Arguments:
/// - KEYS[1]: Session key
/// - KEYS[2]: Missed-packet list key
/// - ARGV[1]: Packet JSON
///
/// Returns:
/// - 1: Appended
/// - 0: Session unknown or expired
pub const APPEND_MISSED: &str = r#"
local ttl = redis.call('PTTL', KEYS[1])
if ttl <= 0 then
    return 0
end
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('PEXPIRE', KEYS[2], ttl)
return 1
"#;
