use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use once_cell::sync::Lazy;

use crate::error::ProxyError;

use super::resp::Resp;

/// Number of keyspace partitions. Baked into every deployed routing table;
/// changing it invalidates hash compatibility.
pub const MAX_SLOT_NUM: usize = 1024;

/// Longest opcode accepted from a client.
pub const MAX_OP_LEN: usize = 64;

/// ASCII uppercase map for the fast opcode path.
static CHARMAP: [u8; 128] = {
    let mut map = [0u8; 128];
    let mut i = 0;
    while i < 128 {
        let c = i as u8;
        map[i] = if c >= b'a' && c <= b'z' {
            c - b'a' + b'A'
        } else {
            c
        };
        i += 1;
    }
    map
};

/// Commands the proxy refuses to forward: keyspace-wide scans,
/// pub/sub, transactions, admin verbs, and the migration verbs the proxy
/// itself issues.
static BLACKLIST: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "KEYS", "MOVE", "OBJECT", "RENAME", "RENAMENX", "SCAN", "BITOP", "MSETNX", "MIGRATE",
        "RESTORE", "BLPOP", "BRPOP", "BRPOPLPUSH", "PSUBSCRIBE", "PUBLISH", "PUNSUBSCRIBE",
        "SUBSCRIBE", "RANDOMKEY", "UNSUBSCRIBE", "DISCARD", "EXEC", "MULTI", "UNWATCH", "WATCH",
        "SCRIPT", "BGREWRITEAOF", "BGSAVE", "CLIENT", "CONFIG", "DBSIZE", "DEBUG", "FLUSHALL",
        "FLUSHDB", "LASTSAVE", "MONITOR", "SAVE", "SHUTDOWN", "SLAVEOF", "SLOWLOG", "SYNC",
        "TIME", "SLOTSINFO", "SLOTSDEL", "SLOTSMGRTSLOT", "SLOTSMGRTONE", "SLOTSMGRTTAGSLOT",
        "SLOTSMGRTTAGONE", "SLOTSCHECK",
    ]
    .into_iter()
    .collect()
});

/// Canonical spellings for the opcodes seen in practice; the fast path
/// copies out of this table instead of building the name byte by byte.
static INTERNED: Lazy<HashMap<&'static [u8], &'static str>> = Lazy::new(|| {
    [
        "GET", "SET", "SETNX", "SETEX", "PSETEX", "APPEND", "STRLEN", "DEL", "EXISTS", "SETBIT",
        "GETBIT", "SETRANGE", "GETRANGE", "SUBSTR", "INCR", "DECR", "MGET", "RPUSH", "LPUSH",
        "RPUSHX", "LPUSHX", "LINSERT", "RPOP", "LPOP", "BRPOP", "BRPOPLPUSH", "BLPOP", "LLEN",
        "LINDEX", "LSET", "LRANGE", "LTRIM", "LREM", "RPOPLPUSH", "SADD", "SREM", "SMOVE",
        "SISMEMBER", "SCARD", "SPOP", "SRANDMEMBER", "SINTER", "SINTERSTORE", "SUNION",
        "SUNIONSTORE", "SDIFF", "SDIFFSTORE", "SMEMBERS", "SSCAN", "ZADD", "ZINCRBY", "ZREM",
        "ZREMRANGEBYSCORE", "ZREMRANGEBYRANK", "ZREMRANGEBYLEX", "ZUNIONSTORE", "ZINTERSTORE",
        "ZRANGE", "ZRANGEBYSCORE", "ZREVRANGEBYSCORE", "ZRANGEBYLEX", "ZREVRANGEBYLEX", "ZCOUNT",
        "ZLEXCOUNT", "ZREVRANGE", "ZCARD", "ZSCORE", "ZRANK", "ZREVRANK", "ZSCAN", "HSET",
        "HSETNX", "HGET", "HMSET", "HMGET", "HINCRBY", "HINCRBYFLOAT", "HDEL", "HLEN", "HKEYS",
        "HVALS", "HGETALL", "HEXISTS", "HSCAN", "INCRBY", "DECRBY", "INCRBYFLOAT", "GETSET",
        "MSET", "MSETNX", "RANDOMKEY", "SELECT", "MOVE", "RENAME", "RENAMENX", "EXPIRE",
        "EXPIREAT", "PEXPIRE", "PEXPIREAT", "KEYS", "SCAN", "DBSIZE", "AUTH", "PING", "ECHO",
        "SAVE", "BGSAVE", "BGREWRITEAOF", "SHUTDOWN", "LASTSAVE", "TYPE", "MULTI", "EXEC",
        "DISCARD", "SYNC", "PSYNC", "REPLCONF", "FLUSHDB", "FLUSHALL", "SORT", "INFO", "MONITOR",
        "TTL", "PTTL", "PERSIST", "SLAVEOF", "ROLE", "DEBUG", "CONFIG", "SUBSCRIBE",
        "UNSUBSCRIBE", "PSUBSCRIBE", "PUNSUBSCRIBE", "PUBLISH", "PUBSUB", "WATCH", "UNWATCH",
        "RESTORE", "MIGRATE", "DUMP", "OBJECT", "CLIENT", "EVAL", "EVALSHA", "SLOWLOG", "SCRIPT",
        "TIME", "BITOP", "BITCOUNT", "BITPOS", "COMMAND", "PFSELFTEST", "PFADD", "PFCOUNT",
        "PFMERGE", "PFDEBUG", "LATENCY", "SLOTSINFO", "SLOTSDEL", "SLOTSMGRTSLOT", "SLOTSMGRTONE",
        "SLOTSMGRTTAGSLOT", "SLOTSMGRTTAGONE", "SLOTSHASHKEY", "SLOTSCHECK", "SLOTSRESTORE",
        "QUIT",
    ]
    .into_iter()
    .map(|op| (op.as_bytes(), op))
    .collect()
});

pub fn is_not_allowed(op: &str) -> bool {
    BLACKLIST.contains(op)
}

/// Upper-cased opcode of a decoded command.
///
/// ASCII opcodes run through the 128-entry map on the stack and come back
/// interned when known; a non-ASCII byte falls through to the slow path,
/// which still only upper-cases ASCII letters.
pub fn get_op_str(multi: &[Resp]) -> Result<String, ProxyError> {
    let op = match multi.first().and_then(Resp::as_bulk) {
        Some(op) => op,
        None => return Err(ProxyError::BadMultiBulkLen),
    };
    if op.is_empty() || op.len() > MAX_OP_LEN {
        return Err(ProxyError::BadOpStrLen);
    }

    let mut upper = [0u8; MAX_OP_LEN];
    for (i, &b) in op.iter().enumerate() {
        if b >= 0x80 {
            // slow path: leave non-ASCII bytes alone
            let mut owned = op.to_vec();
            owned.make_ascii_uppercase();
            return Ok(String::from_utf8_lossy(&owned).into_owned());
        }
        upper[i] = CHARMAP[b as usize];
    }
    let upper = &upper[..op.len()];
    if let Some(interned) = INTERNED.get(upper) {
        return Ok((*interned).to_string());
    }
    Ok(String::from_utf8_lossy(upper).into_owned())
}

/// Slot index of a key, honoring `{tag}` hash tags: when a `{` is followed
/// by a later `}` with at least one byte between them, only the bytes
/// inside the braces are hashed.
pub fn hash_slot(key: &[u8]) -> usize {
    let key = trim_hash_tag(key);
    crc32fast::hash(key) as usize % MAX_SLOT_NUM
}

fn trim_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(beg) = key.iter().position(|&b| b == b'{') {
        if let Some(offset) = key[beg + 1..].iter().position(|&b| b == b'}') {
            if offset > 0 {
                return &key[beg + 1..beg + 1 + offset];
            }
        }
    }
    key
}

/// The key a command is routed by: argument 1 for almost everything,
/// argument 3 for the store/script verbs whose first argument is a
/// destination or script.
pub fn get_hash_key(multi: &[Resp], op: &str) -> Option<Bytes> {
    let index = match op {
        "ZINTERSTORE" | "ZUNIONSTORE" | "EVAL" | "EVALSHA" => 3,
        _ => 1,
    };
    multi.get(index).and_then(Resp::as_bulk).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi(parts: &[&[u8]]) -> Vec<Resp> {
        parts.iter().map(Resp::bulk).collect()
    }

    #[test]
    fn op_str_uppercases_ascii() {
        assert_eq!(get_op_str(&multi(&[&b"get"[..], &b"x"[..]])).unwrap(), "GET");
        assert_eq!(get_op_str(&multi(&[&b"SeT"[..], &b"x"[..], &b"1"[..]])).unwrap(), "SET");
    }

    #[test]
    fn op_str_slow_path_leaves_non_ascii_bytes() {
        assert_eq!(
            get_op_str(&multi(&["gét".as_bytes(), &b"x"[..]])).unwrap(),
            "GéT"
        );
    }

    #[test]
    fn op_str_rejects_bad_lengths() {
        assert_eq!(
            get_op_str(&multi(&[&b""[..]])).unwrap_err(),
            ProxyError::BadOpStrLen
        );
        let long = [b'a'; 65];
        assert_eq!(
            get_op_str(&multi(&[&long[..]])).unwrap_err(),
            ProxyError::BadOpStrLen
        );
        assert_eq!(get_op_str(&[]).unwrap_err(), ProxyError::BadMultiBulkLen);
    }

    #[test]
    fn blacklist_blocks_admin_commands() {
        assert!(is_not_allowed("KEYS"));
        assert!(is_not_allowed("SLOTSMGRTSLOT"));
        assert!(is_not_allowed("MULTI"));
        assert!(!is_not_allowed("GET"));
        assert!(!is_not_allowed("MGET"));
    }

    #[test]
    fn hash_slot_matches_crc32_ieee() {
        assert_eq!(hash_slot(b"foo"), 2356372769 % MAX_SLOT_NUM);
        assert_eq!(hash_slot(b"bar"), 1996459178 % MAX_SLOT_NUM);
    }

    #[test]
    fn hash_tag_brackets_the_key() {
        assert_eq!(hash_slot(b"{foo}bar"), hash_slot(b"foo"));
        assert_eq!(hash_slot(b"{foo}"), hash_slot(b"foo"));
        assert_eq!(hash_slot(b"a{foo}b"), hash_slot(b"foo"));
        // empty tag is not a tag
        assert_eq!(hash_slot(b"{}foo"), crc32fast::hash(b"{}foo") as usize % MAX_SLOT_NUM);
    }

    #[test]
    fn hash_key_picks_the_routed_argument() {
        let cmd = multi(&[&b"GET"[..], &b"foo"[..]]);
        assert_eq!(get_hash_key(&cmd, "GET").unwrap(), &b"foo"[..]);

        let cmd = multi(&[&b"ZUNIONSTORE"[..], &b"dst"[..], &b"2"[..], &b"k1"[..], &b"k2"[..]]);
        assert_eq!(get_hash_key(&cmd, "ZUNIONSTORE").unwrap(), &b"k1"[..]);

        let cmd = multi(&[&b"PING"[..]]);
        assert_eq!(get_hash_key(&cmd, "PING"), None);

        let cmd = multi(&[&b"EVAL"[..], &b"script"[..], &b"1"[..]]);
        assert_eq!(get_hash_key(&cmd, "EVAL"), None);
    }
}
