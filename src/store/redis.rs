use super::{
    admitted_key, bucket_key, config_key, device_key, entry_key, lease_key, queue_key,
    BucketState, JoinOutcome, JoinRequest, Options, Store, StoreError, StoreResult, EVENTS_KEY,
    REVOKED_KEY,
};
use crate::{
    entries::{EntryState, QueueEntry, QueueId},
    events::{EventConfig, ENTRY_TTL_SLACK_MS},
    metrics::Metrics,
};
use async_trait::async_trait;
use eyre::{Result as EyreResult, WrapErr};
use redis::{aio::ConnectionManager, AsyncCommands, Script, Value};
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tracing::info;

// Multi-key writes run as scripts so a queue entry can never be split from
// its index. Scripts take time from the store (`TIME`), not the replica, so
// clock skew between server processes cannot reorder arrivals. The numeric
// constants mirror `entries::PRIORITY_STRIDE` and `entries::SCORE_EPOCH_MS`.

const JOIN_SCRIPT: &str = r"
redis.replicate_commands()
local existing = redis.call('GET', KEYS[2])
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
if existing then
  local ekey = 'entry:' .. existing
  local state = redis.call('HGET', ekey, 'state')
  if state == 'waiting' then
    if redis.call('HGET', ekey, 'priority') ~= ARGV[5] then
      return {'conflict'}
    end
    return {'existing', existing, redis.call('ZRANK', KEYS[1], existing) or 0}
  end
  if state == 'admitted' then
    local exp = tonumber(redis.call('HGET', ekey, 'expires_at_ms') or '0')
    if exp > now then
      return {'admitted'}
    end
  end
end
local score = tonumber(ARGV[5]) * 1099511627776 + (now - 1735689600000)
redis.call('ZADD', KEYS[1], score, ARGV[1])
local ekey = 'entry:' .. ARGV[1]
redis.call('HSET', ekey,
  'queue_id', ARGV[1], 'event_id', ARGV[2], 'device_id', ARGV[3],
  'priority', ARGV[5], 'joined_at_ms', now, 'last_heartbeat_ms', now,
  'state', 'waiting')
if ARGV[4] ~= '' then
  redis.call('HSET', ekey, 'user_id', ARGV[4])
end
redis.call('PEXPIRE', ekey, ARGV[6])
redis.call('SET', KEYS[2], ARGV[1], 'PX', ARGV[6])
return {'joined', ARGV[1], redis.call('ZRANK', KEYS[1], ARGV[1]) or 0}
";

// Pops granted heads in queue order. A head without a grant means the front
// changed since the caller peeked; the batch stops there and the remaining
// budget is refunded by the caller.
const ADMIT_SCRIPT: &str = r"
redis.replicate_commands()
if redis.call('GET', KEYS[3]) ~= ARGV[1] then
  return redis.error_reply('lease-lost')
end
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
local ttl = tonumber(ARGV[2])
local keep = ttl + tonumber(ARGV[3])
local grants = {}
for i = 5, #ARGV, 2 do
  grants[ARGV[i]] = ARGV[i + 1]
end
local out = {}
local ids = {}
while true do
  local head = redis.call('ZRANGE', KEYS[1], 0, 0)
  if #head == 0 then break end
  local qid = head[1]
  local token = grants[qid]
  if not token then break end
  grants[qid] = nil
  redis.call('ZREM', KEYS[1], qid)
  local ekey = 'entry:' .. qid
  local expires = now + ttl
  redis.call('HSET', ekey, 'state', 'admitted', 'admitted_at_ms', now,
    'expires_at_ms', expires, 'token', token)
  redis.call('PEXPIRE', ekey, keep)
  redis.call('ZADD', KEYS[2], expires, qid)
  local device = redis.call('HGET', ekey, 'device_id')
  if device then
    redis.call('SET', 'event:' .. ARGV[4] .. ':device:' .. device, qid, 'PX', keep)
  end
  table.insert(ids, qid)
  table.insert(out, redis.call('HGETALL', ekey))
end
if #ids > 0 then
  redis.call('PUBLISH', 'event:' .. ARGV[4] .. ':admissions', table.concat(ids, ','))
end
return out
";

const ADMIT_ONE_SCRIPT: &str = r"
redis.replicate_commands()
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return false
end
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
local ttl = tonumber(ARGV[3])
local keep = ttl + tonumber(ARGV[4])
local ekey = 'entry:' .. ARGV[1]
local expires = now + ttl
redis.call('HSET', ekey, 'state', 'admitted', 'admitted_at_ms', now,
  'expires_at_ms', expires, 'token', ARGV[2])
redis.call('PEXPIRE', ekey, keep)
redis.call('ZADD', KEYS[2], expires, ARGV[1])
local device = redis.call('HGET', ekey, 'device_id')
if device then
  redis.call('SET', 'event:' .. ARGV[5] .. ':device:' .. device, ARGV[1], 'PX', keep)
end
redis.call('PUBLISH', 'event:' .. ARGV[5] .. ':admissions', ARGV[1])
return redis.call('HGETALL', ekey)
";

const TOUCH_SCRIPT: &str = r"
redis.replicate_commands()
local last = redis.call('HGET', KEYS[1], 'last_heartbeat_ms')
if not last then
  return 0
end
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
if now - tonumber(last) < tonumber(ARGV[1]) then
  return 0
end
redis.call('HSET', KEYS[1], 'last_heartbeat_ms', now)
return 1
";

const EVICT_SCRIPT: &str = r"
redis.replicate_commands()
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
local cutoff = now - tonumber(ARGV[2])
local front = redis.call('ZRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)
local removed = 0
for _, qid in ipairs(front) do
  local ekey = 'entry:' .. qid
  local hb = redis.call('HGET', ekey, 'last_heartbeat_ms')
  if not hb then
    redis.call('ZREM', KEYS[1], qid)
    removed = removed + 1
  elseif tonumber(hb) < cutoff then
    redis.call('ZREM', KEYS[1], qid)
    redis.call('HSET', ekey, 'state', 'expired')
    local device = redis.call('HGET', ekey, 'device_id')
    if device then
      local dkey = 'event:' .. ARGV[3] .. ':device:' .. device
      if redis.call('GET', dkey) == qid then
        redis.call('DEL', dkey)
      end
    end
    removed = removed + 1
  end
end
return removed
";

const SWEEP_SCRIPT: &str = r"
redis.replicate_commands()
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
for _, qid in ipairs(due) do
  redis.call('ZREM', KEYS[1], qid)
  local ekey = 'entry:' .. qid
  if redis.call('EXISTS', ekey) == 1 then
    redis.call('HSET', ekey, 'state', 'expired')
    local device = redis.call('HGET', ekey, 'device_id')
    if device then
      local dkey = 'event:' .. ARGV[1] .. ':device:' .. device
      if redis.call('GET', dkey) == qid then
        redis.call('DEL', dkey)
      end
    end
  end
end
return #due
";

const DRAIN_SCRIPT: &str = r"
local batch = redis.call('ZRANGE', KEYS[1], 0, tonumber(ARGV[1]) - 1)
for _, qid in ipairs(batch) do
  redis.call('ZREM', KEYS[1], qid)
  local ekey = 'entry:' .. qid
  if redis.call('EXISTS', ekey) == 1 then
    redis.call('HSET', ekey, 'state', 'expired')
    local device = redis.call('HGET', ekey, 'device_id')
    if device then
      local dkey = 'event:' .. ARGV[2] .. ':device:' .. device
      if redis.call('GET', dkey) == qid then
        redis.call('DEL', dkey)
      end
    end
  end
end
return #batch
";

const RETIRE_SCRIPT: &str = r"
redis.replicate_commands()
local ekey = 'entry:' .. ARGV[1]
local state = redis.call('HGET', ekey, 'state')
if not state then
  return false
end
if state ~= 'waiting' and state ~= 'admitted' then
  return state
end
local event = redis.call('HGET', ekey, 'event_id')
local device = redis.call('HGET', ekey, 'device_id')
if state == 'waiting' then
  redis.call('ZREM', 'event:' .. event .. ':queue', ARGV[1])
else
  redis.call('ZREM', 'event:' .. event .. ':admitted', ARGV[1])
  local t = redis.call('TIME')
  local now = t[1] * 1000 + math.floor(t[2] / 1000)
  local exp = tonumber(redis.call('HGET', ekey, 'expires_at_ms') or '0')
  if exp > now then
    redis.call('ZADD', 'token:revoked', exp, ARGV[1])
  end
end
redis.call('HSET', ekey, 'state', 'revoked')
if device then
  local dkey = 'event:' .. event .. ':device:' .. device
  if redis.call('GET', dkey) == ARGV[1] then
    redis.call('DEL', dkey)
  end
end
return state
";

const RELEASE_LEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

struct Scripts {
    join: Script,
    admit: Script,
    admit_one: Script,
    touch: Script,
    evict: Script,
    sweep: Script,
    drain: Script,
    retire: Script,
    release_lease: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            join: Script::new(JOIN_SCRIPT),
            admit: Script::new(ADMIT_SCRIPT),
            admit_one: Script::new(ADMIT_ONE_SCRIPT),
            touch: Script::new(TOUCH_SCRIPT),
            evict: Script::new(EVICT_SCRIPT),
            sweep: Script::new(SWEEP_SCRIPT),
            drain: Script::new(DRAIN_SCRIPT),
            retire: Script::new(RETIRE_SCRIPT),
            release_lease: Script::new(RELEASE_LEASE_SCRIPT),
        }
    }
}

pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    metrics: Arc<Metrics>,
    scripts: Scripts,
}

impl RedisStore {
    pub async fn new(options: &Options, metrics: Arc<Metrics>) -> EyreResult<Self> {
        info!(addr = %options.store_addr, "Connecting to store");
        let client = redis::Client::open(options.store_addr.as_str())
            .wrap_err("invalid store connection string")?;
        let mut conn = ConnectionManager::new(client)
            .await
            .wrap_err("error connecting to store")?;
        let () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .wrap_err("store did not answer ping")?;
        info!(addr = %options.store_addr, "Connected to store");

        Ok(Self {
            conn,
            op_timeout: Duration::from_millis(options.op_timeout_ms),
            metrics,
            scripts: Scripts::new(),
        })
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let timer = self
            .metrics
            .store_operation_duration_seconds
            .with_label_values(&[operation])
            .start_timer();
        let result = tokio::time::timeout(self.op_timeout, fut).await;
        drop(timer);
        match result {
            Err(_) => Err(StoreError::Timeout),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(from_redis_error(&error)),
        }
    }
}

fn from_redis_error(error: &redis::RedisError) -> StoreError {
    if error.code() == Some("lease-lost") {
        return StoreError::LeaseLost;
    }
    if error.is_timeout() {
        return StoreError::Timeout;
    }
    if error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_cluster_error()
        || matches!(error.kind(), redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain)
    {
        return StoreError::Transient(error.to_string());
    }
    if matches!(error.kind(), redis::ErrorKind::TypeError) {
        return StoreError::Decode(error.to_string());
    }
    StoreError::Backend(error.to_string())
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::Status(text) => Some(text.clone()),
        _ => None,
    }
}

fn parse_join_reply(value: &Value) -> StoreResult<JoinOutcome> {
    let decode = || StoreError::Decode(format!("unexpected join reply: {value:?}"));
    let Value::Bulk(items) = value else {
        return Err(decode());
    };
    let tag = items.first().and_then(value_string).ok_or_else(decode)?;
    let rank_and_id = || -> StoreResult<(QueueId, u64)> {
        let queue_id = items.get(1).and_then(value_string).ok_or_else(decode)?;
        let rank = match items.get(2) {
            Some(Value::Int(rank)) => u64::try_from(*rank).unwrap_or(0),
            _ => return Err(decode()),
        };
        Ok((QueueId(queue_id), rank))
    };
    match tag.as_str() {
        "joined" => {
            let (queue_id, rank) = rank_and_id()?;
            Ok(JoinOutcome::Joined { queue_id, rank })
        }
        "existing" => {
            let (queue_id, rank) = rank_and_id()?;
            Ok(JoinOutcome::Existing { queue_id, rank })
        }
        "admitted" => Ok(JoinOutcome::AlreadyAdmitted),
        "conflict" => Ok(JoinOutcome::PriorityConflict),
        _ => Err(decode()),
    }
}

fn parse_entry(fields: &HashMap<String, String>) -> StoreResult<QueueEntry> {
    QueueEntry::from_fields(fields)
        .ok_or_else(|| StoreError::Decode(format!("incomplete entry record: {fields:?}")))
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.timed("ping", async move {
            redis::cmd("PING").query_async(&mut conn).await
        })
        .await
    }

    async fn put_event(&self, config: &EventConfig) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = config_key(&config.event_id);
        let fields = config.to_fields();
        let event_id = config.event_id.clone();
        self.timed("put_event", async move {
            redis::pipe()
                .atomic()
                .hdel(&key, "capacity")
                .ignore()
                .hset_multiple(&key, &fields)
                .ignore()
                .sadd(EVENTS_KEY, &event_id)
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn event(&self, event_id: &str) -> StoreResult<Option<EventConfig>> {
        let mut conn = self.conn.clone();
        let key = config_key(event_id);
        let fields: HashMap<String, String> = self
            .timed("event", async move { conn.hgetall(&key).await })
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        EventConfig::from_fields(event_id, &fields)
            .map(Some)
            .ok_or_else(|| StoreError::Decode(format!("incomplete event config: {fields:?}")))
    }

    async fn event_ids(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = self
            .timed("event_ids", async move { conn.smembers(EVENTS_KEY).await })
            .await?;
        ids.sort();
        Ok(ids)
    }

    async fn join(&self, request: &JoinRequest) -> StoreResult<JoinOutcome> {
        let mut conn = self.conn.clone();
        let script = &self.scripts.join;
        let mut invocation = script.prepare_invoke();
        invocation
            .key(queue_key(&request.event_id))
            .key(device_key(&request.event_id, &request.device_id))
            .arg(&request.queue_id.0)
            .arg(&request.event_id)
            .arg(&request.device_id)
            .arg(request.user_id.as_deref().unwrap_or(""))
            .arg(request.priority)
            .arg(request.entry_ttl_ms);
        let reply: Value = self
            .timed("join", async move { invocation.invoke_async(&mut conn).await })
            .await?;
        parse_join_reply(&reply)
    }

    async fn entry(&self, queue_id: &QueueId) -> StoreResult<Option<QueueEntry>> {
        let mut conn = self.conn.clone();
        let key = entry_key(queue_id);
        let fields: HashMap<String, String> = self
            .timed("entry", async move { conn.hgetall(&key).await })
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_entry(&fields).map(Some)
    }

    async fn touch(&self, queue_id: &QueueId, min_interval_ms: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let script = &self.scripts.touch;
        let mut invocation = script.prepare_invoke();
        invocation.key(entry_key(queue_id)).arg(min_interval_ms);
        let updated: i64 = self
            .timed("touch", async move { invocation.invoke_async(&mut conn).await })
            .await?;
        Ok(updated == 1)
    }

    async fn rank(&self, event_id: &str, queue_id: &QueueId) -> StoreResult<Option<u64>> {
        let mut conn = self.conn.clone();
        let key = queue_key(event_id);
        let member = queue_id.0.clone();
        let rank: Option<i64> = self
            .timed("rank", async move { conn.zrank(&key, &member).await })
            .await?;
        Ok(rank.and_then(|r| u64::try_from(r).ok()))
    }

    async fn queue_len(&self, event_id: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let key = queue_key(event_id);
        self.timed("queue_len", async move { conn.zcard(&key).await })
            .await
    }

    async fn admitted_count(&self, event_id: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let key = admitted_key(event_id);
        self.timed("admitted_count", async move { conn.zcard(&key).await })
            .await
    }

    async fn peek_waiting(&self, event_id: &str, limit: u64) -> StoreResult<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let key = queue_key(event_id);
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = self
            .timed("peek_waiting", async move { conn.zrange(&key, 0, stop).await })
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(entry_key(&QueueId(id.clone())));
        }
        let maps: Vec<HashMap<String, String>> = self
            .timed("peek_waiting", async move { pipe.query_async(&mut conn).await })
            .await?;

        let mut entries = Vec::with_capacity(maps.len());
        for fields in &maps {
            // Entry records can lapse between the index read and the hash
            // read; the index catches up on the next eviction pass.
            if fields.is_empty() {
                continue;
            }
            entries.push(parse_entry(fields)?);
        }
        Ok(entries)
    }

    async fn evict_stale(
        &self,
        event_id: &str,
        heartbeat_timeout_ms: u64,
        limit: u64,
    ) -> StoreResult<u64> {
        if limit == 0 {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let script = &self.scripts.evict;
        let mut invocation = script.prepare_invoke();
        invocation
            .key(queue_key(event_id))
            .arg(limit)
            .arg(heartbeat_timeout_ms)
            .arg(event_id);
        let removed: i64 = self
            .timed("evict_stale", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(u64::try_from(removed).unwrap_or(0))
    }

    async fn retire(&self, queue_id: &QueueId) -> StoreResult<Option<EntryState>> {
        let mut conn = self.conn.clone();
        let script = &self.scripts.retire;
        let mut invocation = script.prepare_invoke();
        invocation.arg(&queue_id.0);
        let reply: Option<String> = self
            .timed("retire", async move { invocation.invoke_async(&mut conn).await })
            .await?;
        match reply {
            None => Ok(None),
            Some(state) => state
                .parse()
                .map(Some)
                .map_err(|_| StoreError::Decode(format!("unknown entry state: {state}"))),
        }
    }

    async fn admit_front(
        &self,
        event_id: &str,
        lease_nonce: &str,
        token_ttl_ms: u64,
        grants: &[(QueueId, String)],
    ) -> StoreResult<Vec<QueueEntry>> {
        if grants.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let script = &self.scripts.admit;
        let mut invocation = script.prepare_invoke();
        invocation
            .key(queue_key(event_id))
            .key(admitted_key(event_id))
            .key(lease_key(event_id))
            .arg(lease_nonce)
            .arg(token_ttl_ms)
            .arg(ENTRY_TTL_SLACK_MS)
            .arg(event_id);
        for (queue_id, token) in grants {
            invocation.arg(&queue_id.0).arg(token);
        }
        let maps: Vec<HashMap<String, String>> = self
            .timed("admit_front", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        maps.iter().map(parse_entry).collect()
    }

    async fn admit_one(
        &self,
        event_id: &str,
        queue_id: &QueueId,
        token: &str,
        token_ttl_ms: u64,
    ) -> StoreResult<Option<QueueEntry>> {
        let mut conn = self.conn.clone();
        let script = &self.scripts.admit_one;
        let mut invocation = script.prepare_invoke();
        invocation
            .key(queue_key(event_id))
            .key(admitted_key(event_id))
            .arg(&queue_id.0)
            .arg(token)
            .arg(token_ttl_ms)
            .arg(ENTRY_TTL_SLACK_MS)
            .arg(event_id);
        let fields: Option<HashMap<String, String>> = self
            .timed("admit_one", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        match fields {
            None => Ok(None),
            Some(fields) => parse_entry(&fields).map(Some),
        }
    }

    async fn sweep_expired(&self, event_id: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let script = &self.scripts.sweep;
        let mut invocation = script.prepare_invoke();
        invocation.key(admitted_key(event_id)).arg(event_id);
        let swept: i64 = self
            .timed("sweep_expired", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(u64::try_from(swept).unwrap_or(0))
    }

    async fn drain_waiting(&self, event_id: &str, limit: u64) -> StoreResult<u64> {
        if limit == 0 {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let script = &self.scripts.drain;
        let mut invocation = script.prepare_invoke();
        invocation.key(queue_key(event_id)).arg(limit).arg(event_id);
        let drained: i64 = self
            .timed("drain_waiting", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(u64::try_from(drained).unwrap_or(0))
    }

    async fn acquire_lease(&self, event_id: &str, nonce: &str, ttl_ms: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let key = lease_key(event_id);
        let nonce = nonce.to_owned();
        let reply: Option<String> = self
            .timed("acquire_lease", async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&nonce)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lease(&self, event_id: &str, nonce: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let script = &self.scripts.release_lease;
        let mut invocation = script.prepare_invoke();
        invocation.key(lease_key(event_id)).arg(nonce);
        let released: i64 = self
            .timed("release_lease", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(released == 1)
    }

    async fn revoke(&self, queue_id: &QueueId, until_ms: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let member = queue_id.0.clone();
        self.timed("revoke", async move {
            conn.zadd(REVOKED_KEY, &member, until_ms).await
        })
        .await
    }

    async fn is_revoked(&self, queue_id: &QueueId, now_ms: u64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let member = queue_id.0.clone();
        let until: Option<f64> = self
            .timed("is_revoked", async move {
                conn.zscore(REVOKED_KEY, &member).await
            })
            .await?;
        Ok(until.is_some_and(|until| now_ms < until as u64))
    }

    async fn sweep_revoked(&self, now_ms: u64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        self.timed("sweep_revoked", async move {
            conn.zrembyscore(REVOKED_KEY, "-inf", now_ms).await
        })
        .await
    }

    async fn bucket(&self, event_id: &str) -> StoreResult<Option<BucketState>> {
        let mut conn = self.conn.clone();
        let key = bucket_key(event_id);
        let fields: HashMap<String, String> = self
            .timed("bucket", async move { conn.hgetall(&key).await })
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let parsed = || -> Option<BucketState> {
            Some(BucketState {
                tokens: fields.get("tokens")?.parse().ok()?,
                updated_at_ms: fields.get("updated_at_ms")?.parse().ok()?,
            })
        };
        parsed()
            .map(Some)
            .ok_or_else(|| StoreError::Decode(format!("incomplete bucket state: {fields:?}")))
    }

    async fn save_bucket(&self, event_id: &str, state: &BucketState) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let key = bucket_key(event_id);
        let fields = [
            ("tokens", state.tokens.to_string()),
            ("updated_at_ms", state.updated_at_ms.to_string()),
        ];
        self.timed("save_bucket", async move {
            redis::pipe()
                .atomic()
                .hset_multiple(&key, &fields)
                .ignore()
                .pexpire(&key, i64::try_from(super::BUCKET_STATE_TTL_MS).unwrap_or(i64::MAX))
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }
}
