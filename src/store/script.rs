use redis::Value;

/// Atomic refill-then-consume step for one bucket.
///
/// `KEYS[1]` is the namespaced bucket key; `ARGV` is `capacity, rate, now, requested`.
/// `retry_after` is returned as a string because Redis truncates Lua numbers to
/// integers in replies.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local max_refill = 31536000
local ttl = math.min(math.ceil(capacity / rate), max_refill) + 60

local state = redis.call("HMGET", key, "tokens", "last_refill_at")
local tokens = tonumber(state[1])
local last_refill_at = tonumber(state[2])

if tokens == nil or last_refill_at == nil then
    tokens = capacity
    last_refill_at = now
end

local elapsed = math.max(0, now - last_refill_at)
tokens = math.min(capacity, tokens + elapsed * rate)
last_refill_at = math.max(last_refill_at, now)

local allowed = 0
local retry_after = 0

if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
else
    retry_after = math.min((requested - tokens) / rate, max_refill)
end

local reset_at = now
if tokens < capacity then
    reset_at = now + math.min((capacity - tokens) / rate, max_refill)
end

redis.call("HSET", key, "tokens", tokens, "last_refill_at", last_refill_at)
redis.call("EXPIRE", key, ttl)

return {allowed, math.floor(tokens), capacity, math.ceil(reset_at), tostring(retry_after)}
"#;

/// Seconds an idle bucket outlives the time it needs to refill completely.
pub const EXPIRY_MARGIN_SECONDS: u64 = 60;

/// Upper bound for every time offset derived from `capacity / rate`: the refill part
/// of the TTL, `retry_after` and `reset_at - now`. Must match `max_refill` in
/// [`TOKEN_BUCKET_SCRIPT`].
pub const MAX_REFILL_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Arguments for one token-bucket step. `rate` must be positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketScriptArgs {
    /// Bucket capacity in tokens.
    pub capacity: u64,
    /// Refill rate in tokens per second.
    pub rate: f64,
    /// Caller's wall-clock time in fractional epoch seconds.
    pub now: f64,
    /// Tokens to consume; `0` observes without consuming.
    pub requested: u64,
}

impl BucketScriptArgs {
    /// Idle time after which the stored state expires.
    pub fn ttl_seconds(&self) -> u64 {
        let refill = (self.capacity as f64 / self.rate).ceil();
        refill.min(MAX_REFILL_SECONDS as f64) as u64 + EXPIRY_MARGIN_SECONDS
    }
}

/// Stored state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Fractional token count, `0 <= tokens <= capacity`.
    pub tokens: f64,
    /// Epoch seconds of the last refill.
    pub last_refill_at: f64,
}

/// Reply of one step, before it is flattened into the wire array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketReply {
    /// Whether `requested` tokens were taken.
    pub allowed: bool,
    /// Whole tokens left.
    pub remaining: i64,
    /// Capacity used.
    pub limit: i64,
    /// Epoch seconds, rounded up, at which the bucket is full.
    pub reset_at: i64,
    /// Seconds until `requested` tokens are available; `0` when allowed.
    pub retry_after: f64,
}

impl BucketReply {
    /// The array [`TOKEN_BUCKET_SCRIPT`] returns for this reply.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Int(i64::from(self.allowed)),
            Value::Int(self.remaining),
            Value::Int(self.limit),
            Value::Int(self.reset_at),
            Value::BulkString(self.retry_after.to_string().into_bytes()),
        ])
    }
}

/// The token-bucket step of [`TOKEN_BUCKET_SCRIPT`], evaluated in process.
///
/// `state` is `None` for a missing or expired bucket, which starts full.
pub fn apply_step(state: Option<BucketState>, args: &BucketScriptArgs) -> (BucketState, BucketReply) {
    let capacity = args.capacity as f64;
    let requested = args.requested as f64;
    let now = args.now;
    let max_refill = MAX_REFILL_SECONDS as f64;

    let BucketState {
        mut tokens,
        mut last_refill_at,
    } = state.unwrap_or(BucketState {
        tokens: capacity,
        last_refill_at: now,
    });

    let elapsed = (now - last_refill_at).max(0f64);
    tokens = capacity.min(tokens + elapsed * args.rate);
    last_refill_at = last_refill_at.max(now);

    let mut allowed = false;
    let mut retry_after = 0f64;

    if tokens >= requested {
        tokens -= requested;
        allowed = true;
    } else {
        retry_after = ((requested - tokens) / args.rate).min(max_refill);
    }

    let reset_at = if tokens < capacity {
        now + ((capacity - tokens) / args.rate).min(max_refill)
    } else {
        now
    };

    let reply = BucketReply {
        allowed,
        remaining: tokens.floor() as i64,
        limit: args.capacity as i64,
        reset_at: reset_at.ceil() as i64,
        retry_after,
    };

    (
        BucketState {
            tokens,
            last_refill_at,
        },
        reply,
    )
}
