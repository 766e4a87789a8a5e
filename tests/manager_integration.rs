//! End-to-end behaviour of the rate limit manager over shared storage.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use tollgate::clock::{Clock, ManualClock};
use tollgate::config::{FailurePolicy, TollgateConfig};
use tollgate::error::{Result, TollgateError};
use tollgate::ratelimit::{
    resolve_pattern, Algorithm, KeyBy, LimitConfig, MemoryStorage, RateLimitManager, Storage,
    UNLIMITED,
};
use tollgate::request::{Principal, RequestInfo};

/// Records every storage call before delegating to memory storage.
struct SpyStorage {
    inner: MemoryStorage,
    calls: Mutex<Vec<String>>,
}

impl SpyStorage {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryStorage::new(clock),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, op: &str, key: &str) {
        self.calls.lock().push(format!("{} {}", op, key));
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Storage for SpyStorage {
    fn increment(&self, key: &str, amount: i64, ttl_secs: u64) -> Result<i64> {
        self.record("increment", key);
        self.inner.increment(key, amount, ttl_secs)
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.record("get", key);
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<bool> {
        self.record("set", key);
        self.inner.set(key, value, ttl_secs)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
        ttl_secs: u64,
    ) -> Result<bool> {
        self.record("cas", key);
        self.inner.compare_and_swap(key, expected, new, ttl_secs)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        self.record("delete", key);
        self.inner.delete(key)
    }
}

/// A backend that is always down.
struct UnreachableStorage;

impl Storage for UnreachableStorage {
    fn increment(&self, _key: &str, _amount: i64, _ttl_secs: u64) -> Result<i64> {
        Err(TollgateError::Storage("connection refused".to_string()))
    }

    fn get(&self, _key: &str) -> Result<Option<Value>> {
        Err(TollgateError::Storage("connection refused".to_string()))
    }

    fn set(&self, _key: &str, _value: Value, _ttl_secs: u64) -> Result<bool> {
        Err(TollgateError::Storage("connection refused".to_string()))
    }

    fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&Value>,
        _new: Value,
        _ttl_secs: u64,
    ) -> Result<bool> {
        Err(TollgateError::Storage("connection refused".to_string()))
    }

    fn delete(&self, _key: &str) -> Result<bool> {
        Err(TollgateError::Storage("connection refused".to_string()))
    }
}

fn setup() -> (Arc<ManualClock>, Arc<SpyStorage>, RateLimitManager) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let storage = Arc::new(SpyStorage::new(clock.clone()));
    let manager = RateLimitManager::new(storage.clone(), clock.clone());
    (clock, storage, manager)
}

fn request() -> RequestInfo {
    RequestInfo::new("GET", "/api/x", "203.0.113.9")
}

fn request_as(principal: Value) -> RequestInfo {
    request().with_principal(Principal::from_json(principal).unwrap())
}

const ALGORITHMS: [Algorithm; 3] = [Algorithm::Fixed, Algorithm::Sliding, Algorithm::TokenBucket];

#[test]
fn test_check_is_idempotent() {
    for algorithm in ALGORITHMS {
        let (_, _, manager) = setup();
        let limits = [LimitConfig::per_minute(10).with_algorithm(algorithm)];
        manager.attempt(&request(), &limits, 1);
        manager.attempt(&request(), &limits, 1);

        let first = manager.check(&request(), &limits);
        for _ in 0..5 {
            assert_eq!(manager.check(&request(), &limits).remaining(), first.remaining());
        }
        assert_eq!(first.remaining(), 8, "{}", algorithm);
    }
}

#[test]
fn test_monotonic_consumption() {
    for algorithm in [Algorithm::Fixed, Algorithm::Sliding] {
        let (_, _, manager) = setup();
        let limits = [LimitConfig::per_minute(10).with_algorithm(algorithm)];

        for k in 1..=10 {
            let result = manager.attempt(&request(), &limits, 1);
            assert!(result.is_allowed());
            assert_eq!(result.remaining(), 10 - k, "{}", algorithm);
        }
    }
}

#[test]
fn test_denial_boundary() {
    for algorithm in ALGORITHMS {
        let (_, _, manager) = setup();
        let limits = [LimitConfig::per_minute(3).with_algorithm(algorithm)];

        for _ in 0..3 {
            assert!(manager.attempt(&request(), &limits, 1).is_allowed());
        }
        let result = manager.attempt(&request(), &limits, 1);
        assert!(!result.is_allowed(), "{}", algorithm);
        assert_eq!(result.remaining(), 0);
        assert!(result.retry_after().unwrap() > 0);
    }
}

#[test]
fn test_window_rollover() {
    for algorithm in ALGORITHMS {
        let (clock, _, manager) = setup();
        let limits = [LimitConfig::per_minute(2).with_algorithm(algorithm)];

        manager.attempt(&request(), &limits, 1);
        manager.attempt(&request(), &limits, 1);
        assert!(!manager.attempt(&request(), &limits, 1).is_allowed());

        clock.advance(60);
        assert!(
            manager.attempt(&request(), &limits, 1).is_allowed(),
            "{}",
            algorithm
        );
    }
}

#[test]
fn test_most_restrictive_reduction() {
    let (_, _, manager) = setup();
    let principal = json!({"id": 1, "tier": "pro"});
    let limits = [
        LimitConfig::per_minute(100),
        LimitConfig::per_minute(5).for_tier("pro"),
    ];

    for _ in 0..5 {
        assert!(manager.attempt(&request_as(principal.clone()), &limits, 1).is_allowed());
    }

    let result = manager.attempt(&request_as(principal), &limits, 1);
    assert!(!result.is_allowed());
    assert_eq!(result.limit(), 5);
    assert_eq!(result.policy(), Some("5;w=60"));
}

#[test]
fn test_same_window_limits_keep_separate_state() {
    for algorithm in ALGORITHMS {
        let (_, _, manager) = setup();
        let limits = [
            LimitConfig::per_minute(100).with_algorithm(algorithm),
            LimitConfig::per_minute(5).with_algorithm(algorithm),
        ];

        let remaining: Vec<_> = (0..5)
            .map(|_| manager.attempt(&request(), &limits, 1))
            .map(|result| (result.is_allowed(), result.limit(), result.remaining()))
            .collect();
        assert_eq!(
            remaining,
            vec![(true, 5, 4), (true, 5, 3), (true, 5, 2), (true, 5, 1), (true, 5, 0)],
            "{}",
            algorithm
        );

        let denied = manager.attempt(&request(), &limits, 1);
        assert!(!denied.is_allowed(), "{}", algorithm);
        assert_eq!(denied.limit(), 5);

        manager.reset(&request(), &limits).unwrap();
        assert_eq!(manager.check(&request(), &limits).remaining(), 5, "{}", algorithm);
    }
}

#[test]
fn test_admin_role_is_not_downgraded_by_order() {
    let (_, storage, manager) = setup();
    let principal = json!({"id": 9, "roles": ["business", "admin"]});

    assert_eq!(manager.resolve_tier(&request_as(principal.clone())), "enterprise");
    assert!(manager.attempt(&request_as(principal), &[], 1).is_unlimited());
    assert_eq!(storage.call_count(), 0);
}

#[test]
fn test_unlimited_short_circuit_never_touches_storage() {
    let (_, storage, manager) = setup();
    let principal = json!({"id": 1, "plan": "Unlimited"});
    let limits = [LimitConfig::per_minute(1), LimitConfig::per_hour(1)];

    for _ in 0..10 {
        let result = manager.attempt(&request_as(principal.clone()), &limits, 1);
        assert!(result.is_allowed());
        assert_eq!(result.limit(), UNLIMITED);
        assert_eq!(result.tier(), Some("enterprise"));
    }
    assert!(manager.check(&request_as(principal), &limits).is_allowed());
    assert_eq!(storage.call_count(), 0);
}

#[test]
fn test_unlimited_result_has_no_headers() {
    let (_, _, manager) = setup();
    let result = manager.attempt(&request_as(json!({"roles": ["admin"]})), &[], 1);
    assert!(manager.headers(&result).is_empty());
}

#[test]
fn test_custom_key_pattern() {
    let request = RequestInfo::new("GET", "/api/x", "10.1.1.1");
    assert_eq!(
        resolve_pattern("{tier}:{method}:{path}", &request, "pro"),
        "pro:GET:/api/x"
    );
}

#[test]
fn test_custom_key_shares_counter_across_ips() {
    let (_, storage, manager) = setup();
    let limits = [LimitConfig::per_minute(2).with_key("{method}:{path}")];
    let first = RequestInfo::new("POST", "/login", "10.0.0.1");
    let second = RequestInfo::new("POST", "/login", "10.0.0.2");

    manager.attempt(&first, &limits, 1);
    manager.attempt(&second, &limits, 1);
    assert!(!manager.attempt(&first, &limits, 1).is_allowed());
    assert!(storage
        .calls
        .lock()
        .iter()
        .all(|call| call.contains("rate_limit:POST:/login:anonymous:60")));
}

#[test]
fn test_token_bucket_burst_absorption() {
    let (clock, _, manager) = setup();
    let limits = [LimitConfig::per_seconds(10, 10).with_algorithm(Algorithm::TokenBucket)];

    for _ in 0..10 {
        assert!(manager.attempt(&request(), &limits, 1).is_allowed());
    }
    assert!(!manager.attempt(&request(), &limits, 1).is_allowed());

    clock.advance(5);
    for _ in 0..5 {
        assert!(manager.attempt(&request(), &limits, 1).is_allowed());
    }
    assert!(!manager.attempt(&request(), &limits, 1).is_allowed());
}

#[test]
fn test_tier_resolution_precedence() {
    let (_, _, manager) = setup();
    assert_eq!(manager.resolve_tier(&request_as(json!({"roles": ["pro"]}))), "pro");
    assert_eq!(manager.resolve_tier(&request_as(json!({"tier": "PRO"}))), "pro");
    assert_eq!(manager.resolve_tier(&request()), "anonymous");
    assert_eq!(manager.resolve_tier(&request_as(json!({"id": 3}))), "free");
}

#[test]
fn test_multi_window_policy() {
    let (clock, _, manager) = setup();
    let limits = [
        LimitConfig::per_minute(3).with_algorithm(Algorithm::Fixed),
        LimitConfig::per_hour(5).with_algorithm(Algorithm::Fixed),
    ];

    for _ in 0..3 {
        assert!(manager.attempt(&request(), &limits, 1).is_allowed());
    }
    let result = manager.attempt(&request(), &limits, 1);
    assert!(!result.is_allowed());
    assert_eq!(result.limit(), 3);

    clock.advance(60);
    assert!(manager.attempt(&request(), &limits, 1).is_allowed());
    assert!(manager.attempt(&request(), &limits, 1).is_allowed());

    let result = manager.attempt(&request(), &limits, 1);
    assert!(!result.is_allowed());
    assert_eq!(result.limit(), 5);
}

#[test]
fn test_user_keyed_limit_follows_user_across_ips() {
    let (_, _, manager) = setup();
    let limits = [LimitConfig::per_minute(1).by(KeyBy::User)];
    let home = RequestInfo::new("GET", "/", "10.0.0.1")
        .with_principal(Principal::from_json(json!({"id": "carol"})).unwrap());
    let office = RequestInfo::new("GET", "/", "10.0.0.2")
        .with_principal(Principal::from_json(json!({"id": "carol"})).unwrap());

    assert!(manager.attempt(&home, &limits, 1).is_allowed());
    assert!(!manager.attempt(&office, &limits, 1).is_allowed());
}

#[test]
fn test_storage_failure_opens_by_default() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = RateLimitManager::new(Arc::new(UnreachableStorage), clock);

    let result = manager.attempt(&request(), &[LimitConfig::per_minute(5)], 1);
    assert!(result.is_allowed());
    assert_eq!(result.limit(), 5);
}

#[test]
fn test_storage_failure_can_close() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = RateLimitManager::new(Arc::new(UnreachableStorage), clock)
        .with_failure_policy(FailurePolicy::Closed);

    let result = manager.attempt(&request(), &[LimitConfig::per_minute(5)], 1);
    assert!(!result.is_allowed());
    assert_eq!(result.retry_after(), Some(60));
    assert!(manager.reset(&request(), &[LimitConfig::per_minute(5)]).is_err());
}

#[test]
fn test_manager_from_yaml_config() {
    let yaml = r#"
baseline_tier: free
key_prefix: shop
tiers:
  free:
    limits:
      - attempts: 2
        per_minutes: 1
        algorithm: fixed
  vip:
    unlimited: true
"#;
    let config = TollgateConfig::from_yaml(yaml).unwrap();
    let clock = Arc::new(ManualClock::new(600));
    let storage = Arc::new(SpyStorage::new(clock.clone()));
    let manager = RateLimitManager::from_config(&config, storage.clone(), clock).unwrap();

    // `anonymous` is not defined here, so it gets the baseline limits.
    let first = manager.attempt(&request(), &[], 1);
    assert_eq!(first.limit(), 2);
    manager.attempt(&request(), &[], 1);
    let denied = manager.attempt(&request(), &[], 1);
    assert!(!denied.is_allowed());

    let response = manager.exceeded_response(&denied);
    assert_eq!(response.status, 429);
    assert_eq!(response.header("X-RateLimit-Limit"), Some("2"));
    assert_eq!(response.header("X-RateLimit-Reset"), Some("660"));
    assert_eq!(response.header("Retry-After"), Some("60"));
    assert!(storage
        .calls
        .lock()
        .iter()
        .all(|call| call.starts_with("increment shop:")));

    let vip = manager.attempt(&request_as(json!({"tier": "VIP"})), &[], 1);
    assert!(vip.is_unlimited());
}

#[test]
fn test_reset_restores_quota() {
    let (_, _, manager) = setup();
    let limits = [LimitConfig::per_minute(1)];

    manager.attempt(&request(), &limits, 1);
    assert!(!manager.attempt(&request(), &limits, 1).is_allowed());

    manager.reset(&request(), &limits).unwrap();
    assert_eq!(manager.check(&request(), &limits).remaining(), 1);
}

fn allowed_under_contention(manager: RateLimitManager, limit: LimitConfig) -> usize {
    let manager = Arc::new(manager);
    let limits = Arc::new([limit]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let limits = limits.clone();
            std::thread::spawn(move || {
                (0..20)
                    .filter(|_| manager.attempt(&request(), &limits[..], 1).is_allowed())
                    .count()
            })
        })
        .collect();

    handles.into_iter().map(|h| h.join().unwrap()).sum()
}

#[test]
fn test_concurrent_fixed_window_is_exact() {
    let (_, _, manager) = setup();
    let limit = LimitConfig::per_minute(50).with_algorithm(Algorithm::Fixed);
    assert_eq!(allowed_under_contention(manager, limit), 50);
}

#[test]
fn test_concurrent_swaps_never_overshoot() {
    // Closed so that an exhausted swap loop denies instead of allowing.
    for algorithm in [Algorithm::Sliding, Algorithm::TokenBucket] {
        let (_, _, manager) = setup();
        let manager = manager.with_failure_policy(FailurePolicy::Closed);
        let limit = LimitConfig::per_minute(50).with_algorithm(algorithm);
        assert!(allowed_under_contention(manager, limit) <= 50, "{}", algorithm);
    }
}
