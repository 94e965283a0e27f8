//! Feed configuration loaded from defaults and environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::cache::{CacheConfig, EvictionPolicy};
use crate::profile::HydrationConfig;
use crate::source::{BackoffConfig, RelayConfig};
use crate::timeline::TimelineConfig;
use crate::verify::VerifierConfig;
use crate::{Error, Result};

/// Every tunable of the timeline engine.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub timeline: TimelineConfig,
    pub backoff: BackoffConfig,
    pub verifier: VerifierConfig,
    pub hydration: HydrationConfig,
    /// Profile cache sizing; persisted when a backing store is supplied.
    pub profile_cache: CacheConfig,
    pub relay: RelayConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            timeline: TimelineConfig::default(),
            backoff: BackoffConfig::default(),
            verifier: VerifierConfig::default(),
            hydration: HydrationConfig::default(),
            profile_cache: CacheConfig {
                name: "profiles".to_string(),
                max_entries: 2000,
                policy: EvictionPolicy::Lru,
                default_ttl: Duration::from_secs(3600),
                access_flush_delay: Duration::from_secs(20),
            },
            relay: RelayConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - None (all have defaults)
    ///
    /// Optional:
    /// - `TESSERA_RELAYS`: Comma-separated relay URLs
    /// - `TESSERA_KINDS`: Comma-separated event kinds (default: "1,6,30023")
    /// - `TESSERA_MAX_EVENTS`: Timeline cap (default: 300)
    /// - `TESSERA_MAX_BUFFER`: Pending buffer cap (default: 400)
    /// - `TESSERA_PAGE_SIZE`: Events per historical page (default: 50)
    /// - `TESSERA_HYDRATION_INFLIGHT`: Concurrent profile fetches (default: 2)
    /// - `TESSERA_PROFILE_CACHE_ENTRIES`: Profile cache size (default: 2000)
    /// - `TESSERA_PROFILE_CACHE_TTL_SECS`: Profile cache TTL (default: 3600)
    /// - `TESSERA_ACCESS_FLUSH_SECS`: Access-time flush delay (default: 20)
    /// - `TESSERA_QUERY_TIMEOUT_SECS`: Historical query timeout (default: 10)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(relays) = list_var::<String>("TESSERA_RELAYS")? {
            config.relay.relays = relays;
        }
        if let Some(kinds) = list_var::<u16>("TESSERA_KINDS")? {
            config.timeline.kinds = kinds;
        }
        if let Some(n) = parse_var("TESSERA_MAX_EVENTS")? {
            config.timeline.max_events = n;
        }
        if let Some(n) = parse_var("TESSERA_MAX_BUFFER")? {
            config.timeline.max_buffer = n;
        }
        if let Some(n) = parse_var("TESSERA_PAGE_SIZE")? {
            config.timeline.page_size = n;
        }
        if let Some(n) = parse_var("TESSERA_HYDRATION_INFLIGHT")? {
            config.hydration.max_inflight = n;
        }
        if let Some(n) = parse_var("TESSERA_PROFILE_CACHE_ENTRIES")? {
            config.profile_cache.max_entries = n;
        }
        if let Some(secs) = parse_var("TESSERA_PROFILE_CACHE_TTL_SECS")? {
            config.profile_cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var("TESSERA_ACCESS_FLUSH_SECS")? {
            config.profile_cache.access_flush_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var("TESSERA_QUERY_TIMEOUT_SECS")? {
            config.relay.query_timeout = Duration::from_secs(secs);
        }

        config.validate()?;

        tracing::info!(
            relays = config.relay.relays.len(),
            kinds = ?config.timeline.kinds,
            max_events = config.timeline.max_events,
            max_buffer = config.timeline.max_buffer,
            page_size = config.timeline.page_size,
            "feed configuration loaded"
        );

        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let timeline = &self.timeline;
        if timeline.max_events == 0 || timeline.max_buffer == 0 || timeline.page_size == 0 {
            return Err(Error::Config(
                "max_events, max_buffer and page_size must be positive".to_string(),
            ));
        }
        if timeline.kinds.is_empty() {
            return Err(Error::Config(
                "at least one event kind is required".to_string(),
            ));
        }
        if self.hydration.max_inflight == 0 {
            return Err(Error::Config(
                "hydration max_inflight must be positive".to_string(),
            ));
        }
        if self.hydration.min_spacing > self.hydration.max_spacing {
            return Err(Error::Config(
                "hydration spacing range is inverted".to_string(),
            ));
        }
        if self.profile_cache.max_entries == 0 {
            return Err(Error::Config(
                "profile cache needs at least one entry".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
        _ => Ok(None),
    }
}

fn list_var<T: FromStr>(key: &str) -> Result<Option<Vec<T>>>
where
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    let items = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|e| Error::Config(format!("{key} entry {s:?}: {e}")))
        })
        .collect::<Result<Vec<T>>>()?;
    Ok((!items.is_empty()).then_some(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize config tests that manipulate env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "TESSERA_RELAYS",
        "TESSERA_KINDS",
        "TESSERA_MAX_EVENTS",
        "TESSERA_MAX_BUFFER",
        "TESSERA_PAGE_SIZE",
        "TESSERA_HYDRATION_INFLIGHT",
        "TESSERA_PROFILE_CACHE_ENTRIES",
        "TESSERA_PROFILE_CACHE_TTL_SECS",
        "TESSERA_ACCESS_FLUSH_SECS",
        "TESSERA_QUERY_TIMEOUT_SECS",
    ];

    /// Run `f` with only the given TESSERA_* vars set.
    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_MUTEX.lock().unwrap();

        let saved: Vec<_> = ENV_KEYS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        // SAFETY: Serialized by mutex; only test code touches these vars.
        unsafe {
            for k in ENV_KEYS {
                std::env::remove_var(k);
            }
            for (k, v) in vars {
                std::env::set_var(k, v);
            }
        }

        f();

        // SAFETY: Restoring original env state.
        unsafe {
            for (k, v) in &saved {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn config_defaults() {
        with_env_vars(&[], || {
            let config = FeedConfig::from_env().unwrap();
            assert_eq!(config.timeline.max_events, 300);
            assert_eq!(config.timeline.max_buffer, 400);
            assert_eq!(config.timeline.page_size, 50);
            assert_eq!(config.timeline.kinds, vec![1, 6, 30023]);
            assert_eq!(config.backoff.base, Duration::from_millis(600));
            assert_eq!(config.verifier.max_per_tick, 12);
            assert_eq!(config.hydration.max_inflight, 2);
            assert_eq!(config.profile_cache.max_entries, 2000);
            assert_eq!(config.profile_cache.policy, EvictionPolicy::Lru);
            assert_eq!(
                config.profile_cache.access_flush_delay,
                Duration::from_secs(20)
            );
        });
    }

    #[test]
    fn config_overrides() {
        with_env_vars(
            &[
                ("TESSERA_RELAYS", "wss://a.example, wss://b.example,"),
                ("TESSERA_KINDS", "1,30023"),
                ("TESSERA_MAX_EVENTS", "100"),
                ("TESSERA_PROFILE_CACHE_TTL_SECS", "60"),
            ],
            || {
                let config = FeedConfig::from_env().unwrap();
                assert_eq!(
                    config.relay.relays,
                    vec!["wss://a.example".to_string(), "wss://b.example".to_string()]
                );
                assert_eq!(config.timeline.kinds, vec![1, 30023]);
                assert_eq!(config.timeline.max_events, 100);
                assert_eq!(config.profile_cache.default_ttl, Duration::from_secs(60));
            },
        );
    }

    #[test]
    fn config_rejects_garbage() {
        with_env_vars(&[("TESSERA_MAX_BUFFER", "lots")], || {
            let err = FeedConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("TESSERA_MAX_BUFFER"));
        });
        with_env_vars(&[("TESSERA_KINDS", "1,x")], || {
            assert!(FeedConfig::from_env().is_err());
        });
        with_env_vars(&[("TESSERA_PAGE_SIZE", "0")], || {
            assert!(matches!(FeedConfig::from_env(), Err(Error::Config(_))));
        });
    }
}
