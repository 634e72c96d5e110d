use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Semaphore;

use agproxy_pool::{
    AutoVerify, CredentialPool, PoolSettings, QuotaCache, SignatureCache, Storage, VerifySettings,
};

use crate::config::{GatewayConfig, RoutingTable};
use crate::limit::MinIntervalLimiter;
use crate::stats::UsageStats;

/// Process-wide shared state. The config and routing table are swappable
/// snapshots; everything else is long-lived shared services.
pub struct AppState {
    pub config: ArcSwap<GatewayConfig>,
    pub routing: ArcSwap<RoutingTable>,
    pub pool: CredentialPool,
    pub storage: Arc<dyn Storage>,
    pub signatures: SignatureCache,
    pub quotas: QuotaCache,
    pub verify: AutoVerify,
    pub stats: UsageStats,
    /// Caps concurrent Antigravity calls; permits are released on stream
    /// termination, not on header arrival.
    pub antigravity_permits: Arc<Semaphore>,
    pub antigravity_interval: MinIntervalLimiter,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        routing: RoutingTable,
        storage: Arc<dyn Storage>,
    ) -> Arc<Self> {
        let pool = CredentialPool::new(
            storage.clone(),
            PoolSettings {
                auto_ban_enabled: config.auto_ban,
                auto_ban_codes: config.auto_ban_error_codes.clone(),
                ..PoolSettings::default()
            },
        );
        let verify = AutoVerify::new(VerifySettings {
            enabled: config.auto_verify_enabled,
            ..VerifySettings::default()
        });
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let interval = MinIntervalLimiter::new(config.min_request_interval);
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            routing: ArcSwap::from_pointee(routing),
            pool,
            storage,
            signatures: SignatureCache::default(),
            quotas: QuotaCache::default(),
            verify,
            stats: UsageStats::new(),
            antigravity_permits: permits,
            antigravity_interval: interval,
        })
    }

    pub fn config_snapshot(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    pub fn routing_snapshot(&self) -> Arc<RoutingTable> {
        self.routing.load_full()
    }

    /// Reload from fresh env/persisted maps; subsequent requests see the
    /// new snapshot, in-flight requests keep the old one.
    pub fn swap_config(&self, env: &HashMap<String, String>, persisted: &HashMap<String, serde_json::Value>) {
        let config = GatewayConfig::load(env, persisted);
        self.config.store(Arc::new(config));
    }
}
