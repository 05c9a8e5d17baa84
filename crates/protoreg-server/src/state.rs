use std::sync::Arc;
use std::time::Duration;

use protoreg_config::Config;
use protoreg_service::RegistryService;

use crate::db::Db;
use crate::ratelimit::RateLimiter;

/// Shared process state, cloned cheaply into every request handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RegistryService>,
    pub db: Arc<Db>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let db = Db::open(&config.db_path)?;
        let rate_limiter = RateLimiter::new(
            Duration::from_millis(config.rate_limit.window_ms),
            config.rate_limit.max,
        );
        let config = Arc::new(config);
        let service = RegistryService::new((*config).clone());
        Ok(Self {
            service: Arc::new(service),
            db: Arc::new(db),
            rate_limiter: Arc::new(rate_limiter),
            config,
        })
    }
}
