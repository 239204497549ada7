use std::path::PathBuf;
use std::sync::Arc;

use crate::{
    admission::RateLimiter, config::ConfigStore, jobs::JobManager, pairing::PairingManager,
    tokens::TokenStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub tokens: Arc<TokenStore>,
    pub pairing: Arc<PairingManager>,
    pub jobs: JobManager,
    pub global_limiter: Arc<RateLimiter>,
    pub pairing_limiter: Arc<RateLimiter>,
    pub config_dir: PathBuf,
}
