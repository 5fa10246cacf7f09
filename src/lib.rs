pub mod cli;
pub mod io_util;
pub mod logging;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;

use crate::{proxy::cache::ResponseCache, settings::Settings};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let cache = Arc::new(ResponseCache::new(settings.cache_capacity));
    let limiter = Arc::new(Semaphore::new(settings.max_connections));
    let app = proxy::AppContext::new(settings, cache, limiter);
    proxy::run(app).await
}
