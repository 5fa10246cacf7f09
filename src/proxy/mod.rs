pub mod cache;
pub mod codec;
pub mod connect;
pub mod forward;
pub mod handler;
pub mod listener;
pub mod request;
mod resolver;
pub mod respond;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;

use crate::settings::Settings;
use self::cache::ResponseCache;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Arc<ResponseCache>,
    /// Connection admission semaphore. A permit is acquired before `accept`
    /// and released when the handler task ends.
    pub limiter: Arc<Semaphore>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        cache: Arc<ResponseCache>,
        limiter: Arc<Semaphore>,
    ) -> Self {
        Self {
            settings,
            cache,
            limiter,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
