pub mod codec;
pub mod listener;
pub mod origin;
pub mod respond;
pub mod server;

use std::sync::Arc;

use anyhow::Result;

use crate::pipeline::Pipeline;
use crate::settings::Settings;

/// Everything a data-plane connection needs, cloned per accepted socket.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub pipeline: Arc<Pipeline>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, pipeline: Arc<Pipeline>) -> Self {
        Self { settings, pipeline }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
