use std::sync::Arc;

use lib_reservoir::core::{Aggregator, TopicRouter, WireCodec};

/// Shared pieces handed to every task of the server.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<TopicRouter>,
    pub aggregator: Arc<Aggregator>,
    pub codec: WireCodec,
}

impl AppState {
    pub fn new(router: TopicRouter, codec: WireCodec) -> Self {
        Self {
            router: Arc::new(router),
            aggregator: Arc::new(Aggregator::new()),
            codec,
        }
    }
}
