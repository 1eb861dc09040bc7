use std::sync::Arc;

use crate::config::RelayConfig;
use crate::node::Node;
use crate::transport::longpoll::LongPollSessions;

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
    pub config: Arc<RelayConfig>,
    pub longpoll: Arc<LongPollSessions>,
}

impl AppState {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            node: Node::new(&config),
            config: Arc::new(config),
            longpoll: Arc::new(LongPollSessions::new()),
        }
    }
}
