use std::sync::Arc;

use jobagent_core::{mail::Mailer, store::StoreConnector, JobAgentConfig};
use uuid::Uuid;

use crate::pool::WorkerPool;

/// Everything a scheduler, job or step task needs, cheap to clone.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<JobAgentConfig>,
    /// Identity of this agent process in the store. Fresh on every start.
    pub agent_id: String,
    pub connector: Arc<dyn StoreConnector>,
    pub mailer: Arc<dyn Mailer>,
    pub pool: WorkerPool,
}

impl AgentContext {
    pub fn new(
        config: JobAgentConfig,
        connector: Arc<dyn StoreConnector>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let pool = WorkerPool::new(config.agent.worker_pool_size);
        Self {
            config: Arc::new(config),
            agent_id: Uuid::new_v4().to_string(),
            connector,
            mailer,
            pool,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.config.agent.hostname
    }
}
