use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bridge::{InstanceFactory, MemberInvoker};
use crate::config::BrokerConfig;
use crate::pool::{Connection, ConnectionFactory};

/// One unit of work to run against an infobase
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    /// Path relative to the infobase address
    pub path: String,

    /// Input parameters, added in order
    pub context: Vec<(String, String)>,

    /// Key to read the result from
    pub result_key: Option<String>,

    /// Key the unit of work stores its error message under
    pub error_key: Option<String>,
}

impl UnitOfWork {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    pub fn with_result_key(mut self, key: impl Into<String>) -> Self {
        self.result_key = Some(key.into());
        self
    }

    pub fn with_error_key(mut self, key: impl Into<String>) -> Self {
        self.error_key = Some(key.into());
        self
    }
}

/// Broker shared by every caller in the process
///
/// Clones share the same connection cache.
#[derive(Clone)]
pub struct Broker {
    pub config: Arc<BrokerConfig>,
    factory: Arc<ConnectionFactory>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        instance_factory: Arc<dyn InstanceFactory>,
        invoker: Arc<dyn MemberInvoker>,
    ) -> Self {
        let factory = ConnectionFactory::new(config.settings(), instance_factory, invoker);
        Self {
            config: Arc::new(config),
            factory: Arc::new(factory),
        }
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    /// Cached connection for a named (or the default) target
    pub async fn connection(
        &self,
        target_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>> {
        let target = self.config.target(target_name)?;
        let connection = self
            .factory
            .get_connection(&target, cancel)
            .await
            .context(format!("Failed to get connection for '{}'", target))?;
        Ok(connection)
    }

    /// Connect, run `work` and release the connection back to the idle timer
    ///
    /// The connection is disposed whatever the outcome, so a following call
    /// within the grace period reuses it.
    pub async fn execute(
        &self,
        target_name: Option<&str>,
        work: &UnitOfWork,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let connection = self.connection(target_name, cancel).await?;
        debug!(infobase = %connection.target(), path = %work.path, "Executing unit of work");

        let result = async {
            connection.connect(cancel).await?;
            connection
                .run_unit_of_work(
                    &work.path,
                    Some(work.context.as_slice()),
                    work.result_key.as_deref(),
                    work.error_key.as_deref(),
                    cancel,
                )
                .await
        }
        .await;

        connection.dispose();
        Ok(result?)
    }

    /// Tear down every cached connection
    pub async fn shutdown(&self) {
        self.factory.shutdown().await;
    }
}
