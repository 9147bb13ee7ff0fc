use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{self, ApiState};
use crate::config::{Config, QueueBackend, Role, StoreBackend};
use crate::health::HealthMetrics;
use crate::ingress::Ingress;
use crate::processor::Processor;
#[cfg(feature = "kafka")]
use crate::queue::kafka::{KafkaConsumer, KafkaProducer};
use crate::queue::memory::MemoryLog;
use crate::queue::{Consumer, Producer};
use crate::store::clickhouse::ClickHouseStore;
use crate::store::memory::MemoryStore;
use crate::store::Store;

/// Service builds the shared resources for a role and owns the tasks that
/// use them: the API server and the processor loops.
pub struct Service {
    cfg: Config,
    role: Role,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    api: Option<JoinHandle<()>>,
    api_addr: Option<SocketAddr>,
    processors: Vec<JoinHandle<Result<()>>>,
}

impl Service {
    /// Validates the configuration for `role` and creates health metrics.
    pub fn new(cfg: Config, role: Role) -> Result<Self> {
        cfg.validate(role)
            .with_context(|| format!("invalid configuration for {role}"))?;

        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            role,
            health,
            cancel: CancellationToken::new(),
            api: None,
            api_addr: None,
            processors: Vec::new(),
        })
    }

    /// Connects the backends and starts every task for the role.
    pub async fn start(&mut self) -> Result<()> {
        // Health first so probes respond while backends connect.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let store = Arc::new(self.open_store().await?);
        info!(backend = store.name(), "store ready");

        let memory_log = (self.cfg.queue.backend == QueueBackend::Memory)
            .then(|| MemoryLog::new(self.cfg.queue.partitions));

        if self.role.serves_api() {
            let producer = self.build_producer(memory_log.as_ref())?;
            info!(backend = producer.name(), topic = %self.cfg.queue.topic, "producer ready");

            let state = Arc::new(ApiState {
                ingress: Ingress::new(producer, self.cfg.queue.append_timeout)
                    .with_health(Arc::clone(&self.health)),
                store: Arc::clone(&store),
                health: Some(Arc::clone(&self.health)),
            });

            let (addr, handle) = api::serve(
                &self.cfg.ingress.addr,
                api::router(state),
                self.cancel.child_token(),
            )
            .await
            .context("starting API server")?;

            self.api = Some(handle);
            self.api_addr = Some(addr);
        }

        if self.role.consumes() {
            let workers = self.cfg.processor.workers;
            for worker in 0..workers {
                let consumer = self.build_consumer(memory_log.as_ref(), worker, workers)?;
                let processor = Processor::new(consumer, Arc::clone(&store), &self.cfg.processor)
                    .with_worker(worker)
                    .with_health(Arc::clone(&self.health));

                self.processors
                    .push(tokio::spawn(processor.run(self.cancel.child_token())));
            }
            info!(
                workers,
                group_id = %self.cfg.queue.group_id,
                "processors started"
            );
        }

        info!(role = %self.role, "sitepulse started");

        Ok(())
    }

    /// Address the API server is bound to, if this role serves one.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }

    /// Gracefully stop all tasks: the API drains in-flight requests, each
    /// processor finishes its current message and flushes its commits.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(api) = self.api.take() {
            if let Err(e) = api.await {
                error!(error = %e, "API server task failed");
            }
        }

        for handle in self.processors.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "processor exited with error"),
                Err(e) => error!(error = %e, "processor task failed"),
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    async fn open_store(&self) -> Result<Store> {
        match self.cfg.store.backend {
            StoreBackend::ClickHouse => {
                let store =
                    ClickHouseStore::connect(&self.cfg.store, Some(Arc::clone(&self.health)))
                        .await
                        .context("connecting to ClickHouse")?;
                Ok(Store::ClickHouse(store))
            }
            StoreBackend::Memory => Ok(Store::Memory(MemoryStore::new())),
        }
    }

    fn build_producer(&self, memory_log: Option<&MemoryLog>) -> Result<Producer> {
        match (self.cfg.queue.backend, memory_log) {
            (QueueBackend::Memory, Some(log)) => Ok(Producer::Memory(log.producer())),
            #[cfg(feature = "kafka")]
            (QueueBackend::Kafka, _) => {
                let q = &self.cfg.queue;
                let producer = KafkaProducer::new(&q.brokers, &q.topic, q.append_timeout)
                    .context("creating Kafka producer")?;
                Ok(Producer::Kafka(producer))
            }
            _ => bail!("queue backend {:?} is not available", self.cfg.queue.backend),
        }
    }

    fn build_consumer(
        &self,
        memory_log: Option<&MemoryLog>,
        worker: usize,
        workers: usize,
    ) -> Result<Consumer> {
        match (self.cfg.queue.backend, memory_log) {
            (QueueBackend::Memory, Some(log)) => Ok(Consumer::Memory(log.consumer_for(
                &self.cfg.queue.group_id,
                worker,
                workers,
            ))),
            #[cfg(feature = "kafka")]
            (QueueBackend::Kafka, _) => {
                let q = &self.cfg.queue;
                let consumer = KafkaConsumer::new(&q.brokers, &q.topic, &q.group_id)
                    .with_context(|| format!("creating Kafka consumer {worker}"))?;
                Ok(Consumer::Kafka(consumer))
            }
            _ => bail!("queue backend {:?} is not available", self.cfg.queue.backend),
        }
    }
}
