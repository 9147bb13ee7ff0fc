//! Event intake: validate, encode, append, acknowledge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::event::{codec, Event, ValidationError};
use crate::health::HealthMetrics;
use crate::queue::{LogProducer, Position, QueueError};

/// Acknowledgement that an event is durably queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub position: Position,
}

/// Why a submission was not accepted.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The request itself is bad; resubmitting it unchanged will fail again.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The log did not confirm the append. Nothing is known to be queued.
    #[error("queueing event: {0}")]
    Queue(#[from] QueueError),
}

/// Producer side of the pipeline.
pub struct Ingress<P> {
    producer: P,
    append_timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl<P: LogProducer> Ingress<P> {
    pub fn new(producer: P, append_timeout: Duration) -> Self {
        Self {
            producer,
            append_timeout,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Validates `body`, appends it once and returns only after the log has
    /// confirmed the write. There is no retry on failure.
    pub async fn submit(&self, body: &[u8]) -> Result<Accepted, SubmitError> {
        let event = match Event::from_request_body(body) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Rejected event");
                self.record("invalid");
                return Err(e.into());
            }
        };

        let payload = codec::encode(&event);
        let started = Instant::now();

        let result = match tokio::time::timeout(self.append_timeout, self.producer.append(payload))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(QueueError::Unavailable(format!(
                "append not confirmed within {:?}",
                self.append_timeout
            ))),
        };

        if let Some(h) = &self.health {
            h.append_duration.observe(started.elapsed().as_secs_f64());
        }

        match result {
            Ok(position) => {
                debug!(
                    site_id = event.site_id(),
                    event_type = event.event_type(),
                    partition = position.partition,
                    offset = position.offset,
                    "Event queued"
                );
                self.record("accepted");
                Ok(Accepted { position })
            }
            Err(e) => {
                warn!(
                    error = %e,
                    site_id = event.site_id(),
                    "Failed to queue event"
                );
                self.record("queue_error");
                Err(e.into())
            }
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(h) = &self.health {
            h.ingress_requests.with_label_values(&[outcome]).inc();
        }
    }
}
