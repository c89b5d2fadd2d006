//! HTTP ingestion gateway: validate, publish, answer.

pub mod api;
pub mod publisher;
pub mod server;

pub use api::{ApiError, GatewayState, IngestResponse};
pub use publisher::{PublishError, Publisher, RetryPolicy};
pub use server::{router, serve};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::log::{
        EventLog, LogError, LogPosition, MemoryLog, OutboundRecord, PartitionClaim,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Wraps a [`MemoryLog`] and reports the first `failures` publishes as
    /// unavailable. With `losing_acks`, those publishes are appended first and
    /// only the acknowledgement is lost.
    pub struct FlakyLog {
        inner: MemoryLog,
        failures: u32,
        lose_acks: bool,
        attempts: AtomicU32,
    }

    impl FlakyLog {
        pub fn new(inner: MemoryLog, failures: u32) -> Self {
            Self {
                inner,
                failures,
                lose_acks: false,
                attempts: AtomicU32::new(0),
            }
        }

        pub fn losing_acks(mut self) -> Self {
            self.lose_acks = true;
            self
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn inner(&self) -> &MemoryLog {
            &self.inner
        }
    }

    #[async_trait]
    impl EventLog for FlakyLog {
        async fn publish(
            &self,
            topic: &str,
            record: OutboundRecord,
        ) -> Result<LogPosition, LogError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                if self.lose_acks {
                    self.inner.publish(topic, record).await?;
                }
                return Err(LogError::Unavailable("leader election".to_string()));
            }
            self.inner.publish(topic, record).await
        }

        async fn partition_count(&self, topic: &str) -> Result<u32, LogError> {
            self.inner.partition_count(topic).await
        }

        async fn claim(
            &self,
            topic: &str,
            group: &str,
            partition: u32,
        ) -> Result<Box<dyn PartitionClaim>, LogError> {
            self.inner.claim(topic, group, partition).await
        }
    }

    /// Accepts every publish but takes `delay` to acknowledge it.
    pub struct SlowLog {
        pub inner: MemoryLog,
        pub delay: Duration,
    }

    #[async_trait]
    impl EventLog for SlowLog {
        async fn publish(
            &self,
            topic: &str,
            record: OutboundRecord,
        ) -> Result<LogPosition, LogError> {
            tokio::time::sleep(self.delay).await;
            self.inner.publish(topic, record).await
        }

        async fn partition_count(&self, topic: &str) -> Result<u32, LogError> {
            self.inner.partition_count(topic).await
        }

        async fn claim(
            &self,
            topic: &str,
            group: &str,
            partition: u32,
        ) -> Result<Box<dyn PartitionClaim>, LogError> {
            self.inner.claim(topic, group, partition).await
        }
    }
}
