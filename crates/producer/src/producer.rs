use bridge::{MessageCodec, Payload, ProduceError, ProducerConfig, PublishError, PublishReport};
use session::{BrokerSession, SessionFactory};
use tracing::{debug, info, instrument, warn};

/// Publishes payload lists, one short-lived session per run.
#[derive(Clone)]
pub struct Producer {
    factory: SessionFactory,
    codec: MessageCodec,
}

impl Producer {
    pub fn new(factory: SessionFactory) -> Self {
        Self {
            factory,
            codec: MessageCodec::new(),
        }
    }

    /// Publishes `payloads` in order to `config.topic_destination`.
    ///
    /// Stops at the first failure. The session is closed whether the run
    /// succeeds or not.
    #[instrument(
        skip(self, config, payloads),
        fields(topic = %config.topic_destination, count = payloads.len())
    )]
    pub async fn run(
        &self,
        config: &ProducerConfig,
        payloads: &[Payload],
    ) -> Result<PublishReport, ProduceError> {
        let mut session = self.factory.open(&config.connection).await?;

        let result = self.publish_all(&session, config, payloads).await;

        let outcome = session.close().await;
        debug!(?outcome, session_id = %session.id(), "Producer session closed");

        match result {
            Ok(published_count) => {
                info!(published_count, "Producer run complete");
                Ok(PublishReport { published_count })
            }
            Err((published_count, source)) => {
                warn!(published_count, error = %source, "Producer run aborted");
                Err(ProduceError::Publish {
                    published_count,
                    source,
                })
            }
        }
    }

    async fn publish_all(
        &self,
        session: &BrokerSession,
        config: &ProducerConfig,
        payloads: &[Payload],
    ) -> Result<usize, (usize, PublishError)> {
        for (published, payload) in payloads.iter().enumerate() {
            let body = self
                .codec
                .encode_with_properties(payload, config.message_properties.clone())
                .map_err(|err| (published, err))?;
            session
                .publish(
                    &config.topic_destination,
                    body,
                    config.delivery_mode,
                    config.ack_timeout,
                )
                .await
                .map_err(|err| (published, err))?;
        }
        Ok(payloads.len())
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("live_sessions", &self.factory.live_sessions())
            .finish()
    }
}
