use std::sync::Arc;

use lapin::{
    options::*, types::FieldTable, Channel, Connection, ConnectionProperties, Consumer,
};

use crate::types::CHANGE_EXCHANGE;

/// AMQP client used as the change-feed transport.
#[derive(Clone)]
pub struct RabbitMQClient {
    connection: Arc<Connection>,
    channel: Channel,
}

impl RabbitMQClient {
    pub async fn connect(url: &str) -> Result<Self, lapin::Error> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;

        // The change exchange is owned by the feed publisher; declaring it
        // here is idempotent and lets consumers start first.
        channel
            .exchange_declare(
                CHANGE_EXCHANGE,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!("connected to RabbitMQ");
        Ok(Self {
            connection: Arc::new(conn),
            channel,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    /// Declare a private queue for one subscription and bind it to routing keys.
    ///
    /// The queue is exclusive and auto-deleted, so the broker drops it when the
    /// consumer goes away even if `cancel` never runs.
    pub async fn subscribe(
        &self,
        queue_name: &str,
        routing_keys: &[String],
    ) -> Result<Consumer, lapin::Error> {
        self.channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for key in routing_keys {
            self.channel
                .queue_bind(
                    queue_name,
                    CHANGE_EXCHANGE,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        let consumer = self.channel
            .basic_consume(
                queue_name,
                &consumer_tag(queue_name),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(
            queue = %queue_name,
            bindings = ?routing_keys,
            "subscribed to change feed queue"
        );

        Ok(consumer)
    }

    /// Stop consuming and drop the subscription queue.
    pub async fn cancel(&self, queue_name: &str) -> Result<(), lapin::Error> {
        self.channel
            .basic_cancel(&consumer_tag(queue_name), BasicCancelOptions::default())
            .await?;
        self.channel
            .queue_delete(queue_name, QueueDeleteOptions::default())
            .await?;

        tracing::debug!(queue = %queue_name, "change feed queue released");
        Ok(())
    }
}

fn consumer_tag(queue_name: &str) -> String {
    format!("{queue_name}-consumer")
}
