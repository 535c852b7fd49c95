//! Message-bus plumbing: producer construction, the boot-time probe, and
//! topic provisioning for `url_clicks`.

use std::time::Duration;

use anyhow::Result;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;

pub fn create_producer(bootstrap_servers: &str, client_id: &str) -> Result<FutureProducer> {
    let producer = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("client.id", client_id)
        .set("message.timeout.ms", "5000")
        .set("queue.buffering.max.messages", "100000")
        .set("queue.buffering.max.ms", "5")
        .set("compression.codec", "snappy")
        .create()?;
    Ok(producer)
}

/// Boot-time connectivity probe. Metadata fetch is blocking, so it runs on
/// the blocking pool; a dead broker set reports `false` within `timeout`.
pub async fn probe_bus(bootstrap_servers: &str, timeout: Duration) -> bool {
    let servers = bootstrap_servers.to_string();
    let probe = tokio::task::spawn_blocking(move || {
        let client: Result<rdkafka::consumer::BaseConsumer, _> = ClientConfig::new()
            .set("bootstrap.servers", &servers)
            .create();
        match client {
            Ok(consumer) => rdkafka::consumer::Consumer::fetch_metadata(
                &consumer,
                None,
                timeout,
            )
            .is_ok(),
            Err(_) => false,
        }
    });
    matches!(probe.await, Ok(true))
}

/// Provision the click topic: 6 partitions, 7-day delete retention, snappy,
/// 1-day segments. Existing topics are left untouched.
pub async fn ensure_click_topic(
    bootstrap_servers: &str,
    topic: &str,
    partitions: i32,
    replication: i32,
) -> Result<()> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .create()?;

    let retention_ms = (7 * 24 * 3600 * 1000i64).to_string();
    let segment_ms = (24 * 3600 * 1000i64).to_string();
    let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(replication))
        .set("cleanup.policy", "delete")
        .set("retention.ms", &retention_ms)
        .set("segment.ms", &segment_ms)
        .set("compression.type", "snappy");

    let results = admin
        .create_topics([&new_topic], &AdminOptions::new())
        .await?;
    for result in results {
        match result {
            Ok(name) => tracing::info!(topic = %name, "click topic created"),
            Err((name, rdkafka::types::RDKafkaErrorCode::TopicAlreadyExists)) => {
                tracing::debug!(topic = %name, "click topic already present");
            }
            Err((name, code)) => {
                tracing::warn!(topic = %name, ?code, "click topic creation failed");
            }
        }
    }
    Ok(())
}
