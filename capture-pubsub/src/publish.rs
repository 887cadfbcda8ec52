use tracing::{debug, instrument};

use crate::api::{ConfigurationError, ProcessorError};
use crate::client::BrokerClient;
use crate::format::FormattedRecord;
use crate::transport::{PublishRequest, PubsubMessage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    Topic,
    Subscription,
}

impl ResourceType {
    pub fn collection_name(&self) -> &'static str {
        match self {
            ResourceType::Topic => "topics",
            ResourceType::Subscription => "subscriptions",
        }
    }
}

fn check_segment(kind: &'static str, name: &str) -> Result<(), ConfigurationError> {
    if name.is_empty() || name.contains('/') {
        return Err(ConfigurationError::InvalidResourceName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// `projects/<project>/<collection>/<resource>`
pub fn fully_qualified_resource_name(
    resource_type: ResourceType,
    project: &str,
    resource: &str,
) -> Result<String, ConfigurationError> {
    check_segment("project", project)?;
    check_segment(resource_type.collection_name(), resource)?;

    Ok(format!(
        "projects/{}/{}/{}",
        project,
        resource_type.collection_name(),
        resource
    ))
}

pub fn topic_path(project: &str, topic: &str) -> Result<String, ConfigurationError> {
    fully_qualified_resource_name(ResourceType::Topic, project, topic)
}

/// Identifiers the broker assigned to a published message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    message_ids: Vec<String>,
}

impl DeliveryReceipt {
    pub fn new(message_ids: Vec<String>) -> DeliveryReceipt {
        DeliveryReceipt { message_ids }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_ids.first().map(String::as_str)
    }

    pub fn message_ids(&self) -> &[String] {
        &self.message_ids
    }
}

/// Send one record as one message.
#[instrument(skip_all, fields(topic = topic))]
pub async fn publish(
    client: &BrokerClient,
    project: &str,
    topic: &str,
    record: &FormattedRecord,
) -> Result<DeliveryReceipt, ProcessorError> {
    let topic = topic_path(project, topic)?;
    let request = PublishRequest {
        messages: vec![PubsubMessage::from_payload(record.as_bytes())],
    };

    let start = tokio::time::Instant::now();
    let response = client.publish(&topic, &request).await;
    metrics::histogram!("capture_pubsub_publish_duration_seconds")
        .record(start.elapsed().as_secs_f64());

    let receipt = DeliveryReceipt::new(response?.message_ids);
    for message_id in receipt.message_ids() {
        debug!("published with a message id: {}", message_id);
    }
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_names() {
        assert_eq!(
            topic_path("capture-test", "events").unwrap(),
            "projects/capture-test/topics/events"
        );
        assert_eq!(
            fully_qualified_resource_name(ResourceType::Subscription, "capture-test", "sink")
                .unwrap(),
            "projects/capture-test/subscriptions/sink"
        );
    }

    #[test]
    fn unusable_resource_names() {
        for (project, topic) in [("", "events"), ("capture-test", ""), ("a/b", "events"), ("p", "t/x")] {
            assert!(matches!(
                topic_path(project, topic),
                Err(ConfigurationError::InvalidResourceName { .. })
            ));
        }
    }

    #[test]
    fn receipt_exposes_first_id() {
        let receipt = DeliveryReceipt::new(vec!["1".to_string(), "2".to_string()]);
        assert_eq!(receipt.message_id(), Some("1"));
        assert_eq!(DeliveryReceipt::default().message_id(), None);
    }
}
