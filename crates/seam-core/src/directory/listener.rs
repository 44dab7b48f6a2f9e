//! Lifecycle notification ingestion
//!
//! One listener task per configured service provider, subscribed to that
//! provider's notification bus. Lifecycle events are the only write path
//! into the directory. A lost event leaves the directory stale; that is an
//! accepted property of the cache, so handler failures are logged and the
//! loop keeps consuming.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Directory, ResourceMapping};
use crate::config::ServiceProviderConfig;
use crate::error::{Error, Result};

/// Channel each provider publishes lifecycle notifications on.
const NOTIFICATION_CHANNEL: &str = "notifications";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One lifecycle notification as published on the bus.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl LifecycleEvent {
    fn field(&self, name: &str) -> Result<&str> {
        self.payload
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::MalformedEvent(format!("{} missing '{name}'", self.event_type))
            })
    }
}

/// Apply one lifecycle event from `sp_name` to the directory.
///
/// Event types outside the table are ignored; the bus carries plenty of
/// traffic the directory does not care about.
pub async fn apply_event(
    directory: &Directory,
    sp_name: &str,
    event: &LifecycleEvent,
) -> Result<()> {
    match event.event_type.as_str() {
        "volume.create.start" => {
            directory
                .insert(&ResourceMapping::new(
                    "volumes",
                    event.field("volume_id")?,
                    event.field("tenant_id")?,
                    sp_name,
                ))
                .await
        }
        "volume.delete.end" => directory.delete("volumes", event.field("volume_id")?).await,
        "volume.transfer.accept.end" => {
            directory
                .update_owner("volumes", event.field("volume_id")?, event.field("tenant_id")?)
                .await
        }
        "snapshot.create.start" => {
            directory
                .insert(&ResourceMapping::new(
                    "snapshots",
                    event.field("snapshot_id")?,
                    event.field("tenant_id")?,
                    sp_name,
                ))
                .await
        }
        "snapshot.delete.end" => {
            directory.delete("snapshots", event.field("snapshot_id")?).await
        }
        "image.create" => {
            directory
                .insert(&ResourceMapping::new(
                    "images",
                    event.field("id")?,
                    event.field("owner")?,
                    sp_name,
                ))
                .await
        }
        "image.delete" => directory.delete("images", event.field("id")?).await,
        other => {
            debug!(event_type = %other, "ignoring lifecycle event");
            Ok(())
        }
    }
}

/// Consume one provider's notification bus until the connection drops.
async fn listen_once(directory: &Directory, sp: &ServiceProviderConfig, bus: &str) -> Result<()> {
    let client = redis::Client::open(bus)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(NOTIFICATION_CHANNEL).await?;
    info!(service_provider = %sp.name, "listening for lifecycle notifications");

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let raw: String = message.get_payload()?;
        let event: LifecycleEvent = match serde_json::from_str(&raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(service_provider = %sp.name, error = %e, "undecodable notification");
                continue;
            }
        };
        if let Err(e) = apply_event(directory, &sp.name, &event).await {
            warn!(
                service_provider = %sp.name,
                event_type = %event.event_type,
                error = %e,
                "failed to apply lifecycle event"
            );
        }
    }
    Ok(())
}

/// Run the listener for one provider forever, reconnecting on failure.
/// Providers without a configured bus address are skipped by the caller.
pub async fn run_listener(directory: Arc<Directory>, sp: ServiceProviderConfig) {
    let Some(bus) = sp.messagebus.clone() else {
        return;
    };
    loop {
        if let Err(e) = listen_once(&directory, &sp, &bus).await {
            warn!(service_provider = %sp.name, error = %e, "notification listener error");
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_directory() -> Directory {
        Directory::connect("sqlite::memory:").await.unwrap()
    }

    fn event(event_type: &str, payload: Value) -> LifecycleEvent {
        LifecycleEvent {
            event_type: event_type.to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_volume_create_inserts_mapping() {
        let dir = memory_directory().await;
        apply_event(
            &dir,
            "remote1",
            &event(
                "volume.create.start",
                json!({"volume_id": "6c4ae06e-14bd-422e-97af-e07223c99e18",
                       "tenant_id": "319d8162-b383-4260-9f5f-afe1404216b9"}),
            ),
        )
        .await
        .unwrap();

        let mapping = dir
            .find("volumes", "6c4ae06e14bd422e97afe07223c99e18")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.service_provider, "remote1");
        assert_eq!(mapping.project_id, "319d8162b38342609f5fafe1404216b9");
    }

    #[tokio::test]
    async fn test_volume_delete_removes_mapping() {
        let dir = memory_directory().await;
        dir.insert(&ResourceMapping::new("volumes", "abc123", "p1", "remote1"))
            .await
            .unwrap();
        apply_event(
            &dir,
            "remote1",
            &event("volume.delete.end", json!({"volume_id": "abc123"})),
        )
        .await
        .unwrap();
        assert!(dir.find("volumes", "abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transfer_updates_owner_only() {
        let dir = memory_directory().await;
        dir.insert(&ResourceMapping::new("volumes", "abc123", "p1", "remote1"))
            .await
            .unwrap();
        apply_event(
            &dir,
            "remote1",
            &event(
                "volume.transfer.accept.end",
                json!({"volume_id": "abc123", "tenant_id": "p2"}),
            ),
        )
        .await
        .unwrap();

        let mapping = dir.find("volumes", "abc123").await.unwrap().unwrap();
        assert_eq!(mapping.project_id, "p2");
        assert_eq!(mapping.service_provider, "remote1");
    }

    #[tokio::test]
    async fn test_transfer_for_unknown_volume_errors() {
        let dir = memory_directory().await;
        let err = apply_event(
            &dir,
            "remote1",
            &event(
                "volume.transfer.accept.end",
                json!({"volume_id": "missing", "tenant_id": "p2"}),
            ),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MappingNotFound(_, _)));
    }

    #[tokio::test]
    async fn test_image_events_use_image_payload_fields() {
        let dir = memory_directory().await;
        apply_event(
            &dir,
            "remote2",
            &event("image.create", json!({"id": "img-1", "owner": "p9"})),
        )
        .await
        .unwrap();
        let mapping = dir.find("images", "img-1").await.unwrap().unwrap();
        assert_eq!(mapping.service_provider, "remote2");
        assert_eq!(mapping.project_id, "p9");

        apply_event(&dir, "remote2", &event("image.delete", json!({"id": "img-1"})))
            .await
            .unwrap();
        assert!(dir.find("images", "img-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_events() {
        let dir = memory_directory().await;
        apply_event(
            &dir,
            "remote1",
            &event(
                "snapshot.create.start",
                json!({"snapshot_id": "snap-1", "tenant_id": "p1"}),
            ),
        )
        .await
        .unwrap();
        assert!(dir.find("snapshots", "snap-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_event_ignored() {
        let dir = memory_directory().await;
        apply_event(&dir, "remote1", &event("volume.resize.end", json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_payload_field_is_malformed() {
        let dir = memory_directory().await;
        let err = apply_event(
            &dir,
            "remote1",
            &event("volume.create.start", json!({"volume_id": "v1"})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
    }
}
