//! Service layer: the callable contract of the feed core

mod feed;
mod follows;
mod posts;

pub use feed::FeedService;
pub use follows::FollowService;
pub use posts::PostService;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::metrics;
use crate::stream::{EventPublisher, FeedEvent, ReconcileHook, STREAM_FEED};

/// Publish an event after its local transaction committed.
///
/// Never fails the caller: a write whose commit succeeded stays successful.
/// Failures are logged, counted, and handed to the reconciliation hook.
pub(crate) async fn publish_after_commit(
    publisher: &Arc<dyn EventPublisher>,
    reconcile: &Option<Arc<dyn ReconcileHook>>,
    event: FeedEvent,
) {
    match publisher.publish(STREAM_FEED, &event).await {
        Ok(message_id) => {
            debug!(event = event.type_name(), message_id = %message_id, "event published");
        }
        Err(e) => {
            warn!(event = event.type_name(), error = %e, "publish failed after commit");
            metrics::record_publish_failure(event.type_name());
            if let Some(hook) = reconcile {
                hook.on_publish_failure(&event, &e);
            }
        }
    }
}
