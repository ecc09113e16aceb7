use std::sync::Arc;
use std::time::Duration;

use taskhub::providers::HistoryStore;
use taskhub::Event;

/// Poll history until an `EventSubscribed` for `event_name` appears, so a
/// test can raise the event only once a subscription is open.
#[allow(dead_code)]
pub async fn wait_for_subscription(
    store: Arc<dyn HistoryStore>,
    instance: &str,
    event_name: &str,
    timeout_ms: u64,
) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await;
        let found = hist
            .iter()
            .any(|e| matches!(e, Event::EventSubscribed { name, .. } if name == event_name));
        if found {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll history until any event matches `pred`.
#[allow(dead_code)]
pub async fn wait_for_history(
    store: Arc<dyn HistoryStore>,
    instance: &str,
    timeout_ms: u64,
    pred: impl Fn(&[Event]) -> bool,
) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await;
        if pred(&hist) {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
