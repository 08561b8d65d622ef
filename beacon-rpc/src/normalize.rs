//! Activity normalization.
//!
//! Rich-presence clients send activities shaped for the official client
//! library; the gateway wants something slightly different. This module
//! rewrites one into the other: inject the application identity, resolve
//! asset names to asset ids (and external URLs to proxied `mp:` paths),
//! convert timestamps to milliseconds, split buttons from their targets, and
//! fix up flags.

use crate::AppDirectory;
use beacon_http::{HttpError, RpcAsset};
use beacon_model::{Activity, ActivityMetadata};
use serde_json::{Map, Number, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Asset keys passed through verbatim when they are not resolvable names.
const ASSET_WHITELIST: [&str; 4] = ["large_text", "small_text", "large_image", "small_image"];

/// Attempts at resolving one external asset before giving up.
const EXTERNAL_RETRIES: u32 = 5;

/// Spacing between external-asset lookups when an activity carries several.
const EXTERNAL_SPACING: Duration = Duration::from_millis(1500);

/// Normalize a client-supplied activity in place.
///
/// `external_assets` gates the external-URL resolution path; when disabled,
/// URL-valued assets are dropped.
pub async fn normalize_activity<D: AppDirectory + ?Sized>(
    activity: &mut Activity,
    app_id: &str,
    app_name: &str,
    declared_assets: &[RpcAsset],
    directory: &D,
    external_assets: bool,
) {
    let kind = activity.kind.unwrap_or(0);
    activity.application_id = Some(app_id.to_string());
    activity.name = Some(app_name.to_string());

    if let Some(assets) = activity.assets.take() {
        activity.assets = Some(
            normalize_assets(assets, app_id, declared_assets, directory, external_assets).await,
        );
    }

    if let Some(timestamps) = activity.timestamps.as_mut() {
        timestamps.start = timestamps.start.take().map(to_milliseconds);
        timestamps.end = timestamps.end.take().map(to_milliseconds);
    }

    if let Some(buttons) = activity.buttons.take() {
        let (labels, urls) = split_buttons(&buttons);
        activity.buttons = Some(Value::Array(labels));
        activity.metadata = Some(ActivityMetadata { button_urls: urls });
    }

    // Listening activities must not carry client-supplied flags.
    if kind == 2 {
        activity.flags = None;
    }
    activity.flags = Some(1);
    activity.kind = Some(kind);
    activity.instance = None;
}

async fn normalize_assets<D: AppDirectory + ?Sized>(
    assets: Map<String, Value>,
    app_id: &str,
    declared_assets: &[RpcAsset],
    directory: &D,
    external_assets: bool,
) -> Map<String, Value> {
    let external_count = assets
        .values()
        .filter(|value| is_external(value))
        .count();

    let mut resolved = Map::new();
    for (key, value) in assets {
        let Some(text) = value.as_str() else { continue };

        if text.starts_with("https://") {
            if external_assets {
                if let Some(path) = resolve_external(directory, app_id, text).await {
                    resolved.insert(key, Value::String(path));
                }
            }
            if external_count > 1 {
                sleep(EXTERNAL_SPACING).await;
            }
        } else if key.contains("image") {
            // An image key names a declared asset; replace it with the id.
            if let Some(asset) = declared_assets.iter().find(|asset| asset.name == text) {
                resolved.insert(key, Value::String(asset.id.clone()));
            }
        } else if ASSET_WHITELIST.contains(&key.as_str()) {
            resolved.insert(key, Value::String(text.to_string()));
        }
    }
    resolved
}

fn is_external(value: &Value) -> bool {
    value.as_str().is_some_and(|text| text.starts_with("https://"))
}

/// Resolve one external URL, honoring rate limits up to a bounded number of
/// retries. `None` drops the asset.
async fn resolve_external<D: AppDirectory + ?Sized>(
    directory: &D,
    app_id: &str,
    url: &str,
) -> Option<String> {
    for _ in 0..EXTERNAL_RETRIES {
        match directory.resolve_external(app_id, url).await {
            Ok(resolved) => {
                let path = &resolved.first()?.external_asset_path;
                return Some(format!("mp:{path}"));
            }
            Err(HttpError::RateLimited { retry_after }) => {
                debug!(retry_after, url, "external asset rate limited");
                sleep(Duration::from_secs_f64(retry_after + 0.2)).await;
            }
            Err(e) => {
                warn!(error = %e, url, "failed to resolve external asset");
                return None;
            }
        }
    }
    None
}

/// Seconds to milliseconds, tolerating fractional client timestamps.
fn to_milliseconds(seconds: Number) -> Number {
    if let Some(value) = seconds.as_u64() {
        return Number::from(value * 1000);
    }
    if let Some(value) = seconds.as_f64() {
        if let Some(number) = Number::from_f64(value * 1000.0) {
            return number;
        }
    }
    seconds
}

/// `[{label, url}]` into `([label, ...], [url, ...])`.
fn split_buttons(buttons: &Value) -> (Vec<Value>, Vec<String>) {
    let mut labels = Vec::new();
    let mut urls = Vec::new();
    if let Some(entries) = buttons.as_array() {
        for entry in entries {
            let label = entry.get("label").and_then(Value::as_str);
            let url = entry.get("url").and_then(Value::as_str);
            if let (Some(label), Some(url)) = (label, url) {
                labels.push(Value::String(label.to_string()));
                urls.push(url.to_string());
            }
        }
    }
    (labels, urls)
}


#[cfg(test)]
mod tests {
    use super::testing::StubDirectory;
    use super::*;
    use beacon_http::ExternalAsset;
    use serde_json::json;

    fn activity_from(value: Value) -> Activity {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_normalization_end_to_end() {
        // Mirrors the dialogue's reference exchange: named image resolved to
        // its id, text kept, timestamp scaled, identity injected.
        let directory = StubDirectory::new(vec![("9001", "logo")]);
        let mut activity = activity_from(json!({
            "state": "in menu",
            "assets": {"large_image": "logo", "large_text": "hi"},
            "timestamps": {"start": 1_700_000_000u64},
            "instance": true,
        }));
        normalize_activity(&mut activity, "123", "Foo", &directory.assets, &directory, true).await;

        assert_eq!(activity.application_id.as_deref(), Some("123"));
        assert_eq!(activity.name.as_deref(), Some("Foo"));
        let assets = activity.assets.as_ref().unwrap();
        assert_eq!(assets["large_image"], "9001");
        assert_eq!(assets["large_text"], "hi");
        assert_eq!(
            activity.timestamps.unwrap().start.unwrap().as_u64(),
            Some(1_700_000_000_000)
        );
        assert_eq!(activity.flags, Some(1));
        assert_eq!(activity.kind, Some(0));
        assert!(activity.instance.is_none());
    }

    #[tokio::test]
    async fn test_unknown_image_name_is_dropped() {
        let directory = StubDirectory::new(vec![("9001", "logo")]);
        let mut activity = activity_from(json!({
            "assets": {"small_image": "missing", "small_text": "cap"}
        }));
        normalize_activity(&mut activity, "123", "Foo", &directory.assets, &directory, true).await;
        let assets = activity.assets.as_ref().unwrap();
        assert!(assets.get("small_image").is_none());
        assert_eq!(assets["small_text"], "cap");
    }

    #[tokio::test]
    async fn test_external_asset_resolution_with_rate_limit() {
        let directory = StubDirectory::new(vec![]);
        *directory.external_responses.lock() = vec![
            Err(HttpError::RateLimited { retry_after: 0.0 }),
            Ok(vec![ExternalAsset {
                external_asset_path: "external/abc".to_string(),
            }]),
        ];
        let mut activity = activity_from(json!({
            "assets": {"large_image": "https://example.com/cover.png"}
        }));
        normalize_activity(&mut activity, "123", "Foo", &directory.assets, &directory, true).await;
        assert_eq!(
            activity.assets.as_ref().unwrap()["large_image"],
            "mp:external/abc"
        );
    }

    #[tokio::test]
    async fn test_external_assets_disabled_drops_urls() {
        let directory = StubDirectory::new(vec![]);
        let mut activity = activity_from(json!({
            "assets": {"large_image": "https://example.com/cover.png"}
        }));
        normalize_activity(&mut activity, "123", "Foo", &directory.assets, &directory, false).await;
        assert!(activity.assets.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_buttons_split_into_labels_and_urls() {
        let directory = StubDirectory::new(vec![]);
        let mut activity = activity_from(json!({
            "buttons": [
                {"label": "Join", "url": "https://example.com/join"},
                {"label": "Watch", "url": "https://example.com/watch"}
            ]
        }));
        normalize_activity(&mut activity, "123", "Foo", &directory.assets, &directory, true).await;
        assert_eq!(
            activity.buttons,
            Some(json!(["Join", "Watch"]))
        );
        assert_eq!(
            activity.metadata.unwrap().button_urls,
            vec!["https://example.com/join", "https://example.com/watch"]
        );
    }

    #[tokio::test]
    async fn test_listening_activity_flags_reset() {
        let directory = StubDirectory::new(vec![]);
        let mut activity = activity_from(json!({"type": 2, "flags": 48}));
        normalize_activity(&mut activity, "123", "Foo", &directory.assets, &directory, true).await;
        assert_eq!(activity.flags, Some(1));
        assert_eq!(activity.kind, Some(2));
    }

    #[tokio::test]
    async fn test_fractional_timestamp() {
        let directory = StubDirectory::new(vec![]);
        let mut activity = activity_from(json!({"timestamps": {"end": 1.5}}));
        normalize_activity(&mut activity, "123", "Foo", &directory.assets, &directory, true).await;
        let end = activity.timestamps.unwrap().end.unwrap();
        assert_eq!(end.as_f64(), Some(1500.0));
    }
}
