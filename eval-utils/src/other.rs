//! Module containing some utility functions that didn't fit anywhere else.

use time::{format_description, OffsetDateTime};
use tokio::process::Command;

/// Post a message to the chat webhook configured for the experiment. Without a webhook, or in
/// `dry` mode, the message is only logged.
pub async fn send_notification(webhook: Option<&str>, message: impl AsRef<str>, dry: bool) {
    let message = message.as_ref();
    let Some(webhook) = webhook else {
        log::trace!("No notification webhook configured. Message: {message}");
        return;
    };
    if dry {
        log::info!("(dry run) would notify {webhook}: {message}");
        return;
    }

    let payload = serde_json::json!({ "text": message }).to_string();
    match Command::new("curl")
        .args(["-s", "-X", "POST", "-H", "Content-Type: application/json"])
        .args(["--data", &payload, webhook])
        .output()
        .await
    {
        Ok(out) if out.status.success() => log::debug!("Notification sent."),
        Ok(out) => log::warn!(
            "Cannot send notification (exit code {:?}): {}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr)
        ),
        Err(e) => log::warn!("Cannot send notification: {e}"),
    }
}

/// Produces a timestamp `String` of the current time in YYYY-MM-DD_HH-mm-SS format.
pub fn get_timestamp() -> String {
    OffsetDateTime::now_local()
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(
            &format_description::parse("[year]-[month]-[day]_[hour]-[minute]-[second]").unwrap(),
        )
        .unwrap()
}

/// Name of the user running the experiments, as reported by the environment.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
