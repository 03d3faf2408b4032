use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Ordered string map, so event payloads serialize with deterministic key
/// order and signatures stay stable.
pub type EventData = BTreeMap<String, String>;

/// Domain events emitted by admission and the workers, fanned out to webhook
/// subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "snap_webhook_event", rename_all = "snake_case")]
pub enum JobEvent {
    ScreenshotCreated,
    ScreenshotCompleted,
    ScreenshotFailed,
    ScreenshotRetried,
    AnalysisCompleted,
    AnalysisFailed,
    WebhookTest,
}

impl JobEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEvent::ScreenshotCreated => "SCREENSHOT_CREATED",
            JobEvent::ScreenshotCompleted => "SCREENSHOT_COMPLETED",
            JobEvent::ScreenshotFailed => "SCREENSHOT_FAILED",
            JobEvent::ScreenshotRetried => "SCREENSHOT_RETRIED",
            JobEvent::AnalysisCompleted => "ANALYSIS_COMPLETED",
            JobEvent::AnalysisFailed => "ANALYSIS_FAILED",
            JobEvent::WebhookTest => "WEBHOOK_TEST",
        }
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCREENSHOT_CREATED" => Ok(JobEvent::ScreenshotCreated),
            "SCREENSHOT_COMPLETED" => Ok(JobEvent::ScreenshotCompleted),
            "SCREENSHOT_FAILED" => Ok(JobEvent::ScreenshotFailed),
            "SCREENSHOT_RETRIED" => Ok(JobEvent::ScreenshotRetried),
            "ANALYSIS_COMPLETED" => Ok(JobEvent::AnalysisCompleted),
            "ANALYSIS_FAILED" => Ok(JobEvent::AnalysisFailed),
            "WEBHOOK_TEST" => Ok(JobEvent::WebhookTest),
            invalid => Err(format!("{invalid} is not a known event")),
        }
    }
}

/// Where domain events go. The webhook engine implements this; emitters hold
/// it as `Option<Arc<dyn EventSink>>` and must work without one.
///
/// Emission is fire-and-forget from the emitter's point of view: delivery
/// failures are the sink's business (it has its own retry machinery), so the
/// method is infallible and implementations log internally.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Fan the event out to the user's subscriptions. `direct_url`, when
    /// present, is an additional ad-hoc destination supplied on the job
    /// itself.
    async fn emit(
        &self,
        user_id: &str,
        event: JobEvent,
        data: EventData,
        direct_url: Option<String>,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for event in [
            JobEvent::ScreenshotCreated,
            JobEvent::ScreenshotCompleted,
            JobEvent::ScreenshotFailed,
            JobEvent::ScreenshotRetried,
            JobEvent::AnalysisCompleted,
            JobEvent::AnalysisFailed,
            JobEvent::WebhookTest,
        ] {
            assert_eq!(event.as_str().parse::<JobEvent>().unwrap(), event);
        }
    }

    #[test]
    fn serde_uses_wire_names() {
        let encoded = serde_json::to_string(&JobEvent::ScreenshotCompleted).unwrap();
        assert_eq!(encoded, "\"SCREENSHOT_COMPLETED\"");
    }
}
