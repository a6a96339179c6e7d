//! NOTIFY stage.

use std::time::Instant;

use async_trait::async_trait;

use crate::adapters::{DriverRegistry, NotificationMessage};
use crate::domain::{AnalyzeResult, Delivery, NotifyResult, Stage, StageContext, StageOutput};

use super::{merge_objects, StageExecutor};

/// Recommendations included in a rendered message
const TOP_RECOMMENDATIONS: usize = 3;

pub struct NotifyExecutor {
    drivers: DriverRegistry,
    default_driver: String,
    default_config: serde_json::Value,
}

impl NotifyExecutor {
    pub fn new(drivers: DriverRegistry, default_driver: String, default_config: serde_json::Value) -> Self {
        Self {
            drivers,
            default_driver,
            default_config,
        }
    }

    async fn notify(&self, ctx: &StageContext) -> NotifyResult {
        let analysis: AnalyzeResult = ctx
            .previous(Stage::Analyze)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let message = render_message(ctx, &analysis);

        let driver_name = ctx
            .payload_str("notify_driver")
            .unwrap_or(self.default_driver.as_str())
            .to_string();
        let config = merge_objects(
            &self.default_config,
            ctx.payload.get("notify_config").unwrap_or(&serde_json::Value::Null),
        );

        let mut result = NotifyResult {
            driver: Some(driver_name.clone()),
            severity: Some(message.severity.clone()),
            ..Default::default()
        };

        let driver = match self.drivers.resolve(&driver_name) {
            Ok(driver) => driver,
            Err(e) => {
                result.errors.push(format!("Notify error: {}", e));
                result.fatal = true;
                return result;
            }
        };

        if !driver.validate_config(&config) {
            result
                .errors
                .push(format!("Notify error: invalid config for driver '{}'", driver_name));
            result.fatal = true;
            return result;
        }

        let channel = config
            .get("channel")
            .and_then(|c| c.as_str())
            .unwrap_or(driver_name.as_str())
            .to_string();

        match driver.send(&message, &config).await {
            Ok(receipt) => {
                result.notifications_sent = 1;
                result.deliveries.push(Delivery {
                    driver: driver_name,
                    channel,
                    status: receipt.status,
                    provider_id: receipt.message_id,
                });
            }
            Err(e) => {
                result.notifications_failed = 1;
                result.deliveries.push(Delivery {
                    driver: driver_name,
                    channel,
                    status: "failed".to_string(),
                    provider_id: None,
                });
                result.errors.push(format!("Notify error: {:#}", e));
            }
        }

        result
    }
}

/// Render the notification from the analyze output.
///
/// Severity follows the highest recommendation priority; the body lists the
/// top recommendations by priority.
pub fn render_message(ctx: &StageContext, analysis: &AnalyzeResult) -> NotificationMessage {
    let severity = analysis
        .top_priority()
        .map(|p| p.severity())
        .unwrap_or("info")
        .to_string();

    let mut ranked: Vec<_> = analysis.recommendations.iter().collect();
    ranked.sort_by(|a, b| b.priority.cmp(&a.priority));
    let top: Vec<_> = ranked.into_iter().take(TOP_RECOMMENDATIONS).collect();

    let subject = match ctx.incident_id {
        Some(id) => format!("Incident #{}", id),
        None => format!("Alert {}", ctx.alert_fingerprint),
    };
    let title = match top.first() {
        Some(rec) => format!("[{}] {}: {}", severity.to_ascii_uppercase(), subject, rec.title),
        None => format!("[{}] {}", severity.to_ascii_uppercase(), subject),
    };

    let mut lines: Vec<String> = top
        .iter()
        .map(|rec| {
            if rec.description.is_empty() {
                format!("- {}", rec.title)
            } else {
                format!("- {}: {}", rec.title, rec.description)
            }
        })
        .collect();
    if analysis.fallback_used {
        lines.push("Automated analysis unavailable; manual investigation required.".to_string());
    }
    lines.push(format!("environment={} source={} trace_id={}", ctx.environment, ctx.source, ctx.trace_id));

    NotificationMessage {
        title,
        body: lines.join("\n"),
        severity,
        incident_id: ctx.incident_id,
        trace_id: ctx.trace_id.clone(),
        run_id: ctx.run_id.clone(),
    }
}

#[async_trait]
impl StageExecutor for NotifyExecutor {
    fn stage(&self) -> Stage {
        Stage::Notify
    }

    fn name(&self) -> &str {
        "notify"
    }

    async fn execute(&self, ctx: StageContext) -> StageOutput {
        let start = Instant::now();
        let mut result = self.notify(&ctx).await;
        result.duration_ms = start.elapsed().as_millis() as u64;
        StageOutput::Notify(result)
    }
}
