//! One-line JSON operational events routed through the `log` facade.

use serde_json::{json, Value};

fn render(component: &str, event: &str, details: Value) -> String {
    json!({
        "component": component,
        "event": event,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "details": details,
    })
    .to_string()
}

pub fn log_info(component: &str, event: &str, details: Value) {
    log::info!("{}", render(component, event, details));
}

pub fn log_warn(component: &str, event: &str, details: Value) {
    log::warn!("{}", render(component, event, details));
}

pub fn log_error(component: &str, event: &str, details: Value) {
    log::error!("{}", render(component, event, details));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_event_is_single_line_json() {
        let line = render("feeder", "tick_completed", json!({"records": 3}));
        assert!(!line.contains('\n'));
        let value: Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(value["component"], "feeder");
        assert_eq!(value["event"], "tick_completed");
        assert_eq!(value["details"]["records"], 3);
        assert!(value["timestamp"].is_string());
    }
}
