use chrono::Duration;
use serde_json::Value;

use crate::models::lead::LeadSnapshot;
use crate::models::step::{Step, StepType};

#[derive(Debug, Clone, PartialEq)]
pub struct StepValidation {
    pub valid: bool,
    pub error: Option<String>,
    pub missing_fields: Vec<String>,
}

impl StepValidation {
    fn ok() -> Self {
        Self { valid: true, error: None, missing_fields: Vec::new() }
    }

    fn missing(step_type: StepType, fields: Vec<String>) -> Self {
        Self {
            error: Some(format!(
                "Step {} is missing required fields: {}",
                step_type,
                fields.join(", ")
            )),
            valid: false,
            missing_fields: fields,
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self { valid: false, error: Some(message.into()), missing_fields: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    Connected,
    Replied,
    Opened,
}

impl ConditionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(ConditionType::Connected),
            "replied" => Some(ConditionType::Replied),
            "opened" => Some(ConditionType::Opened),
            _ => None,
        }
    }
}

/// A config field counts as present iff it is a non-empty trimmed string,
/// a non-empty array, or a real (non-NaN) number.
fn field_present(config: &Value, key: &str) -> bool {
    match config.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| !f.is_nan()),
        Some(Value::Bool(_)) | Some(Value::Object(_)) => true,
    }
}

fn positive_number(config: &Value, key: &str) -> bool {
    config
        .get(key)
        .and_then(|v| v.as_f64())
        .map_or(false, |n| !n.is_nan() && n > 0.0)
}

pub fn validate_step(step: &Step) -> StepValidation {
    let kind = match step.kind() {
        Some(kind) => kind,
        None => return StepValidation::invalid(format!("Unknown step type {}", step.step_type)),
    };

    let config = &step.config;
    match kind {
        StepType::LinkedinMessage => require(kind, config, &["message"]),
        StepType::EmailSend | StepType::EmailFollowup => require(kind, config, &["subject", "body"]),
        StepType::WhatsappSend => require(kind, config, &["whatsappMessage"]),
        StepType::InstagramDm => require(kind, config, &["instagramUsername", "instagramDmMessage"]),
        StepType::VoiceAgentCall => {
            let mut missing = Vec::new();
            if !field_present(config, "voiceAgentId") {
                missing.push("voiceAgentId".to_string());
            }
            if !field_present(config, "voiceContext") && !field_present(config, "added_context") {
                missing.push("voiceContext".to_string());
            }
            if missing.is_empty() {
                StepValidation::ok()
            } else {
                StepValidation::missing(kind, missing)
            }
        }
        StepType::Delay => {
            if delay_duration(config).is_some() {
                StepValidation::ok()
            } else {
                StepValidation::invalid(
                    "Delay step needs at least one of delayDays, delayHours, delayMinutes > 0",
                )
            }
        }
        StepType::Condition => {
            let condition = config.get("conditionType").and_then(|v| v.as_str());
            match condition.and_then(ConditionType::parse) {
                Some(_) => StepValidation::ok(),
                None => StepValidation::invalid(format!(
                    "Condition step needs conditionType in connected|replied|opened, got {:?}",
                    condition
                )),
            }
        }
        StepType::LeadGeneration => {
            let filters = config.get("leadGenerationFilters").unwrap_or(&Value::Null);
            let has_filters = field_present(filters, "roles")
                || field_present(filters, "industries")
                || field_present(filters, "location");
            let has_limit =
                positive_number(config, "leadGenerationLimit") || positive_number(config, "leads_per_day");
            if has_filters || has_limit {
                StepValidation::ok()
            } else {
                StepValidation::invalid(
                    "Lead generation needs non-empty filters or an explicit daily limit",
                )
            }
        }
        // Connect message is optional; visit/follow/start/end carry no config.
        _ => StepValidation::ok(),
    }
}

fn require(kind: StepType, config: &Value, fields: &[&str]) -> StepValidation {
    let missing: Vec<String> = fields
        .iter()
        .filter(|f| !field_present(config, f))
        .map(|f| f.to_string())
        .collect();
    if missing.is_empty() {
        StepValidation::ok()
    } else {
        StepValidation::missing(kind, missing)
    }
}

/// Total wait carried by a delay step, None when degenerate.
pub fn delay_duration(config: &Value) -> Option<Duration> {
    let days = config.get("delayDays").and_then(|v| v.as_i64()).unwrap_or(0);
    let hours = config.get("delayHours").and_then(|v| v.as_i64()).unwrap_or(0);
    let minutes = config.get("delayMinutes").and_then(|v| v.as_i64()).unwrap_or(0);
    if days <= 0 && hours <= 0 && minutes <= 0 {
        return None;
    }
    Some(
        Duration::days(days.max(0))
            + Duration::hours(hours.max(0))
            + Duration::minutes(minutes.max(0)),
    )
}

const TEMPLATE_TOKENS: [(&str, fn(&LeadSnapshot) -> Option<&String>); 6] = [
    ("first_name", |s| s.first_name.as_ref()),
    ("last_name", |s| s.last_name.as_ref()),
    ("title", |s| s.title.as_ref()),
    ("company_name", |s| s.company_name.as_ref()),
    ("company", |s| s.company_name.as_ref()),
    ("industry", |s| s.industry.as_ref()),
];

/// Substitute `{{token}}` placeholders from the lead snapshot. Unresolved
/// tokens render as empty string rather than leaking braces to prospects.
pub fn substitute_variables(text: &str, snapshot: &LeadSnapshot) -> String {
    let mut out = text.to_string();
    for (token, getter) in TEMPLATE_TOKENS {
        let needle = format!("{{{{{}}}}}", token);
        if out.contains(&needle) {
            let value = getter(snapshot).map(|s| s.as_str()).unwrap_or("");
            out = out.replace(&needle, value);
        }
    }
    // Anything left in braces was an unknown token.
    if out.contains("{{") {
        let re = regex::Regex::new(r"\{\{\s*[\w.]+\s*\}\}").unwrap();
        out = re.replace_all(&out, "").to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn step(step_type: &str, config: serde_json::Value) -> Step {
        Step {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            step_order: 1,
            step_type: step_type.to_string(),
            title: None,
            config,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_connect_message_is_optional() {
        assert!(validate_step(&step("linkedin_connect", serde_json::json!({}))).valid);
    }

    #[test]
    fn test_message_step_requires_message() {
        let v = validate_step(&step("linkedin_message", serde_json::json!({"message": "  "})));
        assert!(!v.valid);
        assert_eq!(v.missing_fields, vec!["message"]);

        assert!(validate_step(&step("linkedin_message", serde_json::json!({"message": "hi"}))).valid);
    }

    #[test]
    fn test_email_requires_subject_and_body() {
        let v = validate_step(&step("email_send", serde_json::json!({"subject": "Hello"})));
        assert!(!v.valid);
        assert_eq!(v.missing_fields, vec!["body"]);
    }

    #[test]
    fn test_voice_call_accepts_either_context_key() {
        let base = serde_json::json!({"voiceAgentId": "agent-1", "added_context": "notes"});
        assert!(validate_step(&step("voice_agent_call", base)).valid);

        let v = validate_step(&step("voice_agent_call", serde_json::json!({"voiceAgentId": "a"})));
        assert!(!v.valid);
        assert_eq!(v.missing_fields, vec!["voiceContext"]);
    }

    #[test]
    fn test_instagram_requires_both_fields() {
        let v = validate_step(&step("instagram_dm", serde_json::json!({})));
        assert_eq!(v.missing_fields, vec!["instagramUsername", "instagramDmMessage"]);
    }

    #[test]
    fn test_delay_requires_positive_component() {
        assert!(!validate_step(&step("delay", serde_json::json!({"delayDays": 0}))).valid);
        assert!(validate_step(&step("delay", serde_json::json!({"delayHours": 2}))).valid);
        assert_eq!(
            delay_duration(&serde_json::json!({"delayDays": 1, "delayMinutes": 30})),
            Some(Duration::days(1) + Duration::minutes(30))
        );
        assert_eq!(delay_duration(&serde_json::json!({"delayDays": -1})), None);
    }

    #[test]
    fn test_condition_type_vocabulary() {
        assert!(validate_step(&step("condition", serde_json::json!({"conditionType": "replied"}))).valid);
        assert!(!validate_step(&step("condition", serde_json::json!({"conditionType": "clicked"}))).valid);
        assert!(!validate_step(&step("condition", serde_json::json!({}))).valid);
    }

    #[test]
    fn test_lead_generation_filters_or_limit() {
        let filters = serde_json::json!({"leadGenerationFilters": {"roles": ["CTO"]}});
        assert!(validate_step(&step("lead_generation", filters)).valid);

        let limit = serde_json::json!({"leadGenerationLimit": 25});
        assert!(validate_step(&step("lead_generation", limit)).valid);

        let empty = serde_json::json!({"leadGenerationFilters": {"roles": []}});
        assert!(!validate_step(&step("lead_generation", empty)).valid);
    }

    #[test]
    fn test_unknown_step_type_is_invalid() {
        assert!(!validate_step(&step("carrier_pigeon", serde_json::json!({}))).valid);
    }

    #[test]
    fn test_substitution_resolves_known_tokens() {
        let snapshot = LeadSnapshot {
            first_name: Some("Alice".into()),
            company_name: Some("Acme".into()),
            ..Default::default()
        };
        let out = substitute_variables("Hi {{first_name}} at {{company}} ({{company_name}})", &snapshot);
        assert_eq!(out, "Hi Alice at Acme (Acme)");
    }

    #[test]
    fn test_substitution_blanks_unresolved_tokens() {
        let snapshot = LeadSnapshot::default();
        assert_eq!(
            substitute_variables("Hi {{first_name}}, re {{nickname}}!", &snapshot),
            "Hi , re !"
        );
    }
}
