use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Step {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub step_order: i32,
    pub step_type: String,
    pub title: Option<String>,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn kind(&self) -> Option<StepType> {
        StepType::parse(&self.step_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    LeadGeneration,
    LinkedinVisit,
    LinkedinConnect,
    LinkedinMessage,
    LinkedinFollow,
    EmailSend,
    EmailFollowup,
    WhatsappSend,
    InstagramDm,
    VoiceAgentCall,
    Delay,
    Condition,
    Start,
    End,
}

impl StepType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lead_generation" => Some(StepType::LeadGeneration),
            "linkedin_visit" => Some(StepType::LinkedinVisit),
            "linkedin_connect" => Some(StepType::LinkedinConnect),
            "linkedin_message" => Some(StepType::LinkedinMessage),
            "linkedin_follow" => Some(StepType::LinkedinFollow),
            "email_send" => Some(StepType::EmailSend),
            "email_followup" => Some(StepType::EmailFollowup),
            "whatsapp_send" => Some(StepType::WhatsappSend),
            "instagram_dm" => Some(StepType::InstagramDm),
            "voice_agent_call" => Some(StepType::VoiceAgentCall),
            "delay" => Some(StepType::Delay),
            "condition" => Some(StepType::Condition),
            "start" => Some(StepType::Start),
            "end" => Some(StepType::End),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::LeadGeneration => "lead_generation",
            StepType::LinkedinVisit => "linkedin_visit",
            StepType::LinkedinConnect => "linkedin_connect",
            StepType::LinkedinMessage => "linkedin_message",
            StepType::LinkedinFollow => "linkedin_follow",
            StepType::EmailSend => "email_send",
            StepType::EmailFollowup => "email_followup",
            StepType::WhatsappSend => "whatsapp_send",
            StepType::InstagramDm => "instagram_dm",
            StepType::VoiceAgentCall => "voice_agent_call",
            StepType::Delay => "delay",
            StepType::Condition => "condition",
            StepType::Start => "start",
            StepType::End => "end",
        }
    }

    pub fn is_linkedin(&self) -> bool {
        matches!(
            self,
            StepType::LinkedinVisit
                | StepType::LinkedinConnect
                | StepType::LinkedinMessage
                | StepType::LinkedinFollow
        )
    }

    /// Synthetic no-op markers around the workflow.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, StepType::Start | StepType::End)
    }

    /// Flow-control steps handled by the workflow driver, never dispatched.
    pub fn is_gate(&self) -> bool {
        matches!(self, StepType::Delay | StepType::Condition)
    }

    pub fn channel(&self) -> &'static str {
        match self {
            StepType::LinkedinVisit
            | StepType::LinkedinConnect
            | StepType::LinkedinMessage
            | StepType::LinkedinFollow => "linkedin",
            StepType::EmailSend | StepType::EmailFollowup => "email",
            StepType::WhatsappSend => "whatsapp",
            StepType::InstagramDm => "instagram",
            StepType::VoiceAgentCall => "voice",
            _ => "system",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplaceStepsRequest {
    pub steps: Vec<StepInput>,
}

#[derive(Debug, Deserialize)]
pub struct StepInput {
    #[serde(rename = "order")]
    pub step_order: i32,
    #[serde(rename = "type")]
    pub step_type: String,
    pub title: Option<String>,
    #[serde(default = "empty_config")]
    pub config: serde_json::Value,
}

fn empty_config() -> serde_json::Value {
    serde_json::json!({})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for s in [
            "lead_generation", "linkedin_visit", "linkedin_connect", "linkedin_message",
            "linkedin_follow", "email_send", "email_followup", "whatsapp_send",
            "instagram_dm", "voice_agent_call", "delay", "condition", "start", "end",
        ] {
            assert_eq!(StepType::parse(s).unwrap().as_str(), s);
        }
        assert!(StepType::parse("telegram_send").is_none());
    }

    #[test]
    fn test_channel_classification() {
        assert_eq!(StepType::LinkedinConnect.channel(), "linkedin");
        assert_eq!(StepType::EmailFollowup.channel(), "email");
        assert_eq!(StepType::Delay.channel(), "system");
        assert!(StepType::Start.is_synthetic());
        assert!(StepType::Condition.is_gate());
        assert!(!StepType::LinkedinFollow.is_gate());
    }
}
