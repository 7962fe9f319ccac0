use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    DraftId, EvidenceId, MessageId, MessageRole, PublicId, SessionRowId, SessionStatus,
    TemplateId,
};

/// Where a new session's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceSelection {
    Template {
        #[serde(rename = "templateId")]
        template_id: TemplateId,
    },
    Draft {
        #[serde(rename = "draftId")]
        draft_id: DraftId,
    },
    Prompt {
        prompt: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clock {
    pub start_hour: u32,
    pub end_hour: u32,
    pub minutes_used: u32,
}

impl Clock {
    pub fn total_minutes(&self) -> u32 {
        self.end_hour.saturating_sub(self.start_hour).saturating_mul(60)
    }

    pub fn remaining_minutes(&self) -> u32 {
        self.total_minutes().saturating_sub(self.minutes_used)
    }

    /// In-fiction wall clock, e.g. `17:30`.
    pub fn current_time(&self) -> String {
        let elapsed = self
            .start_hour
            .saturating_mul(60)
            .saturating_add(self.minutes_used.min(self.total_minutes()));
        format!("{:02}:{:02}", elapsed / 60, elapsed % 60)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionBudget {
    pub limit: u32,
    pub used: u32,
}

impl QuestionBudget {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub id: EvidenceId,
    pub title: String,
    #[serde(default)]
    pub detail: String,
    pub discovered_at: DateTime<Utc>,
}

/// Authoritative snapshot of one investigation as served by `GET /sessions/{publicId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionRowId,
    pub public_id: PublicId,
    #[serde(default)]
    pub title: Option<String>,
    pub status: SessionStatus,
    pub clock: Clock,
    pub question_budget: QuestionBudget,
    #[serde(default)]
    pub current_location: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    /// Server-authored scenario content. Kept opaque here; see the client's
    /// topology resolver for the parts that are interpreted.
    #[serde(default)]
    pub narrative_payload: serde_json::Value,
}

impl Session {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn has_evidence(&self, id: &EvidenceId) -> bool {
        self.evidence.iter().any(|item| &item.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub question: String,
    pub suspect_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAck {
    #[serde(default)]
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequest {
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveResult {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub minutes_spent: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestigateResult {
    #[serde(default)]
    pub evidence_found: Vec<Evidence>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuseRequest {
    pub suspect_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccusationResult {
    pub correct: bool,
    pub actual_killer: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub key_clues: Vec<String>,
    pub status: SessionStatus,
}

/// Answer to `POST /sessions:async`. The generator addresses the job by the
/// public id of the session it will produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    #[serde(alias = "jobId")]
    pub public_id: PublicId,
}

/// One frame of the generation push stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum GenerationStreamEvent {
    Progress {
        stage: String,
        #[serde(default)]
        message: Option<String>,
    },
    Complete {
        #[serde(rename = "publicId", alias = "jobId")]
        public_id: PublicId,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_minutes_counts_down_from_window() {
        let mut clock = Clock {
            start_hour: 12,
            end_hour: 18,
            minutes_used: 330,
        };
        assert_eq!(clock.remaining_minutes(), 30);
        assert_eq!(clock.current_time(), "17:30");

        clock.minutes_used += 15;
        assert_eq!(clock.remaining_minutes(), 15);
    }

    #[test]
    fn remaining_minutes_floors_at_zero() {
        let clock = Clock {
            start_hour: 20,
            end_hour: 22,
            minutes_used: 500,
        };
        assert_eq!(clock.remaining_minutes(), 0);
        assert_eq!(clock.current_time(), "22:00");
    }

    #[test]
    fn oversized_hours_saturate_instead_of_overflowing() {
        let clock = Clock {
            start_hour: u32::MAX - 1,
            end_hour: u32::MAX,
            minutes_used: 10,
        };
        assert_eq!(clock.total_minutes(), 60);
        assert_eq!(clock.remaining_minutes(), 50);
        let wide = Clock {
            start_hour: 0,
            end_hour: u32::MAX,
            minutes_used: 0,
        };
        assert_eq!(wide.total_minutes(), u32::MAX);
        assert!(!wide.current_time().is_empty());
    }

    #[test]
    fn question_budget_reports_exhaustion() {
        let budget = QuestionBudget { limit: 3, used: 3 };
        assert!(budget.is_exhausted());
        assert_eq!(QuestionBudget { limit: 3, used: 1 }.remaining(), 2);
    }

    #[test]
    fn stream_events_use_event_and_data_envelope() {
        let progress: GenerationStreamEvent = serde_json::from_str(
            r#"{"event":"progress","data":{"stage":"rendering-images","message":"painting"}}"#,
        )
        .expect("progress");
        assert_eq!(
            progress,
            GenerationStreamEvent::Progress {
                stage: "rendering-images".into(),
                message: Some("painting".into()),
            }
        );

        let complete: GenerationStreamEvent =
            serde_json::from_str(r#"{"event":"complete","data":{"publicId":"abc"}}"#)
                .expect("complete");
        assert_eq!(
            complete,
            GenerationStreamEvent::Complete {
                public_id: PublicId::new("abc"),
            }
        );
    }

    #[test]
    fn source_selection_is_tagged_by_source() {
        let body = serde_json::to_value(SourceSelection::Template {
            template_id: TemplateId(4),
        })
        .expect("serialize");
        assert_eq!(body, serde_json::json!({"source": "template", "templateId": 4}));
    }
}
