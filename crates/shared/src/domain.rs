use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

macro_rules! key_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

// Backend row identity. Never used to address a session from the client.
id_newtype!(SessionRowId);
id_newtype!(MessageId);
id_newtype!(TemplateId);
id_newtype!(DraftId);

// Externally addressable session key used in every URL and API call.
key_newtype!(PublicId);
key_newtype!(EvidenceId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Won,
    Lost,
    Closed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Won => "WON",
            SessionStatus::Lost => "LOST",
            SessionStatus::Closed => "CLOSED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageRole {
    Player,
    System,
    Suspect,
}

/// Stage of a remote case-generation job as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationStatus {
    #[default]
    Idle,
    DraftingStory,
    RenderingImages,
    Complete,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Idle => "idle",
            GenerationStatus::DraftingStory => "drafting-story",
            GenerationStatus::RenderingImages => "rendering-images",
            GenerationStatus::Complete => "complete",
            GenerationStatus::Failed => "failed",
        }
    }

    /// Maps a progress stage tag from the push stream. Only in-flight stages
    /// are accepted; terminal states arrive as their own events.
    pub fn from_stage(stage: &str) -> Option<Self> {
        match stage {
            "drafting-story" => Some(GenerationStatus::DraftingStory),
            "rendering-images" => Some(GenerationStatus::RenderingImages),
            _ => None,
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
