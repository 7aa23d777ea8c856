use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(ProjectId);
string_id!(ConversationId);
string_id!(UserId);
string_id!(MessageId);

/// Conversations are keyed by the project they belong to.
impl From<&ProjectId> for ConversationId {
    fn from(project_id: &ProjectId) -> Self {
        Self(project_id.0.clone())
    }
}

const PROVISIONAL_PREFIX: &str = "temp-";

impl MessageId {
    /// Locally generated id for a message that has not been confirmed by the
    /// server yet. The uuid fragment keeps concurrent sends from colliding
    /// within the same millisecond.
    pub fn provisional(created_at: DateTime<Utc>) -> Self {
        let fragment = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{PROVISIONAL_PREFIX}{}-{}",
            created_at.timestamp_millis(),
            &fragment[..8]
        ))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }
}
