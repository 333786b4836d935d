use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry in the append-only notice log exchanged between components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    /// Row id, 0 until appended.
    pub id: i64,
    /// Component that appended the notice.
    pub sender: String,
    /// `None` broadcasts to every recipient.
    pub recipient: Option<String>,
    /// Short machine-readable kind, e.g. `plan_created`.
    pub kind: String,
    /// Free-form body.
    pub text: String,
    /// Task key the notice refers to, if any.
    pub reference_key: Option<String>,
    /// When the notice was created.
    pub created_at: DateTime<Utc>,
}

impl Notice {
    /// A broadcast notice.
    pub fn broadcast(sender: impl Into<String>, kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: 0,
            sender: sender.into(),
            recipient: None,
            kind: kind.into(),
            text: text.into(),
            reference_key: None,
            created_at: Utc::now(),
        }
    }

    /// Address the notice to a single recipient.
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Reference a task by key.
    pub fn about(mut self, key: impl Into<String>) -> Self {
        self.reference_key = Some(key.into());
        self
    }

    /// Whether every recipient sees it.
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_and_addressed() {
        let notice = Notice::broadcast("manager", "plan_created", "3 subtasks");
        assert!(notice.is_broadcast());
        let notice = notice.to("coder").about("TASK-0001");
        assert!(!notice.is_broadcast());
        assert_eq!(notice.reference_key.as_deref(), Some("TASK-0001"));
    }
}
