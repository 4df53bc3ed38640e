use uuid::Uuid;

/// Source of identifiers for outbound events
pub trait IdGenerator: Send + Sync {
    fn message_id(&self) -> String;

    fn dialog_request_id(&self) -> String;
}

/// Random v4 UUIDs; the production default
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn message_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn dialog_request_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Always returns the same identifiers, for reproducible fixtures
#[derive(Debug, Clone, Default)]
pub struct FixedIds {
    pub message_id: String,
    pub dialog_request_id: String,
}

impl FixedIds {
    pub fn new(message_id: &str, dialog_request_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            dialog_request_id: dialog_request_id.to_string(),
        }
    }
}

impl IdGenerator for FixedIds {
    fn message_id(&self) -> String {
        self.message_id.clone()
    }

    fn dialog_request_id(&self) -> String {
        self.dialog_request_id.clone()
    }
}
