use crate::error::MessagingError;

/// Domain events the replica consumer knows how to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserEvent {
    Created,
    Updated,
    Deleted,
}

impl UserEvent {
    pub const ALL: [UserEvent; 3] = [UserEvent::Created, UserEvent::Updated, UserEvent::Deleted];
}

/// Configured routing key for each `UserEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKeys {
    pub created: String,
    pub updated: String,
    pub deleted: String,
}

impl Default for RoutingKeys {
    fn default() -> Self {
        Self {
            created: "user.created".to_string(),
            updated: "user.updated".to_string(),
            deleted: "user.deleted".to_string(),
        }
    }
}

impl RoutingKeys {
    pub fn key_for(&self, event: UserEvent) -> &str {
        match event {
            UserEvent::Created => &self.created,
            UserEvent::Updated => &self.updated,
            UserEvent::Deleted => &self.deleted,
        }
    }

    pub fn resolve(&self, routing_key: &str) -> Result<UserEvent, MessagingError> {
        UserEvent::ALL
            .into_iter()
            .find(|event| self.key_for(*event) == routing_key)
            .ok_or_else(|| MessagingError::UnknownRoutingKey(routing_key.to_string()))
    }

    /// Every recognized key must be deliverable through `pattern`.
    pub fn covered_by(&self, pattern: &str) -> bool {
        UserEvent::ALL
            .into_iter()
            .all(|event| topic_matches(pattern, self.key_for(event)))
    }
}

/// Non-empty, dot-delimited, no empty words.
pub fn validate_routing_key(routing_key: &str) -> Result<(), MessagingError> {
    if routing_key.is_empty() || routing_key.split('.').any(str::is_empty) {
        return Err(MessagingError::InvalidRoutingKey(routing_key.to_string()));
    }

    Ok(())
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some(_), None) | (None, Some(_)) => false,
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) => p == k && match_words(&pattern[1..], &key[1..]),
    }
}
