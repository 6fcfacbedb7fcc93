//! Correlation keys.
//!
//! An [`Identifier`] is a partially-populated set of scope values. It is used
//! in two roles:
//!
//! - as the **pattern** of an expectation, where every unpopulated field is a
//!   wildcard;
//! - as the **scope** of an event, describing which chat, user and message
//!   the event belongs to.
//!
//! ```rust,ignore
//! use tether_core::Identifier;
//!
//! let pattern = Identifier::chat(42).with_message(7);
//! let scope = Identifier::chat(42).with_user(1).with_message(7);
//!
//! assert!(pattern.matches(&scope));
//! assert_eq!(pattern.specificity(), 2);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// An immutable correlation key with optional scope fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chat_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_message_id: Option<String>,
}

impl Identifier {
    /// Creates an identifier with every field populated as given.
    pub fn new(
        chat_id: Option<i64>,
        user_id: Option<i64>,
        message_id: Option<i64>,
        inline_message_id: Option<String>,
    ) -> Self {
        Self {
            chat_id,
            user_id,
            message_id,
            inline_message_id,
        }
    }

    /// Creates an identifier with no populated fields.
    ///
    /// As a pattern it matches every event of its kind.
    pub fn any() -> Self {
        Self::default()
    }

    /// Creates an identifier scoped to a chat.
    pub fn chat(chat_id: i64) -> Self {
        Self::any().with_chat(chat_id)
    }

    /// Creates an identifier scoped to a user.
    pub fn user(user_id: i64) -> Self {
        Self::any().with_user(user_id)
    }

    /// Creates an identifier scoped to an inline message.
    pub fn inline_message(inline_message_id: impl Into<String>) -> Self {
        Self::any().with_inline_message(inline_message_id)
    }

    /// Returns a copy with the chat scope set.
    pub fn with_chat(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    /// Returns a copy with the user scope set.
    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Returns a copy with the message scope set.
    pub fn with_message(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Returns a copy with the inline message scope set.
    pub fn with_inline_message(mut self, inline_message_id: impl Into<String>) -> Self {
        self.inline_message_id = Some(inline_message_id.into());
        self
    }

    /// Returns the chat scope.
    pub fn chat_id(&self) -> Option<i64> {
        self.chat_id
    }

    /// Returns the user scope.
    pub fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    /// Returns the message scope.
    pub fn message_id(&self) -> Option<i64> {
        self.message_id
    }

    /// Returns the inline message scope.
    pub fn inline_message_id(&self) -> Option<&str> {
        self.inline_message_id.as_deref()
    }

    /// Returns `true` if every populated field of `self` equals the
    /// corresponding field of `scope`.
    ///
    /// Unpopulated fields of `self` are ignored. A populated field never
    /// matches an unpopulated field of `scope`.
    pub fn matches(&self, scope: &Identifier) -> bool {
        fn field<T: PartialEq + ?Sized>(pattern: Option<&T>, value: Option<&T>) -> bool {
            match pattern {
                Some(expected) => value == Some(expected),
                None => true,
            }
        }

        field(self.chat_id.as_ref(), scope.chat_id.as_ref())
            && field(self.user_id.as_ref(), scope.user_id.as_ref())
            && field(self.message_id.as_ref(), scope.message_id.as_ref())
            && field(
                self.inline_message_id.as_deref(),
                scope.inline_message_id.as_deref(),
            )
    }

    /// Returns the number of populated fields.
    ///
    /// Higher means narrower. Only used to rank expectations that already
    /// match, never to filter them.
    pub fn specificity(&self) -> usize {
        [
            self.chat_id.is_some(),
            self.user_id.is_some(),
            self.message_id.is_some(),
            self.inline_message_id.is_some(),
        ]
        .into_iter()
        .filter(|populated| *populated)
        .count()
    }

    /// Returns `true` if no field is populated.
    pub fn is_wildcard(&self) -> bool {
        self.specificity() == 0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            return f.write_str("*");
        }

        let mut parts = Vec::with_capacity(4);
        if let Some(chat) = self.chat_id {
            parts.push(format!("chat={chat}"));
        }
        if let Some(user) = self.user_id {
            parts.push(format!("user={user}"));
        }
        if let Some(message) = self.message_id {
            parts.push(format!("message={message}"));
        }
        if let Some(inline) = &self.inline_message_id {
            parts.push(format!("inline={inline}"));
        }
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_everything() {
        let pattern = Identifier::any();
        assert!(pattern.is_wildcard());
        assert_eq!(pattern.specificity(), 0);
        assert!(pattern.matches(&Identifier::any()));
        assert!(pattern.matches(&Identifier::chat(1).with_user(2).with_message(3)));
        assert!(pattern.matches(&Identifier::inline_message("abc")));
    }

    #[test]
    fn test_populated_fields_must_be_equal() {
        let pattern = Identifier::chat(42).with_message(7);
        assert!(pattern.matches(&Identifier::chat(42).with_message(7)));
        assert!(pattern.matches(&Identifier::chat(42).with_user(5).with_message(7)));
        assert!(!pattern.matches(&Identifier::chat(42).with_message(8)));
        assert!(!pattern.matches(&Identifier::chat(43).with_message(7)));
    }

    #[test]
    fn test_missing_scope_field_does_not_match() {
        let pattern = Identifier::chat(42);
        assert!(!pattern.matches(&Identifier::user(1)));
        assert!(!Identifier::inline_message("a").matches(&Identifier::chat(42)));
    }

    #[test]
    fn test_specificity_counts_populated_fields() {
        assert_eq!(Identifier::chat(1).specificity(), 1);
        assert_eq!(Identifier::chat(1).with_user(2).specificity(), 2);
        assert_eq!(
            Identifier::new(Some(1), Some(2), Some(3), Some("x".into())).specificity(),
            4
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Identifier::any().to_string(), "*");
        assert_eq!(
            Identifier::chat(5).with_message(9).to_string(),
            "chat=5,message=9"
        );
    }

    #[test]
    fn test_serde_skips_unpopulated() {
        let json = serde_json::to_value(Identifier::user(3)).unwrap();
        assert_eq!(json, serde_json::json!({ "user_id": 3 }));

        let back: Identifier = serde_json::from_value(json).unwrap();
        assert_eq!(back, Identifier::user(3));
    }
}
