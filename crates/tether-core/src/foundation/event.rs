//! Event system for the Tether correlation core.
//!
//! The core never decodes transport payloads itself. Whatever the transport
//! produces only has to implement [`Event`], which exposes:
//!
//! - the [`EventKind`] used to pick a registry partition,
//! - the correlation scope (chat, user, message, inline message) as an
//!   [`Identifier`],
//! - `Any` access so predicates and listeners can downcast to the concrete
//!   payload type.
//!
//! Events travel through the core as [`BoxedEvent`], a cheap-to-clone
//! `Arc<dyn Event>` wrapper.
//!
//! ```rust,ignore
//! use tether_core::{BoxedEvent, EventKind, Identifier, RawEvent};
//!
//! let event = BoxedEvent::new(
//!     RawEvent::message(Identifier::chat(42).with_user(7))
//!         .with_payload(serde_json::json!({ "text": "hello" })),
//! );
//! assert_eq!(event.kind(), EventKind::Message);
//! ```

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::identifier::Identifier;

// ============================================================================
// Event Kind
// ============================================================================

/// Category of an incoming event.
///
/// Expectations are always registered for exactly one kind, and an event is
/// only ever matched against expectations of its own kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An incoming chat message.
    Message,
    /// A callback query produced by pressing an inline keyboard button.
    CallbackQuery,
}

impl EventKind {
    /// All event kinds, in declaration order.
    pub const ALL: [EventKind; 2] = [EventKind::Message, EventKind::CallbackQuery];

    /// Returns the canonical lowercase name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::CallbackQuery => "callback_query",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "message" => Ok(Self::Message),
            "callback_query" | "callback" => Ok(Self::CallbackQuery),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Core Event Trait
// ============================================================================

/// A decoded event handed to the correlation core by the transport layer.
///
/// Implementors are usually the transport's own update types. The core only
/// reads the kind and the correlation scope; everything else stays opaque and
/// is reachable through [`as_any`](Event::as_any) for predicates.
pub trait Event: Any + Send + Sync {
    /// Returns the kind of this event.
    fn kind(&self) -> EventKind;

    /// Returns the correlation fields carried by this event.
    ///
    /// Fields the event does not have (e.g. the chat of a callback query on
    /// an inline message) are left unpopulated.
    fn scope(&self) -> Identifier;

    /// Returns a reference to self as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns the raw JSON payload of this event, if it kept one.
    fn raw_json(&self) -> Option<&Value> {
        None
    }
}

// ============================================================================
// Boxed Event
// ============================================================================

/// A type-erased, reference-counted event.
///
/// `BoxedEvent` derefs to `dyn Event`, so trait methods can be called
/// directly:
///
/// ```rust,ignore
/// let kind = event.kind();
/// let chat = event.scope().chat_id();
/// ```
#[derive(Clone)]
pub struct BoxedEvent {
    inner: Arc<dyn Event>,
}

impl BoxedEvent {
    /// Creates a new `BoxedEvent` from any type implementing `Event`.
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            inner: Arc::new(event),
        }
    }

    /// Returns the inner `Arc<dyn Event>`.
    pub fn inner(&self) -> &Arc<dyn Event> {
        &self.inner
    }

    /// Attempts to downcast to a concrete event type.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.inner.as_any().downcast_ref()
    }

    /// Returns `true` if both handles point at the same event.
    pub fn ptr_eq(&self, other: &BoxedEvent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::ops::Deref for BoxedEvent {
    type Target = dyn Event;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for BoxedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxedEvent")
            .field("kind", &self.kind())
            .field("scope", &self.scope())
            .finish()
    }
}

// ============================================================================
// Raw Event
// ============================================================================

/// A generic event for transports that decode updates into JSON.
///
/// The correlation scope is stored explicitly; the rest of the update is kept
/// as a JSON payload that predicates can inspect.
///
/// ```json
/// { "kind": "message", "scope": { "chat_id": 42, "user_id": 7 }, "payload": { "text": "hi" } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    kind: EventKind,
    #[serde(default)]
    scope: Identifier,
    #[serde(default)]
    payload: Value,
}

impl RawEvent {
    /// Creates a raw event with an empty payload.
    pub fn new(kind: EventKind, scope: Identifier) -> Self {
        Self {
            kind,
            scope,
            payload: Value::Null,
        }
    }

    /// Creates a message event.
    pub fn message(scope: Identifier) -> Self {
        Self::new(EventKind::Message, scope)
    }

    /// Creates a callback query event.
    pub fn callback_query(scope: Identifier) -> Self {
        Self::new(EventKind::CallbackQuery, scope)
    }

    /// Attaches a JSON payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Returns the JSON payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns the payload's `text` field, if it is a string.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(Value::as_str)
    }
}

impl Event for RawEvent {
    fn kind(&self) -> EventKind {
        self.kind
    }

    fn scope(&self) -> Identifier {
        self.scope.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn raw_json(&self) -> Option<&Value> {
        Some(&self.payload)
    }
}
