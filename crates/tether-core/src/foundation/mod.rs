//! Foundation layer - Core abstractions and type system.
//!
//! This module contains the value types everything else is built on:
//! - Event system for type-erased event passing
//! - Identifiers used both as expectation patterns and event scopes

pub mod event;
pub mod identifier;

pub use event::{BoxedEvent, Event, EventKind, RawEvent};
pub use identifier::Identifier;
