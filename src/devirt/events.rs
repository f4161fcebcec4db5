//! Structured record of a devirtualization run.
//!
//! Every stage appends [`Event`]s to one shared [`EventLog`] while it works. The log is returned
//! with the [`crate::devirt::DevirtResult`] so callers can report what was found, what was
//! translated and what failed without scraping log output.
//!
//! ```rust
//! use dotdevirt::devirt::{EventKind, EventLog};
//! use dotdevirt::metadata::token::Token;
//!
//! let log = EventLog::new();
//! log.record(EventKind::MethodTranslated)
//!     .method(Token::new(0x0600_0010))
//!     .message("12 instructions");
//! log.warn("opcode 0x0031 has no known handler shape");
//!
//! assert_eq!(log.count_kind(EventKind::MethodTranslated), 1);
//! assert_eq!(log.warnings().count(), 1);
//! ```

use std::{collections::HashMap, fmt};

use crate::metadata::token::Token;

/// Categories of run events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A stage started.
    StageStarted,
    /// A stage completed.
    StageCompleted,
    /// A stage failed.
    StageFailed,
    /// An anchor pattern matched.
    AnchorMatched,
    /// A build layout was selected.
    LayoutSelected,
    /// A scrambled byte order was inferred.
    ByteOrderInferred,
    /// A private opcode was mapped to a native instruction or special action.
    OpcodeClassified,
    /// A private opcode's handler matched no template.
    OpcodeUnknown,
    /// A virtualized method was discovered.
    MethodDiscovered,
    /// A virtualized method was translated.
    MethodTranslated,
    /// A virtualized method failed to translate.
    MethodFailed,
    /// A homomorphic region was skipped.
    HomomorphicRegion,
    /// A replacement body was written back to the module.
    BodyReplaced,
    /// Informational message.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
}

impl EventKind {
    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::StageStarted => "stage started",
            Self::StageCompleted => "stage completed",
            Self::StageFailed => "stage failed",
            Self::AnchorMatched => "anchor matched",
            Self::LayoutSelected => "layout selected",
            Self::ByteOrderInferred => "byte order inferred",
            Self::OpcodeClassified => "opcode classified",
            Self::OpcodeUnknown => "opcode unknown",
            Self::MethodDiscovered => "method discovered",
            Self::MethodTranslated => "method translated",
            Self::MethodFailed => "method failed",
            Self::HomomorphicRegion => "homomorphic region",
            Self::BodyReplaced => "body replaced",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    /// Returns true for info, warning and error events.
    #[must_use]
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, Self::Info | Self::Warning | Self::Error)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A single logged event.
#[derive(Debug, Clone)]
pub struct Event {
    /// The type of event.
    pub kind: EventKind,
    /// The method concerned, if any.
    pub method: Option<Token>,
    /// Virtual offset or opcode value the event refers to.
    pub location: Option<u32>,
    /// Human-readable description.
    pub message: String,
    /// Stage that produced the event.
    pub stage: Option<&'static str>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(stage) = self.stage {
            write!(f, "[{stage}] ")?;
        }
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(method) = self.method {
            write!(f, " ({method})")?;
        }
        Ok(())
    }
}

/// Fluent builder returned by [`EventLog::record`]; the event is appended when it is dropped.
pub struct EventBuilder<'a> {
    log: &'a EventLog,
    kind: EventKind,
    method: Option<Token>,
    location: Option<u32>,
    message: Option<String>,
    stage: Option<&'static str>,
}

impl EventBuilder<'_> {
    /// Sets the method concerned.
    pub fn method(mut self, method: Token) -> Self {
        self.method = Some(method);
        self
    }

    /// Sets the location.
    pub fn location(mut self, location: u32) -> Self {
        self.location = Some(location);
        self
    }

    /// Sets the message; defaults to the kind's description.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the producing stage.
    pub fn stage(mut self, stage: &'static str) -> Self {
        self.stage = Some(stage);
        self
    }
}

impl Drop for EventBuilder<'_> {
    fn drop(&mut self) {
        let message = self
            .message
            .take()
            .unwrap_or_else(|| self.kind.description().to_string());
        self.log.events.push(Event {
            kind: self.kind,
            method: self.method.take(),
            location: self.location.take(),
            message,
            stage: self.stage.take(),
        });
    }
}

/// Append-only collection of run events.
///
/// Appending only needs a shared reference, so stages can record through `&EventLog` while they
/// hold other borrows of the run context.
#[derive(Debug)]
pub struct EventLog {
    events: boxcar::Vec<Event>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            events: boxcar::Vec::new(),
        }
    }
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        let log = Self::new();
        for (_, event) in &self.events {
            log.events.push(event.clone());
        }
        log
    }
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.count() == 0
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.count()
    }

    /// Starts building an event of `kind`.
    pub fn record(&self, kind: EventKind) -> EventBuilder<'_> {
        EventBuilder {
            log: self,
            kind,
            method: None,
            location: None,
            message: None,
            stage: None,
        }
    }

    /// Records an informational message.
    pub fn info(&self, message: impl Into<String>) {
        self.record(EventKind::Info).message(message);
    }

    /// Records a warning.
    pub fn warn(&self, message: impl Into<String>) {
        self.record(EventKind::Warning).message(message);
    }

    /// Records an error.
    pub fn error(&self, message: impl Into<String>) {
        self.record(EventKind::Error).message(message);
    }

    /// Returns true if any event of `kind` exists.
    #[must_use]
    pub fn has(&self, kind: EventKind) -> bool {
        self.iter().any(|e| e.kind == kind)
    }

    /// Counts events of `kind`.
    #[must_use]
    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.filter_kind(kind).count()
    }

    /// Iterates all events in append order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().map(|(_, e)| e)
    }

    /// Iterates events of `kind`.
    pub fn filter_kind(&self, kind: EventKind) -> impl Iterator<Item = &Event> + '_ {
        self.iter().filter(move |e| e.kind == kind)
    }

    /// Iterates events concerning `method`.
    pub fn filter_method(&self, method: Token) -> impl Iterator<Item = &Event> + '_ {
        self.iter().filter(move |e| e.method == Some(method))
    }

    /// Iterates warnings.
    pub fn warnings(&self) -> impl Iterator<Item = &Event> + '_ {
        self.filter_kind(EventKind::Warning)
    }

    /// Iterates errors.
    pub fn errors(&self) -> impl Iterator<Item = &Event> + '_ {
        self.filter_kind(EventKind::Error)
    }

    /// Counts events grouped by kind.
    #[must_use]
    pub fn count_by_kind(&self) -> HashMap<EventKind, usize> {
        let mut counts = HashMap::new();
        for event in self.iter() {
            *counts.entry(event.kind).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_appends_on_drop() {
        let log = EventLog::new();
        log.record(EventKind::OpcodeClassified)
            .location(0x31)
            .stage("opcodes")
            .message("0x0031 -> add");
        log.record(EventKind::MethodFailed).method(Token::new(0x0600_0002));

        assert_eq!(log.len(), 2);
        let first = log.iter().next().unwrap();
        assert_eq!(first.location, Some(0x31));
        assert_eq!(first.to_string(), "[opcodes] opcode classified: 0x0031 -> add");
        let failed = log.filter_method(Token::new(0x0600_0002)).next().unwrap();
        assert_eq!(failed.message, "method failed");
    }

    #[test]
    fn counts_and_clone() {
        let log = EventLog::new();
        log.info("a");
        log.warn("b");
        log.warn("c");
        log.error("d");
        let copy = log.clone();
        assert_eq!(copy.len(), 4);
        assert_eq!(copy.count_kind(EventKind::Warning), 2);
        assert_eq!(copy.count_by_kind()[&EventKind::Error], 1);
        assert!(copy.iter().all(|e| e.kind.is_diagnostic()));
    }
}
