//! User-facing diagnostics.
//!
//! Lowering reports problems here instead of aborting: a `break` outside a
//! loop compiles to a no-op, an unreachable statement is still translated.
//! Internal contract violations are *not* diagnostics — those panic, because
//! they indicate a bug in this crate rather than in the input program.

use crate::common::span::Span;
use ariadne::{Color, Label, Report, ReportKind, Source};
use std::cell::RefCell;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Diagnostic {
    #[error("'break' used outside of any loop")]
    BreakOutsideOfLoop { span: Option<Span> },

    #[error("'continue' used outside of any loop")]
    ContinuationOutsideOfLoop { span: Option<Span> },

    #[error("statement is unreachable")]
    UnreachableStatement { span: Option<Span> },
}

impl Diagnostic {
    pub fn severity(&self) -> Severity {
        match self {
            Diagnostic::BreakOutsideOfLoop { .. } | Diagnostic::ContinuationOutsideOfLoop { .. } => {
                Severity::Error
            }
            Diagnostic::UnreachableStatement { .. } => Severity::Warning,
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Diagnostic::BreakOutsideOfLoop { span }
            | Diagnostic::ContinuationOutsideOfLoop { span }
            | Diagnostic::UnreachableStatement { span } => *span,
        }
    }
}

/// Collector the lowering phase reports into.
#[derive(Default)]
pub struct Diagnostics {
    reported: RefCell<Vec<Diagnostic>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        self.reported.borrow_mut().push(diagnostic);
    }

    pub fn has_any_error(&self) -> bool {
        self.reported
            .borrow()
            .iter()
            .any(|diagnostic| diagnostic.severity() == Severity::Error)
    }

    pub fn reported(&self) -> Vec<Diagnostic> {
        self.reported.borrow().clone()
    }
}

/// Render a diagnostic against its source with ariadne.
///
/// Diagnostics without a span fall back to a bare stderr line.
pub fn report_diagnostic(filename: &str, source: &str, diagnostic: &Diagnostic) {
    let Some(span) = diagnostic.span() else {
        eprintln!("{}: {}", filename, diagnostic);
        return;
    };

    let (kind, color) = match diagnostic.severity() {
        Severity::Error => (ReportKind::Error, Color::Red),
        Severity::Warning => (ReportKind::Warning, Color::Yellow),
    };

    Report::build(kind, span.start..span.end)
        .with_message(diagnostic.to_string())
        .with_label(
            Label::new(span.start..span.end)
                .with_message(diagnostic.to_string())
                .with_color(color),
        )
        .finish()
        .eprint(Source::from(source))
        .expect("failed to print diagnostic report");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severities() {
        let diagnostics = Diagnostics::new();
        diagnostics.report(Diagnostic::UnreachableStatement { span: None });
        assert!(!diagnostics.has_any_error());

        diagnostics.report(Diagnostic::BreakOutsideOfLoop { span: None });
        assert!(diagnostics.has_any_error());
        assert_eq!(diagnostics.reported().len(), 2);
    }
}
