//! Fatal generation errors.
//!
//! Every variant is a front-end contract violation: generation stops at
//! the first one and no partial module is produced.

use thiserror::Error;

use crate::diagnostic::Diagnostic;
use crate::span::Span;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("variable-length array '{name}' cannot be captured by a {region} region")]
    VlaCapture {
        name: String,
        region: String,
        span: Span,
    },
    #[error("'{name}' is captured by copy in a {region} region")]
    ByCopyCapture {
        name: String,
        region: String,
        span: Span,
    },
    #[error("'{name}' is a typed view over an aggregate and cannot be copied into shared storage")]
    AggregateView { name: String, span: Span },
    #[error("unknown variable id {id}")]
    UnknownVar { id: u32, span: Span },
    #[error("duplicate directive id {id}")]
    DuplicateDirective { id: u32, span: Span },
    #[error("duplicate function '{name}'")]
    DuplicateFunction { name: String, span: Span },
    #[error("capture '{name}' has no storage in the enclosing function")]
    UnplannedCapture { name: String, span: Span },
    #[error("target region nested inside device code")]
    NestedTarget { span: Span },
    #[error("'this' captured in '{function}', which has no object")]
    MissingThis { function: String, span: Span },
    #[error("kernel entry '{entry}' was not completed before finalization")]
    IncompleteEntry { entry: String },
    #[error("invalid device configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CodegenError>;

impl CodegenError {
    pub fn span(&self) -> Span {
        match self {
            CodegenError::VlaCapture { span, .. }
            | CodegenError::ByCopyCapture { span, .. }
            | CodegenError::AggregateView { span, .. }
            | CodegenError::UnknownVar { span, .. }
            | CodegenError::DuplicateDirective { span, .. }
            | CodegenError::DuplicateFunction { span, .. }
            | CodegenError::UnplannedCapture { span, .. }
            | CodegenError::NestedTarget { span }
            | CodegenError::MissingThis { span, .. } => *span,
            CodegenError::IncompleteEntry { .. } | CodegenError::Config(_) => Span::dummy(),
        }
    }

    fn help(&self) -> Option<&'static str> {
        match self {
            CodegenError::VlaCapture { .. } => {
                Some("allocate the array with a constant size or pass a pointer to it")
            }
            CodegenError::ByCopyCapture { .. } => {
                Some("parallel and simd regions share locals by reference; use firstprivate on the target instead")
            }
            CodegenError::AggregateView { .. } => Some("capture a pointer to the aggregate instead"),
            _ => None,
        }
    }
}

impl From<CodegenError> for Diagnostic {
    fn from(err: CodegenError) -> Self {
        let mut diag = Diagnostic::error(err.to_string(), err.span());
        if let Some(help) = err.help() {
            diag = diag.with_help(help.to_string());
        }
        diag
    }
}
