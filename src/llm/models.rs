use serde::{Deserialize, Serialize};

use crate::db::executor::ErrorClass;
use crate::db::schema::SchemaDescriptor;
use crate::sql::RejectReason;

/// Everything the generator needs for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub question: &'a str,
    pub schema: &'a SchemaDescriptor,
    /// Set on retries only
    pub prior: Option<&'a Feedback>,
}

/// Untrusted SQL pulled out of a model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateStatement {
    pub raw_response: String,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackKind {
    Rejected { reason: RejectReason },
    ExecutionFailed { class: ErrorClass },
    Unextractable,
}

/// What went wrong last time, fed into the next prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub kind: FeedbackKind,
    /// The statement tried, or the raw response when nothing could be extracted
    pub statement: String,
    pub message: String,
}
