use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::db::DbHandle;
use crate::errors::AnalyzerError;
use crate::llm::LanguageModel;
use crate::models::{JobStatus, StageResult};

/// Stage payloads are packed into the prompt in this order until the byte
/// budget runs out. The distilled stages carry the most signal per byte, so
/// they go first; raw fetch metadata goes last.
const CONTEXT_PRIORITY: [&str; 6] = [
    "summary",
    "detect_language",
    "dependencies",
    "structure",
    "readme",
    "fetch",
];

pub const DEFAULT_CONTEXT_BUDGET_BYTES: usize = 24 * 1024;

const SYSTEM_PROMPT: &str = "You are a code repository analysis assistant. Answer the user's \
question using only the analysis context provided. The context is a set of <stage> blocks, \
each holding the output of one analysis stage. If the context does not contain the answer, \
say so instead of guessing. Be concise.";

#[derive(Debug, Serialize)]
pub struct Answer {
    pub answer: String,
    /// Stages whose output was included in the prompt, in inclusion order.
    pub context_stages: Vec<String>,
    /// True when at least one recorded stage did not fit the byte budget.
    pub truncated: bool,
}

/// Answers questions about an analyzed repository by assembling recorded
/// stage outputs into a prompt for the language model.
pub struct QuestionService {
    db: DbHandle,
    llm: Arc<dyn LanguageModel>,
    context_budget: usize,
}

impl QuestionService {
    pub fn new(db: DbHandle, llm: Arc<dyn LanguageModel>, context_budget: usize) -> Self {
        Self {
            db,
            llm,
            context_budget,
        }
    }

    /// Answer a question about a job's repository. The job must have at
    /// least one recorded stage and be Complete or PartiallyComplete;
    /// anything else is `NotReady`.
    pub async fn ask(&self, job_id: Uuid, question: &str) -> Result<Answer, AnalyzerError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AnalyzerError::InvalidInput(
                "question must not be empty".to_string(),
            ));
        }

        let snapshot = self
            .db
            .call(move |db| db.get_snapshot(job_id))
            .await?
            .ok_or(AnalyzerError::NotFound(job_id))?;
        match snapshot.job.status {
            JobStatus::Complete | JobStatus::PartiallyComplete => {}
            status => return Err(AnalyzerError::NotReady(job_id, status)),
        }
        if snapshot.stages.is_empty() {
            return Err(AnalyzerError::NotReady(job_id, snapshot.job.status));
        }

        let (context, context_stages, truncated) =
            build_context(&snapshot.stages, self.context_budget);
        let user_prompt = format!(
            "Analysis of repository {}:\n\n{}\n\nQuestion: {}",
            snapshot.job.repository, context, question
        );

        tracing::debug!(
            job_id = %job_id,
            stages = context_stages.len(),
            truncated,
            "asking model"
        );
        let answer = self.llm.complete(SYSTEM_PROMPT, &user_prompt).await?;
        Ok(Answer {
            answer,
            context_stages,
            truncated,
        })
    }
}

/// Pack whole stage blocks in priority order until the budget is exceeded.
/// The first block that does not fit stops the packing; partial blocks would
/// feed the model cut-off JSON.
fn build_context(stages: &[StageResult], budget: usize) -> (String, Vec<String>, bool) {
    let mut context = String::new();
    let mut included = Vec::new();
    let mut truncated = false;

    for name in CONTEXT_PRIORITY {
        let Some(result) = stages.iter().find(|s| s.stage == name && s.success) else {
            continue;
        };
        let block = render_block(result);
        if context.len() + block.len() > budget {
            truncated = true;
            break;
        }
        context.push_str(&block);
        included.push(name.to_string());
    }
    (context, included, truncated)
}

fn render_block(result: &StageResult) -> String {
    // The summary payload is prose already; everything else goes in as JSON.
    let body = match result.payload.get("summary").and_then(|v| v.as_str()) {
        Some(text) if result.stage == "summary" => text.to_string(),
        _ => serde_json::to_string_pretty(&result.payload)
            .unwrap_or_else(|_| result.payload.to_string()),
    };
    format!("<stage name=\"{}\">\n{}\n</stage>\n", result.stage, body)
}

// ── Tests ─────────────────────────────────────────────────────────────
