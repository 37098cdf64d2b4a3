//! Document summarization: an LLM path with a per-run call budget and a
//! deterministic extractive fallback.

use crate::config::LlmConfig;
use crate::error::SummarizationError;
use crate::schema::{Document, GenerationMethod, Summary, TokenUsage};
use serde_json::{Value, json};
use std::borrow::Cow;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a helpful assistant that creates detailed, comprehensive \
summaries of government meeting documents for community members. Focus on clarity, \
completeness, and relevance to residents.";

const TRUNCATION_MARKER: &str = "...\n[Document truncated due to length]";

const FALLBACK_KEYWORDS: &[&str] = &[
    "motion",
    "vote",
    "approved",
    "denied",
    "budget",
    "funding",
    "public comment",
    "discussion",
    "action item",
    "next meeting",
    "resolution",
    "ordinance",
    "permit",
    "development",
    "project",
];

const FALLBACK_MAX_ITEMS: usize = 5;
const FALLBACK_MIN_LINE: usize = 20;
const LEAD_MAX_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// One chat-completion round trip against an LLM provider.
pub trait CompletionClient {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, SummarizationError>;
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(api_base: &str, api_key: &str, timeout: Duration) -> Result<Self, SummarizationError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SummarizationError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", api_base.trim_end_matches('/')),
            api_key: api_key.to_string(),
        })
    }
}

impl CompletionClient for OpenAiClient {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, SummarizationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&make_request_payload(request))
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    SummarizationError::Timeout(e.to_string())
                } else {
                    SummarizationError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| SummarizationError::Http(format!("failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(SummarizationError::Api {
                status: status.as_u16(),
                message: api_error_message(&body),
            });
        }
        parse_response(&body)
    }
}

pub fn make_request_payload(request: &CompletionRequest) -> Value {
    json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "messages": [
            { "role": "system", "content": request.system },
            { "role": "user", "content": request.prompt }
        ]
    })
}

pub fn parse_response(body: &str) -> Result<Completion, SummarizationError> {
    let v: Value = serde_json::from_str(body)
        .map_err(|e| SummarizationError::MalformedResponse(e.to_string()))?;

    if let Some(error) = v.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error");
        return Err(SummarizationError::MalformedResponse(format!(
            "error payload: {message}"
        )));
    }

    let text = v["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| SummarizationError::MalformedResponse("missing choices[0].message.content".to_string()))?
        .trim()
        .to_string();
    if text.is_empty() {
        return Err(SummarizationError::EmptyCompletion);
    }

    let usage = v.get("usage").and_then(|usage| {
        Some(TokenUsage {
            prompt_tokens: u32::try_from(usage["prompt_tokens"].as_u64()?).ok()?,
            completion_tokens: u32::try_from(usage["completion_tokens"].as_u64()?).ok()?,
        })
    });

    Ok(Completion {
        text,
        model: v["model"].as_str().map(str::to_string),
        usage,
    })
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Cuts `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => Cow::Owned(format!("{}{TRUNCATION_MARKER}", &text[..byte_index])),
        None => Cow::Borrowed(text),
    }
}

pub fn build_prompt(document: &Document, text: &str) -> String {
    format!(
        "Please provide a comprehensive and detailed summary of this {doc_type} from the {body}.\n\n\
The summary should be 3-4 paragraphs long and include:\n\n\
1. **Main Topics & Decisions**: Key agenda items, motions, votes, and decisions made\n\
2. **Important Details**: Specific dollar amounts, dates, locations, and names mentioned\n\
3. **Public Input**: Any public comments, concerns, or community feedback discussed\n\
4. **Action Items**: Next steps, deadlines, future meetings, or follow-up actions required\n\
5. **Context & Impact**: How these decisions might affect residents or the community\n\n\
Please write in clear, accessible language that residents can easily understand.\n\n\
Document title: {title}\n\
Meeting date: {date}\n\n\
Document content:\n{text}\n\n\
Provide a detailed summary that captures the substance and significance of this meeting:",
        doc_type = document.doc_type,
        body = document.body,
        title = document.title,
        date = document.date,
    )
}

/// A way of turning a document into a summary.
pub trait SummaryStrategy {
    fn method(&self) -> GenerationMethod;

    fn summarize(&self, document: &Document) -> Result<Summary, SummarizationError>;
}

pub struct LlmSummarizer<C> {
    client: C,
    model: String,
    max_tokens: u32,
    temperature: f64,
    max_input_chars: usize,
}

impl<C: CompletionClient> LlmSummarizer<C> {
    pub fn new(client: C, config: &LlmConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_input_chars: config.max_input_chars,
        }
    }

    pub fn request_for(&self, document: &Document) -> CompletionRequest {
        let text = truncate_for_prompt(&document.text, self.max_input_chars);
        CompletionRequest {
            model: self.model.clone(),
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(document, &text),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

impl<C: CompletionClient> SummaryStrategy for LlmSummarizer<C> {
    fn method(&self) -> GenerationMethod {
        GenerationMethod::Ai
    }

    fn summarize(&self, document: &Document) -> Result<Summary, SummarizationError> {
        let completion = self.client.complete(&self.request_for(document))?;
        if completion.text.trim().is_empty() {
            return Err(SummarizationError::EmptyCompletion);
        }
        Ok(Summary {
            document_id: document.id.clone(),
            text: completion.text.trim().to_string(),
            method: GenerationMethod::Ai,
            model: completion.model.or_else(|| Some(self.model.clone())),
            usage: completion.usage,
        })
    }
}

/// Keyword-driven extraction used when the LLM is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    pub fn summary_text(&self, document: &Document) -> String {
        let important: Vec<&str> = document
            .text
            .lines()
            .map(str::trim)
            .filter(|line| line.chars().count() > FALLBACK_MIN_LINE)
            .filter(|line| {
                let lowered = line.to_lowercase();
                FALLBACK_KEYWORDS.iter().any(|keyword| lowered.contains(keyword))
            })
            .collect();

        if important.is_empty() {
            let mut text = format!(
                "This {} from the {} contains meeting information and agenda items. \
Please refer to the full document for complete details.",
                document.doc_type, document.body
            );
            if let Some(lead) = lead_paragraph(&document.text) {
                text.push_str(&format!(" The document opens with: \"{lead}\""));
            }
            return text;
        }

        let mut text = format!(
            "This {} from the {} covers several important topics. Key items discussed include: {}",
            document.doc_type,
            document.body,
            important
                .iter()
                .take(FALLBACK_MAX_ITEMS)
                .copied()
                .collect::<Vec<_>>()
                .join(". ")
        );
        if important.len() > FALLBACK_MAX_ITEMS {
            text.push_str(&format!(
                " and {} additional items.",
                important.len() - FALLBACK_MAX_ITEMS
            ));
        }
        text
    }
}

impl SummaryStrategy for ExtractiveSummarizer {
    fn method(&self) -> GenerationMethod {
        GenerationMethod::Fallback
    }

    fn summarize(&self, document: &Document) -> Result<Summary, SummarizationError> {
        Ok(Summary {
            document_id: document.id.clone(),
            text: self.summary_text(document),
            method: GenerationMethod::Fallback,
            model: None,
            usage: None,
        })
    }
}

fn lead_paragraph(text: &str) -> Option<String> {
    let paragraph = text.split("\n\n").map(str::trim).find(|p| !p.is_empty())?;
    let flat = paragraph.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(LEAD_MAX_CHARS) {
        Some((byte_index, _)) => Some(format!("{}...", &flat[..byte_index])),
        None => Some(flat),
    }
}

/// Upper bound on external calls for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallBudget {
    limit: usize,
    used: usize,
}

impl CallBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    /// Reserves one call, or returns false when the budget is spent.
    pub fn try_spend(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.used
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SummaryStats {
    pub ai_generated: usize,
    pub fallback: usize,
    pub api_calls: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub call_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            call_delay: Duration::from_millis(config.call_delay_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Chooses between the AI and extractive strategies for each document and
/// owns the run's call budget.
pub struct Summarizer {
    ai: Option<Box<dyn SummaryStrategy>>,
    fallback: ExtractiveSummarizer,
    budget: CallBudget,
    policy: RetryPolicy,
    last_call: Option<Instant>,
    stats: SummaryStats,
}

impl Summarizer {
    pub fn new(ai: Option<Box<dyn SummaryStrategy>>, budget: CallBudget, policy: RetryPolicy) -> Self {
        Self {
            ai,
            fallback: ExtractiveSummarizer,
            budget,
            policy,
            last_call: None,
            stats: SummaryStats::default(),
        }
    }

    /// Production wiring: OpenAI when a key is configured, fallback only otherwise.
    pub fn from_config(config: &LlmConfig) -> Result<Self, SummarizationError> {
        let ai: Option<Box<dyn SummaryStrategy>> = match config.api_key.as_deref() {
            Some(key) => {
                let client = OpenAiClient::new(
                    &config.api_base,
                    key,
                    Duration::from_secs(config.request_timeout_secs),
                )?;
                Some(Box::new(LlmSummarizer::new(client, config)))
            }
            None => {
                info!("no API key configured, using extractive summaries only");
                None
            }
        };
        Ok(Self::new(
            ai,
            CallBudget::new(config.max_calls_per_run),
            RetryPolicy::from_config(config),
        ))
    }

    /// Always returns a summary; AI failures degrade to the fallback.
    pub fn summarize(&mut self, document: &Document) -> Summary {
        match self.try_ai(document) {
            Ok(summary) => {
                self.stats.ai_generated += 1;
                debug!(id = %document.id, "AI summary generated");
                summary
            }
            Err(err) => {
                match err {
                    SummarizationError::Disabled => {}
                    SummarizationError::BudgetExhausted { .. } => {
                        debug!(id = %document.id, "call budget spent, using fallback")
                    }
                    _ => warn!(id = %document.id, error = %err, "AI summary failed, using fallback"),
                }
                self.stats.fallback += 1;
                Summary {
                    document_id: document.id.clone(),
                    text: self.fallback.summary_text(document),
                    method: self.fallback.method(),
                    model: None,
                    usage: None,
                }
            }
        }
    }

    fn try_ai(&mut self, document: &Document) -> Result<Summary, SummarizationError> {
        let Some(strategy) = self.ai.as_deref() else {
            return Err(SummarizationError::Disabled);
        };

        let mut attempt = 0;
        loop {
            if !self.budget.try_spend() {
                return Err(SummarizationError::BudgetExhausted {
                    limit: self.budget.limit(),
                });
            }
            self.stats.api_calls = self.budget.used();
            pace(&mut self.last_call, self.policy.call_delay);

            match strategy.summarize(document) {
                Ok(summary) => return Ok(summary),
                Err(err) if attempt < self.policy.max_retries && is_retryable(&err) => {
                    let delay = self.policy.backoff(attempt);
                    warn!(id = %document.id, attempt = attempt + 1, error = %err, "AI call failed, retrying");
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn stats(&self) -> SummaryStats {
        self.stats
    }

    pub fn budget(&self) -> CallBudget {
        self.budget
    }

    pub fn ai_enabled(&self) -> bool {
        self.ai.is_some()
    }
}

/// Sleeps so consecutive calls are at least `delay` apart.
fn pace(last_call: &mut Option<Instant>, delay: Duration) {
    if let Some(previous) = *last_call {
        let elapsed = previous.elapsed();
        if elapsed < delay {
            std::thread::sleep(delay - elapsed);
        }
    }
    *last_call = Some(Instant::now());
}

fn is_retryable(err: &SummarizationError) -> bool {
    match err {
        SummarizationError::Timeout(_)
        | SummarizationError::Http(_)
        | SummarizationError::EmptyCompletion => true,
        SummarizationError::Api { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DocumentType;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    struct ScriptedClient {
        replies: RefCell<VecDeque<Result<Completion, SummarizationError>>>,
        calls: std::rc::Rc<Cell<usize>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<Completion, SummarizationError>>) -> (Self, std::rc::Rc<Cell<usize>>) {
            let calls = std::rc::Rc::new(Cell::new(0));
            (
                Self {
                    replies: RefCell::new(replies.into()),
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl CompletionClient for ScriptedClient {
        fn complete(&self, _request: &CompletionRequest) -> Result<Completion, SummarizationError> {
            self.calls.set(self.calls.get() + 1);
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Ok(ok("default summary")))
        }
    }

    fn ok(text: &str) -> Completion {
        Completion {
            text: text.to_string(),
            model: Some("gpt-3.5-turbo-0125".to_string()),
            usage: Some(TokenUsage {
                prompt_tokens: 1200,
                completion_tokens: 300,
            }),
        }
    }

    fn doc(id: &str, text: &str) -> Document {
        Document {
            id: id.to_string(),
            body: "City Council".to_string(),
            title: "City Council Minutes 07/02/2025".to_string(),
            date: "2025-07-02".to_string(),
            url: "https://lcf.ca.gov/min.pdf".to_string(),
            doc_type: DocumentType::Minutes,
            text: text.to_string(),
        }
    }

    fn no_delay() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            retry_delay: Duration::ZERO,
            call_delay: Duration::ZERO,
        }
    }

    fn summarizer_with(client: ScriptedClient, limit: usize) -> Summarizer {
        let strategy = LlmSummarizer::new(client, &LlmConfig::default());
        Summarizer::new(Some(Box::new(strategy)), CallBudget::new(limit), no_delay())
    }

    #[test]
    fn payload_matches_chat_completions_shape() {
        let request = CompletionRequest {
            model: "gpt-3.5-turbo".to_string(),
            system: "sys".to_string(),
            prompt: "hello".to_string(),
            max_tokens: 1000,
            temperature: 0.3,
        };
        let payload = make_request_payload(&request);
        assert_eq!(payload["model"], "gpt-3.5-turbo");
        assert_eq!(payload["max_tokens"], 1000);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "hello");
    }

    #[test]
    fn parses_completion_text_and_usage() {
        let body = r#"{"model":"gpt-3.5-turbo-0125","choices":[{"message":{"role":"assistant","content":"  The council approved the budget. "}}],"usage":{"prompt_tokens":900,"completion_tokens":120,"total_tokens":1020}}"#;
        let completion = parse_response(body).unwrap();
        assert_eq!(completion.text, "The council approved the budget.");
        assert_eq!(completion.model.as_deref(), Some("gpt-3.5-turbo-0125"));
        assert_eq!(completion.usage.unwrap().completion_tokens, 120);
    }

    #[test]
    fn rejects_error_and_empty_responses() {
        let err = parse_response(r#"{"error":{"message":"bad key"}}"#).unwrap_err();
        assert!(matches!(err, SummarizationError::MalformedResponse(_)));

        let err = parse_response(r#"{"choices":[{"message":{"content":"   "}}]}"#).unwrap_err();
        assert!(matches!(err, SummarizationError::EmptyCompletion));

        assert!(parse_response("not json").is_err());
    }

    #[test]
    fn long_input_is_truncated_with_marker() {
        let text = "é".repeat(20);
        assert_eq!(truncate_for_prompt(&text, 30), text.as_str());
        let cut = truncate_for_prompt(&text, 5);
        assert!(cut.starts_with("ééééé..."));
        assert!(cut.ends_with("[Document truncated due to length]"));
    }

    #[test]
    fn extractive_summary_lists_keyword_lines_and_counts_the_rest() {
        let text = (1..=7)
            .map(|n| format!("Item {n}: motion to approve the budget amendment"))
            .chain(["Roll call".to_string()])
            .collect::<Vec<_>>()
            .join("\n");
        let summary = ExtractiveSummarizer.summarize(&doc("d1", &text)).unwrap();
        assert_eq!(summary.method, GenerationMethod::Fallback);
        assert!(summary.text.starts_with("This minutes from the City Council covers"));
        assert!(summary.text.contains("Item 5: motion"));
        assert!(!summary.text.contains("Item 6: motion"));
        assert!(summary.text.ends_with(" and 2 additional items."));
    }

    #[test]
    fn extractive_summary_without_keywords_quotes_the_lead() {
        let summary = ExtractiveSummarizer
            .summarize(&doc("d1", "CALL TO ORDER 7:00 PM\nFlag salute\n\nRoll call"))
            .unwrap();
        assert!(summary.text.contains("Please refer to the full document"));
        assert!(summary.text.contains("\"CALL TO ORDER 7:00 PM Flag salute\""));
    }

    #[test]
    fn budget_caps_ai_summaries() {
        let (client, calls) = ScriptedClient::new(vec![]);
        let mut summarizer = summarizer_with(client, 2);
        let methods: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| summarizer.summarize(&doc(id, "Motion to approve the annual budget")).method)
            .collect();
        assert_eq!(
            methods,
            vec![GenerationMethod::Ai, GenerationMethod::Ai, GenerationMethod::Fallback]
        );
        assert_eq!(calls.get(), 2);
        assert_eq!(
            summarizer.stats(),
            SummaryStats {
                ai_generated: 2,
                fallback: 1,
                api_calls: 2
            }
        );
    }

    #[test]
    fn transient_failures_are_retried_and_counted() {
        let (client, calls) = ScriptedClient::new(vec![
            Err(SummarizationError::Timeout("slow".to_string())),
            Ok(ok("Recovered summary")),
        ]);
        let mut summarizer = summarizer_with(client, 10);
        let summary = summarizer.summarize(&doc("a", "text"));
        assert_eq!(summary.method, GenerationMethod::Ai);
        assert_eq!(summary.text, "Recovered summary");
        assert_eq!(calls.get(), 2);
        assert_eq!(summarizer.budget().remaining(), 8);
    }

    #[test]
    fn persistent_failure_falls_back_after_bounded_retries() {
        let (client, calls) = ScriptedClient::new(
            (0..5)
                .map(|_| Err(SummarizationError::Api { status: 503, message: "busy".to_string() }))
                .collect(),
        );
        let mut summarizer = summarizer_with(client, 10);
        let summary = summarizer.summarize(&doc("a", "Public comment on the permit"));
        assert_eq!(summary.method, GenerationMethod::Fallback);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let (client, calls) = ScriptedClient::new(vec![Err(SummarizationError::Api {
            status: 401,
            message: "invalid key".to_string(),
        })]);
        let mut summarizer = summarizer_with(client, 10);
        assert_eq!(summarizer.summarize(&doc("a", "text")).method, GenerationMethod::Fallback);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retries_stop_at_the_budget() {
        let (client, calls) = ScriptedClient::new(
            (0..5)
                .map(|_| Err(SummarizationError::Http("reset".to_string())))
                .collect(),
        );
        let mut summarizer = summarizer_with(client, 2);
        assert_eq!(summarizer.summarize(&doc("a", "text")).method, GenerationMethod::Fallback);
        assert_eq!(calls.get(), 2);
        assert_eq!(summarizer.stats().api_calls, 2);
    }

    #[test]
    fn without_api_key_everything_is_fallback() {
        let mut summarizer = Summarizer::from_config(&LlmConfig::default()).unwrap();
        assert!(!summarizer.ai_enabled());
        let summary = summarizer.summarize(&doc("a", "Vote on the ordinance amendment today"));
        assert_eq!(summary.method, GenerationMethod::Fallback);
        assert_eq!(summarizer.stats().api_calls, 0);
    }
}
