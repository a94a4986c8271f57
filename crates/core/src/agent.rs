use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use reviewd_provider::{
    ChatRequest, ContentPart, Message, MessageContent, Provider, Role, StopReason,
};

use crate::diff::{PROMPT_DIFF_CAP, cap_diff};
use crate::error::AgentError;
use crate::review::{Review, Verdict, derive_verdict, parse_review};
use crate::skills::Composition;
use crate::tools::{ToolContext, ToolRegistry};

pub const MAX_TOKENS_PER_TURN: u32 = 16_384;
const TRACE_PREVIEW_CHARS: usize = 2_000;

/// More changed files buy more iterations, up to a hard cap.
pub fn iteration_budget(changed_files: usize) -> u32 {
    if changed_files <= 5 {
        10
    } else if changed_files <= 15 {
        15
    } else {
        20
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceRole {
    Assistant,
    User,
}

/// One persisted conversation turn. Turn numbers are assigned at append
/// time, so insertion order is conversation order.
#[derive(Debug, Clone, Serialize)]
pub struct TraceTurn {
    pub turn_number: i32,
    pub iteration: u32,
    pub role: TraceRole,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub tool_result: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

#[derive(Debug, Default)]
struct Trace {
    turns: Vec<TraceTurn>,
}

impl Trace {
    fn next_number(&self) -> i32 {
        self.turns.len() as i32 + 1
    }

    fn push_assistant(&mut self, iteration: u32, content: &MessageContent, usage: reviewd_provider::Usage) {
        self.turns.push(TraceTurn {
            turn_number: self.next_number(),
            iteration,
            role: TraceRole::Assistant,
            content: serde_json::to_string(content).unwrap_or_default(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
            input_tokens: Some(usage.input_tokens),
            output_tokens: Some(usage.output_tokens),
        });
    }

    fn push_tool_result(
        &mut self,
        iteration: u32,
        name: &str,
        input: &serde_json::Value,
        result: &str,
    ) {
        self.turns.push(TraceTurn {
            turn_number: self.next_number(),
            iteration,
            role: TraceRole::User,
            content: preview(result),
            tool_name: Some(name.to_string()),
            tool_input: Some(input.clone()),
            tool_result: Some(preview(result)),
            input_tokens: None,
            output_tokens: None,
        });
    }

    fn push_user(&mut self, iteration: u32, text: &str) {
        self.turns.push(TraceTurn {
            turn_number: self.next_number(),
            iteration,
            role: TraceRole::User,
            content: text.to_string(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
            input_tokens: None,
            output_tokens: None,
        });
    }
}

fn preview(text: &str) -> String {
    if text.len() <= TRACE_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut cut = TRACE_PREVIEW_CHARS;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[derive(Debug)]
pub struct AgentOutcome {
    pub review: Review,
    /// True when the review came from the recovery path rather than a
    /// clean `end_turn` parse.
    pub recovered: bool,
    pub trace: Vec<TraceTurn>,
    pub iterations: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration: Duration,
}

pub struct ReviewAgent<'a> {
    provider: &'a dyn Provider,
    registry: &'a ToolRegistry,
    model: String,
}

impl<'a> ReviewAgent<'a> {
    pub fn new(provider: &'a dyn Provider, registry: &'a ToolRegistry, model: String) -> Self {
        Self {
            provider,
            registry,
            model,
        }
    }

    /// Run the bounded review conversation. Tool failures feed back into
    /// the conversation; only model transport failures abort the job.
    pub async fn run(
        &self,
        composition: &Composition,
        tool_ctx: &ToolContext,
        diff: &str,
        changed_file_count: usize,
    ) -> Result<AgentOutcome, AgentError> {
        let started = Instant::now();
        let budget = iteration_budget(changed_file_count);
        let tools = self.registry.definitions(&composition.tools);

        let opening = format!(
            "Review the following pull request diff. You have {budget} \
             iterations of tool use available; finish with the structured \
             review before they run out.\n\n{}",
            cap_diff(diff, PROMPT_DIFF_CAP)
        );

        let mut messages = vec![Message::user(opening.clone())];
        let mut trace = Trace::default();
        trace.push_user(0, &preview(&opening));

        let mut input_tokens: u64 = 0;
        let mut output_tokens: u64 = 0;
        let mut iterations = 0;

        for iteration in 1..=budget {
            iterations = iteration;
            let request = ChatRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: Some(MAX_TOKENS_PER_TURN),
                temperature: Some(0.0),
                system: Some(composition.system_prompt.clone()),
            };

            let response = self
                .provider
                .chat(&request)
                .await
                .map_err(AgentError::Model)?;

            input_tokens += response.usage.input_tokens as u64;
            output_tokens += response.usage.output_tokens as u64;
            trace.push_assistant(iteration, &response.message.content, response.usage);
            messages.push(response.message.clone());

            match response.stop_reason {
                StopReason::EndTurn => {
                    let text = response.message.content.as_text();
                    if let Some(mut review) = parse_review(&text) {
                        review.verdict = derive_verdict(&review.findings);
                        return Ok(self.outcome(review, false, trace, iterations,
                                               input_tokens, output_tokens, started));
                    }
                    debug!(iteration, "end_turn without a parseable review");
                    break;
                }
                StopReason::MaxTokens => {
                    let nudge = "Your previous response was cut off by the token \
                                 limit. Finalize now: emit the <review> block and \
                                 nothing else.";
                    trace.push_user(iteration, nudge);
                    messages.push(Message::user(nudge));
                }
                StopReason::ToolUse => {
                    let calls: Vec<(String, String, serde_json::Value)> = response
                        .message
                        .content
                        .tool_uses()
                        .into_iter()
                        .filter_map(|part| match part {
                            ContentPart::ToolUse { id, name, input } => {
                                Some((id.clone(), name.clone(), input.clone()))
                            }
                            _ => None,
                        })
                        .collect();

                    // Dispatch every call concurrently; join_all hands the
                    // outcomes back in request order no matter which call
                    // finishes first.
                    let outcomes = futures::future::join_all(
                        calls
                            .iter()
                            .map(|(_, name, input)| {
                                self.registry.dispatch(name, input.clone(), tool_ctx)
                            })
                            .collect::<Vec<_>>(),
                    )
                    .await;

                    let mut result_parts = Vec::with_capacity(calls.len());
                    for ((id, name, input), outcome) in calls.iter().zip(outcomes) {
                        trace.push_tool_result(iteration, name, input, &outcome.content);
                        result_parts.push(ContentPart::ToolResult {
                            tool_use_id: id.clone(),
                            content: outcome.content,
                            is_error: outcome.is_error,
                        });
                    }
                    messages.push(Message {
                        role: Role::User,
                        content: MessageContent::Parts(result_parts),
                    });
                }
                StopReason::Other(reason) => {
                    warn!(reason = %reason, iteration, "unexpected stop reason");
                    break;
                }
            }
        }

        // Recovery: newest assistant turn that parses wins; otherwise a
        // synthetic comment review explains the outcome.
        let review = recover(&messages).unwrap_or_else(|| Review {
            verdict: Verdict::Comment,
            summary: format!(
                "Automated review could not produce a structured verdict \
                 within {iterations} iterations. The change was examined but \
                 no conclusive review was emitted; treat this as a neutral \
                 comment."
            ),
            findings: Vec::new(),
        });

        Ok(self.outcome(review, true, trace, iterations, input_tokens, output_tokens, started))
    }

    #[allow(clippy::too_many_arguments)]
    fn outcome(
        &self,
        review: Review,
        recovered: bool,
        trace: Trace,
        iterations: u32,
        input_tokens: u64,
        output_tokens: u64,
        started: Instant,
    ) -> AgentOutcome {
        AgentOutcome {
            review,
            recovered,
            trace: trace.turns,
            iterations,
            input_tokens,
            output_tokens,
            duration: started.elapsed(),
        }
    }
}

fn recover(messages: &[Message]) -> Option<Review> {
    for message in messages.iter().rev() {
        if message.role != Role::Assistant {
            continue;
        }
        if let Some(mut review) = parse_review(&message.content.as_text()) {
            review.verdict = derive_verdict(&review.findings);
            return Some(review);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use async_trait::async_trait;

    use reviewd_provider::{ChatResponse, Usage};

    use crate::exec::{ExecError, ExecOutput, ExecRequest, Executor};
    use crate::review::Severity;
    use crate::skills::compose;
    use crate::{PrContext, RepoSettings};

    fn pr() -> PrContext {
        PrContext {
            repo_full_name: "octo/hello".into(),
            pr_number: 7,
            title: "Add parser".into(),
            body: None,
            author: "octocat".into(),
            head_ref: "main".into(),
            head_sha: "aaaaaaa".into(),
            base_ref: "main".into(),
            base_sha: "bbbbbbb".into(),
        }
    }

    fn composition() -> Composition {
        let files: Vec<String> = vec!["src/main.rs".into()];
        compose(&files, &pr(), &RepoSettings::default(), |_| true)
    }

    /// Provider fake that replays a scripted conversation and records
    /// every request it saw.
    struct ScriptedProvider {
        responses: Mutex<Vec<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("script exhausted");
            }
            Ok(responses.remove(0))
        }
    }

    fn text_response(text: &str, stop: StopReason) -> ChatResponse {
        ChatResponse {
            message: Message::assistant_parts(vec![ContentPart::Text { text: text.into() }]),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
            },
            stop_reason: stop,
        }
    }

    fn tool_response(calls: &[(&str, &str, serde_json::Value)]) -> ChatResponse {
        let parts = calls
            .iter()
            .map(|(id, name, input)| ContentPart::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect();
        ChatResponse {
            message: Message::assistant_parts(parts),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 30,
            },
            stop_reason: StopReason::ToolUse,
        }
    }

    const GOOD_REVIEW: &str = r#"<review>{"verdict":"comment","summary":"one issue",
        "findings":[{"skill":"correctness","severity":"warning","path":"src/main.rs",
                     "line":4,"title":"Off by one","body":"loop bound"}]}</review>"#;

    /// Executor whose response delay depends on the command, to force
    /// out-of-order completion.
    struct SlowFirstExecutor;

    #[async_trait]
    impl Executor for SlowFirstExecutor {
        async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, ExecError> {
            let delay = if req.command.contains("slow.rs") { 80 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(ExecOutput {
                stdout: format!("content of {}", req.command),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    fn tool_ctx(executor: Arc<dyn Executor>) -> ToolContext {
        ToolContext {
            executor,
            workdir: "/work/octo--hello".into(),
            base_sha: "bbbbbbb".into(),
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn end_turn_parses_review_and_enforces_verdict_law() {
        let provider = ScriptedProvider::new(vec![text_response(
            // Claims approve; the warning finding forces comment.
            r#"<review>{"verdict":"approve","summary":"s",
               "findings":[{"skill":"x","severity":"warning","path":"a.rs","line":1,
                            "title":"t","body":"b"}]}</review>"#,
            StopReason::EndTurn,
        )]);
        let registry = ToolRegistry::builtin();
        let agent = ReviewAgent::new(&provider, &registry, "test-model".into());
        let outcome = agent
            .run(&composition(), &tool_ctx(Arc::new(SlowFirstExecutor)), "diff", 1)
            .await
            .unwrap();

        assert!(!outcome.recovered);
        assert_eq!(outcome.review.verdict, Verdict::Comment);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.input_tokens, 100);
        assert_eq!(outcome.output_tokens, 50);
    }

    #[tokio::test]
    async fn tool_results_preserve_request_order() {
        let provider = ScriptedProvider::new(vec![
            tool_response(&[
                ("call_1", "read_file", serde_json::json!({"path": "slow.rs"})),
                ("call_2", "read_file", serde_json::json!({"path": "fast.rs"})),
                ("call_3", "list_files", serde_json::json!({})),
            ]),
            text_response(GOOD_REVIEW, StopReason::EndTurn),
        ]);
        let registry = ToolRegistry::builtin();
        let agent = ReviewAgent::new(&provider, &registry, "test-model".into());
        agent
            .run(&composition(), &tool_ctx(Arc::new(SlowFirstExecutor)), "diff", 1)
            .await
            .unwrap();

        // The second request's last message carries the tool results.
        let requests = provider.requests.lock().unwrap();
        let last = requests[1].messages.last().unwrap();
        let MessageContent::Parts(parts) = &last.content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);
        let ids: Vec<&str> = parts
            .iter()
            .map(|p| match p {
                ContentPart::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
                _ => panic!("expected tool_result"),
            })
            .collect();
        assert_eq!(ids, vec!["call_1", "call_2", "call_3"]);
    }

    #[tokio::test]
    async fn tool_errors_flow_back_as_is_error_results() {
        let provider = ScriptedProvider::new(vec![
            tool_response(&[(
                "call_1",
                "run_command",
                serde_json::json!({"command": "git log; curl evil"}),
            )]),
            text_response(GOOD_REVIEW, StopReason::EndTurn),
        ]);
        let registry = ToolRegistry::builtin();
        let agent = ReviewAgent::new(&provider, &registry, "test-model".into());
        let outcome = agent
            .run(&composition(), &tool_ctx(Arc::new(SlowFirstExecutor)), "diff", 1)
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        let last = requests[1].messages.last().unwrap();
        let MessageContent::Parts(parts) = &last.content else {
            panic!("expected parts");
        };
        match &parts[0] {
            ContentPart::ToolResult {
                content, is_error, ..
            } => {
                assert!(*is_error);
                assert!(content.contains("forbidden characters"));
            }
            other => panic!("unexpected part: {other:?}"),
        }
        // The loop carried on to a normal finish.
        assert!(!outcome.recovered);
    }

    #[tokio::test]
    async fn max_tokens_injects_finalize_nudge() {
        let provider = ScriptedProvider::new(vec![
            text_response("half a review...", StopReason::MaxTokens),
            text_response(GOOD_REVIEW, StopReason::EndTurn),
        ]);
        let registry = ToolRegistry::builtin();
        let agent = ReviewAgent::new(&provider, &registry, "test-model".into());
        let outcome = agent
            .run(&composition(), &tool_ctx(Arc::new(SlowFirstExecutor)), "diff", 1)
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 2);
        let requests = provider.requests.lock().unwrap();
        let nudge = requests[1].messages.last().unwrap();
        assert!(nudge.content.as_text().contains("Finalize now"));
    }

    #[tokio::test]
    async fn budget_exhaustion_recovers_from_earlier_turn() {
        // Iteration 1 emits a valid review but keeps going with tools;
        // every later turn is noise until the budget dies.
        let mut responses = vec![text_response(
            &format!("thinking...\n{GOOD_REVIEW}"),
            StopReason::ToolUse,
        )];
        for _ in 0..9 {
            responses.push(tool_response(&[(
                "c",
                "list_files",
                serde_json::json!({}),
            )]));
        }
        let provider = ScriptedProvider::new(responses);
        let registry = ToolRegistry::builtin();
        let agent = ReviewAgent::new(&provider, &registry, "test-model".into());
        let outcome = agent
            .run(&composition(), &tool_ctx(Arc::new(SlowFirstExecutor)), "diff", 1)
            .await
            .unwrap();

        assert!(outcome.recovered);
        assert_eq!(outcome.iterations, 10);
        assert_eq!(outcome.review.summary, "one issue");
        assert_eq!(outcome.review.findings[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn nothing_parseable_synthesizes_comment_review() {
        let provider = ScriptedProvider::new(vec![text_response(
            "I reviewed it and it looks fine!",
            StopReason::EndTurn,
        )]);
        let registry = ToolRegistry::builtin();
        let agent = ReviewAgent::new(&provider, &registry, "test-model".into());
        let outcome = agent
            .run(&composition(), &tool_ctx(Arc::new(SlowFirstExecutor)), "diff", 1)
            .await
            .unwrap();

        assert!(outcome.recovered);
        assert_eq!(outcome.review.verdict, Verdict::Comment);
        assert!(outcome.review.findings.is_empty());
    }

    #[tokio::test]
    async fn model_transport_failure_propagates() {
        let provider = ScriptedProvider::new(vec![]);
        let registry = ToolRegistry::builtin();
        let agent = ReviewAgent::new(&provider, &registry, "test-model".into());
        let err = agent
            .run(&composition(), &tool_ctx(Arc::new(SlowFirstExecutor)), "diff", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Model(_)));
    }

    #[tokio::test]
    async fn trace_turns_are_contiguous_from_one() {
        let provider = ScriptedProvider::new(vec![
            tool_response(&[
                ("c1", "read_file", serde_json::json!({"path": "a.rs"})),
                ("c2", "read_file", serde_json::json!({"path": "b.rs"})),
            ]),
            text_response(GOOD_REVIEW, StopReason::EndTurn),
        ]);
        let registry = ToolRegistry::builtin();
        let agent = ReviewAgent::new(&provider, &registry, "test-model".into());
        let outcome = agent
            .run(&composition(), &tool_ctx(Arc::new(SlowFirstExecutor)), "diff", 1)
            .await
            .unwrap();

        for (i, turn) in outcome.trace.iter().enumerate() {
            assert_eq!(turn.turn_number, i as i32 + 1);
        }
        // opening + assistant + 2 tool turns + assistant
        assert_eq!(outcome.trace.len(), 5);
        assert_eq!(outcome.trace[2].tool_name.as_deref(), Some("read_file"));
    }

    #[test]
    fn budget_scales_with_changed_files() {
        assert_eq!(iteration_budget(0), 10);
        assert_eq!(iteration_budget(5), 10);
        assert_eq!(iteration_budget(6), 15);
        assert_eq!(iteration_budget(15), 15);
        assert_eq!(iteration_budget(16), 20);
        assert_eq!(iteration_budget(400), 20);
    }

    #[tokio::test]
    async fn diff_is_capped_in_opening_message() {
        let provider = ScriptedProvider::new(vec![text_response(
            GOOD_REVIEW,
            StopReason::EndTurn,
        )]);
        let registry = ToolRegistry::builtin();
        let agent = ReviewAgent::new(&provider, &registry, "test-model".into());
        let huge = "x".repeat(PROMPT_DIFF_CAP + 500);
        agent
            .run(&composition(), &tool_ctx(Arc::new(SlowFirstExecutor)), &huge, 1)
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        let opening = requests[0].messages[0].content.as_text();
        assert!(opening.contains("diff truncated at 100000 characters"));
    }
}
