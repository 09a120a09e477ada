use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{ContextSource, StaticContext};
use crate::conversation::Conversation;
use crate::errors::{AgentError, AgentResult, ConfigError};
use crate::models::content::{ContentBlock, ToolResult, ToolUse};
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::Tool;
use crate::prompt_template::{render_system_prompt, ToolsetInfo, DEFAULT_SYSTEM_PROMPT};
use crate::providers::base::{CompletionReason, CompletionRequest, ParsedResponse, Provider, Usage};
use crate::providers::configs::ProviderConfig;
use crate::providers::factory::get_provider;
use crate::providers::stream::{ParserStep, StreamParser};
use crate::tools::{ToolOutput, ToolRegistry};
use crate::transport::{event_stream, RetryPolicy, RetryingTransport};

/// Tool rounds allowed in one user turn
pub const MAX_RECURSION_DEPTH: usize = 20;

pub const CONTINUATION_PROMPT: &str = "Max tokens reached. Please continue";

pub const RECURSION_LIMIT_NOTICE: &str = "Max recursion depth reached. Stopping further processing.";

/// Whether responses are read whole or as a server-sent event stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseMode {
    #[default]
    Batch,
    Streaming,
}

/// Progress reported while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Text(String),
    ToolCall(ToolUse),
    ToolResult(ToolResult),
    Notice(String),
}

/// The result of one user turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    pub text: String,
    /// Tool rounds executed during the turn
    pub rounds: usize,
    /// The turn stopped at the recursion limit
    pub truncated: bool,
    pub usage: Usage,
}

/// One request and its parsed response, plus the results of any tools that
/// already ran while the response streamed in.
struct Exchange {
    response: ParsedResponse,
    results: Option<Vec<ToolResult>>,
}

type Events<'a> = Option<&'a UnboundedSender<AgentEvent>>;

fn emit(events: Events<'_>, event: AgentEvent) {
    if let Some(sender) = events {
        // the receiver may have gone away; the turn carries on regardless
        let _ = sender.send(event);
    }
}

/// Agent drives a backend through tool-use rounds until it gives a final answer
pub struct Agent {
    provider: Box<dyn Provider>,
    transport: RetryingTransport,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    context: Arc<dyn ContextSource>,
    mode: ResponseMode,
}

impl Agent {
    pub fn new(provider: Box<dyn Provider>, tools: Arc<ToolRegistry>) -> AgentResult<Self> {
        let transport = RetryingTransport::new(provider.config())?;
        Ok(Self {
            provider,
            transport,
            tools,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            context: Arc::new(StaticContext::default()),
            mode: ResponseMode::default(),
        })
    }

    /// Build an agent for the single backend named by `config`
    pub fn from_config(config: ProviderConfig, tools: Arc<ToolRegistry>) -> AgentResult<Self> {
        Self::new(get_provider(config)?, tools)
    }

    /// Replace the system prompt template. It is rendered once up front so a
    /// broken template fails here rather than in the middle of a turn.
    pub fn with_system_prompt<S: Into<String>>(mut self, template: S) -> AgentResult<Self> {
        let template = template.into();
        render_system_prompt(&template, &self.toolset_info(), "").map_err(|e| {
            ConfigError::Invalid {
                field: "system_prompt",
                reason: e.to_string(),
            }
        })?;
        self.system_prompt = template;
        Ok(self)
    }

    pub fn with_context(mut self, context: Arc<dyn ContextSource>) -> Self {
        self.context = context;
        self
    }

    pub fn with_mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.transport = self.transport.with_retry_policy(policy);
        self
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    fn toolset_info(&self) -> Vec<ToolsetInfo> {
        self.tools
            .toolsets()
            .map(|toolset| ToolsetInfo {
                name: toolset.name().to_string(),
                description: toolset.description().to_string(),
                instructions: toolset.instructions().to_string(),
            })
            .collect()
    }

    async fn system_prompt(&self) -> AgentResult<String> {
        let context = self.context.context().await;
        render_system_prompt(&self.system_prompt, &self.toolset_info(), &context)
            .map_err(|e| AgentError::Internal(format!("Failed to render system prompt: {}", e)))
    }

    /// Run one user turn to completion.
    ///
    /// The user message and every assistant and tool turn produced along the
    /// way are committed to `conversation` only when the turn succeeds. On
    /// error or cancellation the conversation is left exactly as it was.
    pub async fn reply(
        &self,
        conversation: &mut Conversation,
        user_text: &str,
        events: Events<'_>,
        cancel: &CancellationToken,
    ) -> AgentResult<TurnOutcome> {
        let history = conversation.snapshot();
        let mut staged = vec![Message::user_text(user_text)];
        let mut outcome = TurnOutcome::default();
        let mut texts = Vec::new();
        let mut depth = 0;

        info!(
            provider = self.provider.name(),
            history = history.len(),
            "starting turn"
        );

        loop {
            let messages: Vec<Message> = history.iter().chain(staged.iter()).cloned().collect();
            let Exchange {
                mut response,
                results,
            } = self
                .exchange(&messages, self.tools.tools(), events, cancel)
                .await?;
            outcome.usage.accumulate(&response.usage);

            if response.reason == CompletionReason::MaxTokens {
                self.continue_truncated(&messages, &mut response, &mut outcome.usage, events, cancel)
                    .await?;
            }

            if self.mode == ResponseMode::Batch {
                let text = response.text();
                if !text.is_empty() {
                    emit(events, AgentEvent::Text(text));
                }
            }

            let results = match results {
                Some(results) => results,
                None => self.run_tools(&response, events, cancel).await?,
            };

            let text = response.text();
            if !text.is_empty() {
                texts.push(text);
            }
            if !response.blocks.is_empty() {
                staged.push(Message::from_blocks(Role::Assistant, response.blocks));
            }

            if results.is_empty() {
                break;
            }

            staged.push(Message::from_blocks(
                Role::Tool,
                results.into_iter().map(ContentBlock::ToolResult).collect(),
            ));
            depth += 1;
            outcome.rounds = depth;
            info!(round = depth, "tool round complete");

            if depth >= MAX_RECURSION_DEPTH {
                warn!(rounds = depth, "{}", RECURSION_LIMIT_NOTICE);
                emit(events, AgentEvent::Notice(RECURSION_LIMIT_NOTICE.to_string()));
                texts.push(RECURSION_LIMIT_NOTICE.to_string());
                outcome.truncated = true;
                break;
            }
        }

        conversation.extend(staged);
        outcome.text = texts.join("\n").trim().to_string();
        info!(
            rounds = outcome.rounds,
            truncated = outcome.truncated,
            "turn complete"
        );
        Ok(outcome)
    }

    /// Send one request and parse the response in the configured mode
    async fn exchange(
        &self,
        messages: &[Message],
        tools: &[Tool],
        events: Events<'_>,
        cancel: &CancellationToken,
    ) -> AgentResult<Exchange> {
        let system = self.system_prompt().await?;
        let streaming = self.mode == ResponseMode::Streaming;
        let body = self.provider.build_request(&CompletionRequest {
            system: &system,
            messages,
            tools,
            stream: streaming,
        })?;
        let endpoint = self.provider.endpoint();
        debug!(
            endpoint = %endpoint,
            messages = messages.len(),
            tools = tools.len(),
            streaming,
            "sending request"
        );

        if !streaming {
            let body = self
                .transport
                .post_json(&endpoint, self.provider.headers(), &body, cancel)
                .await?;
            let response = self.provider.parse_response(&body)?;
            debug!(
                blocks = response.blocks.len(),
                reason = ?response.reason,
                "parsed response"
            );
            return Ok(Exchange {
                response,
                results: None,
            });
        }

        let http = self
            .transport
            .post_stream(&endpoint, self.provider.headers(), &body, cancel)
            .await?;
        let mut stream = event_stream(http, self.provider.stream_decoder());
        let mut parser = StreamParser::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                next = stream.next() => next,
            };
            let Some(event) = next else {
                break;
            };

            match parser.handle(event?)? {
                ParserStep::Continue => {}
                ParserStep::Text(text) => emit(events, AgentEvent::Text(text)),
                ParserStep::ToolCall(call) => {
                    if cancel.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    let result = self
                        .run_tool(&call.tool_use, call.argument_error, events)
                        .await;
                    parser.record_result(result);
                }
                ParserStep::Finished => break,
            }
        }

        let (response, results) = parser.finish()?;
        debug!(
            blocks = response.blocks.len(),
            reason = ?response.reason,
            "stream complete"
        );
        Ok(Exchange {
            response,
            results: Some(results),
        })
    }

    /// Ask once for the rest of a response cut off by the token limit and
    /// append the extra text to it.
    async fn continue_truncated(
        &self,
        messages: &[Message],
        response: &mut ParsedResponse,
        usage: &mut Usage,
        events: Events<'_>,
        cancel: &CancellationToken,
    ) -> AgentResult<()> {
        info!("response hit the token limit, requesting continuation");
        let mut continuation = messages.to_vec();
        continuation.push(Message::assistant_text(response.text()));
        continuation.push(Message::user_text(CONTINUATION_PROMPT));

        let Exchange { response: rest, .. } =
            self.exchange(&continuation, &[], events, cancel).await?;
        usage.accumulate(&rest.usage);
        response.append_text(&rest.text());
        response.reason = rest.reason;
        Ok(())
    }

    /// Execute every tool call of a batch response in the order received
    async fn run_tools(
        &self,
        response: &ParsedResponse,
        events: Events<'_>,
        cancel: &CancellationToken,
    ) -> AgentResult<Vec<ToolResult>> {
        let mut results = Vec::new();
        for tool_use in response.tool_uses() {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let argument_error = response.invalid_arguments.get(&tool_use.id).cloned();
            results.push(self.run_tool(tool_use, argument_error, events).await);
        }
        Ok(results)
    }

    async fn run_tool(
        &self,
        tool_use: &ToolUse,
        argument_error: Option<String>,
        events: Events<'_>,
    ) -> ToolResult {
        emit(events, AgentEvent::ToolCall(tool_use.clone()));
        let output = match argument_error {
            Some(message) => ToolOutput::error(message),
            None => {
                self.tools
                    .execute(&tool_use.name, tool_use.arguments.clone())
                    .await
            }
        };
        debug!(
            tool = %tool_use.name,
            id = %tool_use.id,
            is_error = output.is_error,
            "tool finished"
        );
        let result = output.into_result(tool_use.id.clone());
        emit(events, AgentEvent::ToolResult(result.clone()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ToolCallResult, ToolError, TransportError};
    use crate::providers::configs::{AnthropicProviderConfig, BackendConfig};
    use crate::tools::Toolset;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct EchoTools {
        tools: Vec<Tool>,
    }

    impl EchoTools {
        fn new() -> Self {
            Self {
                tools: vec![
                    Tool::new(
                        "echo",
                        "Echoes back the input",
                        json!({"message": {"type": "string"}}),
                        ["message"],
                    ),
                    Tool::new("fail", "Always fails", json!({}), Vec::<String>::new()),
                ],
            }
        }
    }

    #[async_trait]
    impl Toolset for EchoTools {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo tools for testing"
        }

        fn instructions(&self) -> &str {
            "Use echo to repeat things"
        }

        fn tools(&self) -> &[Tool] {
            &self.tools
        }

        async fn call(&self, name: &str, arguments: Value) -> ToolCallResult<String> {
            match name {
                "echo" => Ok(arguments["message"].as_str().unwrap_or("").to_string()),
                "fail" => Err(ToolError::ExecutionError("no such file".into())),
                _ => Err(ToolError::ToolNotFound(name.to_string())),
            }
        }
    }

    fn text_body(text: &str, stop_reason: &str) -> Value {
        json!({
            "id": "msg",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "stop_reason": stop_reason,
            "usage": {"input_tokens": 10, "output_tokens": 5}
        })
    }

    fn tool_body(id: &str, name: &str, input: Value) -> Value {
        json!({
            "id": "msg",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "tool_use", "id": id, "name": name, "input": input}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        })
    }

    fn agent(server: &MockServer) -> Agent {
        let backend = BackendConfig::builder()
            .api_key("test")
            .base_url(server.uri())
            .model("claude-test")
            .build()
            .unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(EchoTools::new()).unwrap();
        Agent::from_config(
            ProviderConfig::Anthropic(AnthropicProviderConfig::new(backend)),
            Arc::new(registry),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        })
    }

    async fn mount_sequence(server: &MockServer, bodies: Vec<Value>) {
        // wiremock picks the first matching mock that still has budget, so
        // mounting one single-use mock per body replays them in order
        for body in bodies {
            Mock::given(method("POST"))
                .and(path("/v1/messages"))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .up_to_n_times(1)
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn test_text_reply_commits_user_and_assistant() -> Result<()> {
        let server = MockServer::start().await;
        mount_sequence(&server, vec![text_body("Hello!", "end_turn")]).await;

        let agent = agent(&server);
        let mut conversation = Conversation::new();
        let outcome = agent
            .reply(&mut conversation, "Hi", None, &CancellationToken::new())
            .await?;

        assert_eq!(outcome.text, "Hello!");
        assert_eq!(outcome.rounds, 0);
        assert!(!outcome.truncated);
        assert_eq!(outcome.usage.input_tokens, Some(10));
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.messages()[0].role, Role::User);
        assert_eq!(conversation.messages()[1].text(), "Hello!");
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_round_feeds_result_back() -> Result<()> {
        let server = MockServer::start().await;
        mount_sequence(
            &server,
            vec![
                tool_body("toolu_1", "echo", json!({"message": "ping"})),
                text_body("Done!", "end_turn"),
            ],
        )
        .await;

        let agent = agent(&server);
        let mut conversation = Conversation::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = agent
            .reply(&mut conversation, "Echo ping", Some(&tx), &CancellationToken::new())
            .await?;
        drop(tx);

        assert_eq!(outcome.text, "Done!");
        assert_eq!(outcome.rounds, 1);
        assert_eq!(conversation.len(), 4);
        let results = conversation.messages()[2].tool_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_use_id, "toolu_1");
        assert_eq!(results[0].output, "ping");
        assert!(!results[0].is_error);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event);
        }
        assert!(matches!(seen[0], AgentEvent::ToolCall(ref call) if call.name == "echo"));
        assert!(matches!(seen[1], AgentEvent::ToolResult(ref r) if r.output == "ping"));
        assert_eq!(seen[2], AgentEvent::Text("Done!".into()));

        // the second request carries the tool result back to the model
        let requests = server.received_requests().await.unwrap();
        let second: Value = serde_json::from_slice(&requests[1].body)?;
        let last = second["messages"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["role"], "user");
        assert_eq!(last["content"][0]["type"], "tool_result");
        assert_eq!(last["content"][0]["tool_use_id"], "toolu_1");
        Ok(())
    }

    #[tokio::test]
    async fn test_tool_failure_is_reported_to_model() -> Result<()> {
        let server = MockServer::start().await;
        mount_sequence(
            &server,
            vec![
                tool_body("toolu_1", "fail", json!({})),
                text_body("That file is missing.", "end_turn"),
            ],
        )
        .await;

        let agent = agent(&server);
        let mut conversation = Conversation::new();
        let outcome = agent
            .reply(&mut conversation, "Read it", None, &CancellationToken::new())
            .await?;

        assert_eq!(outcome.text, "That file is missing.");
        let result = conversation.messages()[2].tool_results()[0].clone();
        assert!(result.is_error);
        assert!(!result.output.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_conversation_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let agent = agent(&server);
        let mut conversation = Conversation::new();
        conversation.append(Message::user_text("earlier"));
        let err = agent
            .reply(&mut conversation, "Hi", None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AgentError::Transport(TransportError::Status { status: 500, .. })
        ));
        assert_eq!(conversation.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"content\": ["))
            .mount(&server)
            .await;

        let agent = agent(&server);
        let mut conversation = Conversation::new();
        let err = agent
            .reply(&mut conversation, "Hi", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ProtocolParse(_)));
        assert!(conversation.is_empty());
    }

    #[tokio::test]
    async fn test_recursion_limit_stops_after_twenty_rounds() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(tool_body("toolu", "echo", json!({"message": "again"}))),
            )
            .mount(&server)
            .await;

        let agent = agent(&server);
        let mut conversation = Conversation::new();
        let outcome = agent
            .reply(&mut conversation, "Loop", None, &CancellationToken::new())
            .await?;

        assert!(outcome.truncated);
        assert_eq!(outcome.rounds, MAX_RECURSION_DEPTH);
        assert!(outcome.text.ends_with(RECURSION_LIMIT_NOTICE));
        assert_eq!(
            server.received_requests().await.unwrap().len(),
            MAX_RECURSION_DEPTH
        );
        // user + 20 * (assistant, tool)
        assert_eq!(conversation.len(), 1 + 2 * MAX_RECURSION_DEPTH);
        Ok(())
    }

    #[tokio::test]
    async fn test_max_tokens_continues_once_without_tools() -> Result<()> {
        let server = MockServer::start().await;
        mount_sequence(
            &server,
            vec![
                text_body("The answer is", "max_tokens"),
                text_body(" forty-two.", "end_turn"),
            ],
        )
        .await;

        let agent = agent(&server);
        let mut conversation = Conversation::new();
        let outcome = agent
            .reply(&mut conversation, "Question", None, &CancellationToken::new())
            .await?;

        assert_eq!(outcome.text, "The answer is forty-two.");
        assert_eq!(outcome.rounds, 0);
        assert_eq!(outcome.usage.input_tokens, Some(20));
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.messages()[1].text(), "The answer is forty-two.");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let continuation: Value = serde_json::from_slice(&requests[1].body)?;
        assert!(continuation.get("tools").is_none());
        let last = continuation["messages"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["content"], CONTINUATION_PROMPT);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_system_prompt_is_rejected() {
        let server = MockServer::start().await;
        let err = agent(&server)
            .with_system_prompt("{% if %}")
            .err()
            .unwrap();
        assert!(matches!(
            err,
            AgentError::Config(ConfigError::Invalid {
                field: "system_prompt",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_context_is_rendered_into_every_request() -> Result<()> {
        let server = MockServer::start().await;
        mount_sequence(&server, vec![text_body("ok", "end_turn")]).await;

        let agent = agent(&server)
            .with_system_prompt("Context: {{ context }}")?
            .with_context(Arc::new(StaticContext("src/main.rs".into())));
        let mut conversation = Conversation::new();
        agent
            .reply(&mut conversation, "Hi", None, &CancellationToken::new())
            .await?;

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body)?;
        assert_eq!(body["system"], "Context: src/main.rs");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let server = MockServer::start().await;
        mount_sequence(&server, vec![text_body("never", "end_turn")]).await;

        let agent = agent(&server);
        let mut conversation = Conversation::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agent
            .reply(&mut conversation, "Hi", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert!(conversation.is_empty());
    }
}
