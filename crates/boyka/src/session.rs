//! A conversation owned by one worker task.
//!
//! Callers talk to the worker through a [`SessionHandle`]; commands are
//! handled one at a time, so a conversation never has two turns in flight.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::agent::{Agent, AgentEvent, TurnOutcome};
use crate::conversation::Conversation;
use crate::errors::{AgentError, AgentResult};
use crate::models::message::Message;

const COMMAND_BUFFER: usize = 32;

enum Command {
    Send {
        text: String,
        events: mpsc::UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
        reply: oneshot::Sender<AgentResult<TurnOutcome>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Arc<[Message]>>,
    },
}

/// One agent paired with the conversation it extends
pub struct Session {
    agent: Agent,
    conversation: Conversation,
}

impl Session {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            conversation: Conversation::new(),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub async fn send(
        &mut self,
        text: &str,
        events: Option<&mpsc::UnboundedSender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> AgentResult<TurnOutcome> {
        self.agent
            .reply(&mut self.conversation, text, events, cancel)
            .await
    }

    pub fn clear(&mut self) {
        self.conversation.clear();
    }

    /// Move the session onto its own task
    pub fn spawn(mut self) -> SessionHandle {
        let (commands, mut receiver) = mpsc::channel(COMMAND_BUFFER);

        tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Send {
                        text,
                        events,
                        cancel,
                        reply,
                    } => {
                        let outcome = self.send(&text, Some(&events), &cancel).await;
                        match &outcome {
                            Err(AgentError::Cancelled) => debug!("turn cancelled"),
                            Err(err) => error!(error = %err, "turn failed"),
                            Ok(_) => {}
                        }
                        let _ = reply.send(outcome);
                    }
                    Command::Clear { reply } => {
                        self.clear();
                        let _ = reply.send(());
                    }
                    Command::Snapshot { reply } => {
                        let _ = reply.send(self.conversation.snapshot());
                    }
                }
            }
            debug!("session worker stopped");
        });

        SessionHandle { commands }
    }
}

fn worker_gone<T>(_: T) -> AgentError {
    AgentError::Internal("session worker is no longer running".to_string())
}

#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Queue a user message. Turns run in the order they were queued.
    pub async fn send<S: Into<String>>(&self, text: S) -> AgentResult<PendingTurn> {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (reply, outcome) = oneshot::channel();
        let cancel = CancellationToken::new();

        self.commands
            .send(Command::Send {
                text: text.into(),
                events,
                cancel: cancel.clone(),
                reply,
            })
            .await
            .map_err(worker_gone)?;

        Ok(PendingTurn {
            events: UnboundedReceiverStream::new(event_rx),
            cancel,
            outcome,
        })
    }

    /// Empty the conversation once every earlier command has finished
    pub async fn clear(&self) -> AgentResult<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Clear { reply })
            .await
            .map_err(worker_gone)?;
        done.await.map_err(worker_gone)
    }

    pub async fn snapshot(&self) -> AgentResult<Arc<[Message]>> {
        let (reply, snapshot) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(worker_gone)?;
        snapshot.await.map_err(worker_gone)
    }
}

/// A queued turn. Events end once the turn finishes.
pub struct PendingTurn {
    events: UnboundedReceiverStream<AgentEvent>,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<AgentResult<TurnOutcome>>,
}

impl PendingTurn {
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.next().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn outcome(self) -> AgentResult<TurnOutcome> {
        self.outcome.await.map_err(worker_gone)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::configs::{BackendConfig, OpenAiProviderConfig, ProviderConfig};
    use crate::tools::ToolRegistry;
    use crate::transport::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion(text: &str) -> serde_json::Value {
        json!({
            "choices": [{
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })
    }

    fn session(server: &MockServer) -> Session {
        let backend = BackendConfig::builder()
            .api_key("test")
            .base_url(server.uri())
            .model("gpt-test")
            .build()
            .unwrap();
        let agent = Agent::from_config(
            ProviderConfig::OpenAi(OpenAiProviderConfig::new(backend)),
            Arc::new(ToolRegistry::new()),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        });
        Session::new(agent)
    }

    #[tokio::test]
    async fn test_turns_run_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("first")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("second")))
            .mount(&server)
            .await;

        let handle = session(&server).spawn();
        let first = handle.send("one").await.unwrap();
        let second = handle.send("two").await.unwrap();

        assert_eq!(first.outcome().await.unwrap().text, "first");
        assert_eq!(second.outcome().await.unwrap().text, "second");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 4);
        assert_eq!(snapshot[0].text(), "one");
        assert_eq!(snapshot[2].text(), "two");
    }

    #[tokio::test]
    async fn test_events_end_with_the_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("hello")))
            .mount(&server)
            .await;

        let handle = session(&server).spawn();
        let mut turn = handle.send("hi").await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = turn.next_event().await {
            events.push(event);
        }
        assert_eq!(events, vec![AgentEvent::Text("hello".into())]);
        assert_eq!(turn.outcome().await.unwrap().text, "hello");
    }

    #[tokio::test]
    async fn test_clear_empties_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
            .mount(&server)
            .await;

        let handle = session(&server).spawn();
        handle.send("hi").await.unwrap().outcome().await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap().len(), 2);

        handle.clear().await.unwrap();
        assert!(handle.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_turn_is_not_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("late"))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let handle = session(&server).spawn();
        let turn = handle.send("hi").await.unwrap();
        turn.cancel();

        assert!(matches!(
            turn.outcome().await.unwrap_err(),
            AgentError::Cancelled
        ));
        assert!(handle.snapshot().await.unwrap().is_empty());
    }
}
