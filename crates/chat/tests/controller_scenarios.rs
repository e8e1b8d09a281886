use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use palaver_chat::{ChatError, ChatRequest, Controller, ConversationId, DispatchContext};
use palaver_llm::{
    BackendError, BackendOptions, BackendResult, BoxFuture, Choice, CompletionBackend,
    CompletionRequest, CompletionResponse, Message, MockBackend, Role, SharedBackend, Usage,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn fast_mock() -> SharedBackend {
    Arc::new(MockBackend::new().with_latency(Duration::from_millis(1)))
}

fn controller() -> Controller {
    Controller::with_default_config(fast_mock())
}

fn reply(request: &CompletionRequest, content: &str) -> CompletionResponse {
    CompletionResponse {
        id: "chatcmpl-test".to_string(),
        object: "chat.completion".to_string(),
        created: 0,
        model: request.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: Message::assistant(content),
            finish_reason: "stop".to_string(),
        }],
        usage: Usage::new(1, 1),
    }
}

/// Always fails with a non-cancellation error.
struct FailingBackend;

impl CompletionBackend for FailingBackend {
    fn name(&self) -> String {
        "failing".to_string()
    }

    fn complete<'a>(
        &'a self,
        _cancel: CancellationToken,
        _request: CompletionRequest,
    ) -> BoxFuture<'a, BackendResult<CompletionResponse>> {
        Box::pin(async {
            Err(BackendError::ModelFetchStatus {
                stage: "test-complete",
                status: 503,
                body: "unavailable".to_string(),
            })
        })
    }

    fn is_available<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async { false })
    }

    fn configure(&self, _options: &BackendOptions) -> BackendResult<()> {
        Ok(())
    }
}

/// Succeeds with zero choices.
struct EmptyBackend;

impl CompletionBackend for EmptyBackend {
    fn name(&self) -> String {
        "empty".to_string()
    }

    fn complete<'a>(
        &'a self,
        _cancel: CancellationToken,
        request: CompletionRequest,
    ) -> BoxFuture<'a, BackendResult<CompletionResponse>> {
        Box::pin(async move {
            let mut response = reply(&request, "unused");
            response.choices.clear();
            Ok(response)
        })
    }

    fn is_available<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }

    fn configure(&self, _options: &BackendOptions) -> BackendResult<()> {
        Ok(())
    }
}

/// Replies with its own tag after a delay, ignoring cancellation.
struct TaggedBackend {
    tag: &'static str,
    delay: Duration,
}

impl CompletionBackend for TaggedBackend {
    fn name(&self) -> String {
        self.tag.to_string()
    }

    fn complete<'a>(
        &'a self,
        _cancel: CancellationToken,
        request: CompletionRequest,
    ) -> BoxFuture<'a, BackendResult<CompletionResponse>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(reply(&request, self.tag))
        })
    }

    fn is_available<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            true
        })
    }

    fn configure(&self, _options: &BackendOptions) -> BackendResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn single_turn_on_empty_conversation() {
    let controller = controller();
    let conversation = controller.create_conversation(None).await;

    let response = controller
        .send_message(
            &DispatchContext::background(),
            ChatRequest::new("Hello, world!").in_conversation(conversation.id),
        )
        .await
        .unwrap();

    let stored = controller.get_conversation(conversation.id).await.unwrap();
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[0], Message::user("Hello, world!"));
    assert_eq!(stored.messages[1].role, Role::Assistant);
    assert!(!stored.messages[1].content.is_empty());
    assert_eq!(response.message, stored.messages[1]);
    assert!(response.completion.is_some());
}

#[tokio::test]
async fn two_turns_with_system_prompt_summarize() {
    let controller = controller();
    let id = controller
        .create_conversation(Some("You are helpful"))
        .await
        .id;
    let context = DispatchContext::background();

    for text in ["first", "second"] {
        controller
            .send_message(&context, ChatRequest::new(text).in_conversation(id))
            .await
            .unwrap();
    }

    let summary = controller.summary(id).await.unwrap();
    assert_eq!(summary.system_messages, 1);
    assert_eq!(summary.user_messages, 2);
    assert_eq!(summary.assistant_messages, 2);
    assert_eq!(summary.message_count, 5);
    assert_eq!(summary.last_user_message.as_deref(), Some("second"));
    assert_eq!(
        summary.message_count,
        controller.get_conversation(id).await.unwrap().messages.len()
    );
}

#[tokio::test]
async fn pre_cancelled_dispatch_keeps_only_user_message() {
    let controller = controller();
    let id = controller.create_conversation(None).await.id;
    let context = DispatchContext::background();
    context.cancel();

    let error = controller
        .send_message(&context, ChatRequest::new("never answered").in_conversation(id))
        .await
        .unwrap_err();

    assert!(matches!(error, ChatError::CancelledOrTimedOut { .. }));
    let pending = error.pending_response().unwrap();
    assert_eq!(pending.conversation_id, id);
    assert_eq!(pending.message, Message::user("never answered"));
    assert!(pending.error.is_some());

    let stored = controller.get_conversation(id).await.unwrap();
    assert_eq!(stored.messages, vec![Message::user("never answered")]);
}

#[tokio::test]
async fn deadline_interrupts_slow_backend() {
    let controller = Controller::with_default_config(Arc::new(
        MockBackend::new().with_latency(Duration::from_secs(30)),
    ));
    let id = controller.create_conversation(None).await.id;

    let started = Instant::now();
    let error = controller
        .send_message(
            &DispatchContext::with_timeout(Duration::from_millis(20)),
            ChatRequest::new("slow").in_conversation(id),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, ChatError::CancelledOrTimedOut { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        controller.get_conversation(id).await.unwrap().messages.len(),
        1
    );
}

#[tokio::test]
async fn cancelling_external_token_mid_flight() {
    let controller = Arc::new(Controller::with_default_config(Arc::new(
        MockBackend::new().with_latency(Duration::from_secs(30)),
    )));
    let id = controller.create_conversation(None).await.id;
    let token = CancellationToken::new();
    let context = DispatchContext::with_token(token.clone());

    let task = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller
                .send_message(&context, ChatRequest::new("stop me").in_conversation(id))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let error = task.await.unwrap().unwrap_err();
    assert!(matches!(error, ChatError::CancelledOrTimedOut { .. }));
}

#[tokio::test]
async fn backend_failure_keeps_user_message() {
    let controller = Controller::with_default_config(Arc::new(FailingBackend));
    let id = controller.create_conversation(Some("sys")).await.id;

    let error = controller
        .send_message(
            &DispatchContext::background(),
            ChatRequest::new("hello").in_conversation(id),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, ChatError::Backend { .. }));
    assert!(error.pending_response().unwrap().error.is_some());
    let stored = controller.get_conversation(id).await.unwrap();
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.messages[1], Message::user("hello"));
}

#[tokio::test]
async fn empty_completion_is_reported() {
    let controller = Controller::with_default_config(Arc::new(EmptyBackend));
    let id = controller.create_conversation(None).await.id;

    let error = controller
        .send_message(
            &DispatchContext::background(),
            ChatRequest::new("anyone?").in_conversation(id),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, ChatError::EmptyCompletion { .. }));
    assert_eq!(
        controller.get_conversation(id).await.unwrap().messages.len(),
        1
    );
}

#[tokio::test]
async fn deletion_mid_flight_reports_pending_turn() {
    let controller = Arc::new(Controller::with_default_config(Arc::new(
        MockBackend::new().with_latency(Duration::from_millis(100)),
    )));
    let id = controller.create_conversation(None).await.id;

    let in_flight = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller
                .send_message(
                    &DispatchContext::background(),
                    ChatRequest::new("are you there?").in_conversation(id),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    controller.delete_conversation(id).await.unwrap();

    let error = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(error, ChatError::ConversationRemoved { .. }));
    assert!(error.is_not_found());

    let pending = error.pending_response().unwrap();
    assert_eq!(pending.conversation_id, id);
    assert_eq!(pending.message, Message::user("are you there?"));
    assert!(pending.error.is_some());
    assert!(pending.completion.is_some());

    assert!(controller.get_conversation(id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn unknown_conversation_is_rejected_before_dispatch() {
    let controller = controller();
    let error = controller
        .send_message(
            &DispatchContext::background(),
            ChatRequest::new("hi").in_conversation(ConversationId::new_v7()),
        )
        .await
        .unwrap_err();

    assert!(error.is_not_found());
    assert!(error.pending_response().is_none());
    assert!(controller.list_conversations().await.is_empty());
}

#[tokio::test]
async fn delete_then_get_is_not_found_and_id_is_not_reused() {
    let controller = controller();
    let id = controller.create_conversation(None).await.id;

    controller.delete_conversation(id).await.unwrap();
    assert!(controller.get_conversation(id).await.unwrap_err().is_not_found());
    assert!(controller.delete_conversation(id).await.unwrap_err().is_not_found());
    assert!(controller.summary(id).await.unwrap_err().is_not_found());

    for _ in 0..100 {
        assert_ne!(controller.create_conversation(None).await.id, id);
    }
}

#[tokio::test]
async fn clear_retains_system_messages_only() {
    let controller = controller();
    let id = controller.create_conversation(Some("rules")).await.id;
    let context = DispatchContext::background();
    for text in ["a", "b", "c"] {
        controller
            .send_message(&context, ChatRequest::new(text).in_conversation(id))
            .await
            .unwrap();
    }

    controller.clear_conversation(id).await.unwrap();

    let stored = controller.get_conversation(id).await.unwrap();
    assert_eq!(stored.messages, vec![Message::system("rules")]);
}

#[tokio::test]
async fn reads_leave_updated_at_alone() {
    let controller = controller();
    let id = controller.create_conversation(Some("sys")).await.id;
    let before = controller.get_conversation(id).await.unwrap().updated_at;

    tokio::time::sleep(Duration::from_millis(5)).await;
    controller.summary(id).await.unwrap();
    controller.list_conversations().await;
    controller.stats().await;
    controller.set_metadata(id, "topic", "testing").await.unwrap();

    let after = controller.get_conversation(id).await.unwrap();
    assert_eq!(after.updated_at, before);
    assert_eq!(after.metadata.get("topic").map(String::as_str), Some("testing"));
}

#[tokio::test]
async fn writes_advance_updated_at() {
    let controller = controller();
    let id = controller.create_conversation(None).await.id;
    let created = controller.get_conversation(id).await.unwrap();

    controller
        .send_message(
            &DispatchContext::background(),
            ChatRequest::new("tick").in_conversation(id),
        )
        .await
        .unwrap();

    let updated = controller.get_conversation(id).await.unwrap();
    assert!(updated.updated_at >= created.updated_at);
    assert!(updated.updated_at >= updated.created_at);
    assert_eq!(updated.created_at, created.created_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_yield_unique_ids() {
    let controller = Arc::new(controller());

    let handles = (0..200).map(|_| {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.create_conversation(None).await.id })
    });
    let ids: HashSet<ConversationId> = join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(ids.len(), 200);
    assert_eq!(controller.stats().await.total_conversations, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_keep_counts_consistent() {
    let controller = Arc::new(controller());

    let handles = (0..20).map(|caller| {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let id = controller.create_conversation(None).await.id;
            let context = DispatchContext::background();
            for turn in 0..5 {
                controller
                    .send_message(
                        &context,
                        ChatRequest::new(format!("caller {caller} turn {turn}"))
                            .in_conversation(id),
                    )
                    .await
                    .unwrap();
            }
            id
        })
    });
    let ids: Vec<ConversationId> = join_all(handles)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let mut per_conversation = 0;
    for id in &ids {
        let conversation = controller.get_conversation(*id).await.unwrap();
        assert_eq!(conversation.messages.len(), 10);
        for pair in conversation.messages.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
        }
        per_conversation += conversation.messages.len();
    }

    let stats = controller.stats().await;
    assert_eq!(stats.total_conversations, 20);
    assert_eq!(stats.total_messages, per_conversation);
    assert_eq!(stats.total_messages, 200);
}

#[tokio::test]
async fn swapped_backend_applies_to_later_dispatches_only() {
    let controller = Arc::new(Controller::with_default_config(Arc::new(TaggedBackend {
        tag: "first",
        delay: Duration::from_millis(100),
    })));
    let id = controller.create_conversation(None).await.id;

    let in_flight = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller
                .send_message(
                    &DispatchContext::background(),
                    ChatRequest::new("one").in_conversation(id),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    controller.set_backend(Arc::new(TaggedBackend {
        tag: "second",
        delay: Duration::from_millis(1),
    }));

    let first = in_flight.await.unwrap().unwrap();
    assert_eq!(first.message.content, "first");
    assert_eq!(controller.backend().name(), "second");

    let second = controller
        .send_message(
            &DispatchContext::background(),
            ChatRequest::new("two").in_conversation(id),
        )
        .await
        .unwrap();
    assert_eq!(second.message.content, "second");
    assert_eq!(controller.stats().await.backend_name, "second");
}

#[tokio::test]
async fn availability_probe_respects_deadline() {
    let controller = Controller::with_default_config(Arc::new(TaggedBackend {
        tag: "sleepy",
        delay: Duration::from_secs(30),
    }));

    let available = controller
        .is_backend_available(&DispatchContext::with_timeout(Duration::from_millis(10)))
        .await;
    assert!(!available);

    controller.set_backend(fast_mock());
    assert!(
        controller
            .is_backend_available(&DispatchContext::background())
            .await
    );
}

#[tokio::test]
async fn configure_reaches_active_backend() {
    let controller = controller();
    let options = serde_json::json!({"name": "Renamed", "latency_ms": 2});

    controller
        .configure_backend(options.as_object().unwrap())
        .unwrap();

    assert_eq!(controller.backend().name(), "Renamed");
}

#[tokio::test]
async fn stats_on_empty_controller() {
    let stats = controller().stats().await;
    assert_eq!(stats.total_conversations, 0);
    assert_eq!(stats.total_messages, 0);
    assert!(stats.oldest_conversation.is_none());
    assert!(stats.newest_conversation.is_none());
}
