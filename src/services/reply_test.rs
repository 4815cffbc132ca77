use tokio::sync::{
    Notify,
    mpsc::{self, UnboundedReceiver},
};

use super::*;
use crate::{
    backend::{Backend, MockBackend},
    cancellation::CancellationRegistry,
    models::{ProjectId, Sender},
    storage::{Sqlite, Storage},
};

/// Parks inside the model call until released, so tests can act while a
/// reply is mid-generation.
#[derive(Default)]
struct GatedBackend {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl Backend for GatedBackend {
    fn name(&self) -> &str {
        "gated"
    }

    async fn complete(&self, _turns: Vec<Turn>) -> Result<String> {
        self.started.notify_one();
        self.release.notified().await;
        Ok("late reply".to_string())
    }

    async fn stream(&self, _turns: Vec<Turn>, sink: ArcReplySink) -> Result<String> {
        sink.partial("early").await;
        self.started.notify_one();
        self.release.notified().await;
        sink.partial("early and late").await;
        Ok("early and late".to_string())
    }
}

struct Fixture {
    storage: Arc<Sqlite>,
    registry: ArcRegistry,
    event_tx: ArcEventTx,
    event_rx: UnboundedReceiver<Event>,
    project_id: ProjectId,
}

impl Fixture {
    async fn new() -> Self {
        let registry = Arc::new(CancellationRegistry::new());
        let storage = Arc::new(Sqlite::open_in_memory(registry.clone()).await.unwrap());
        let project_id = storage.create_project("Work", None).await.unwrap().id();
        let (tx, event_rx) = mpsc::unbounded_channel::<Event>();
        Self {
            storage,
            registry,
            event_tx: Arc::new(tx),
            event_rx,
            project_id,
        }
    }

    fn service(&self, backend: ArcBackend) -> ReplyService {
        ReplyService::new(
            self.storage.clone(),
            backend,
            self.registry.clone(),
            self.event_tx.clone(),
        )
    }

    fn drain_events(&mut self) -> Vec<Event> {
        let mut events = vec![];
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[tokio::test]
async fn test_send_commits_reply() {
    let mut fixture = Fixture::new().await;
    let mut backend = MockBackend::new();
    backend
        .expect_complete()
        .withf(|turns| turns == &vec![Turn::user("hello")])
        .times(1)
        .returning(|_| Ok("hi there".to_string()));
    backend.expect_stream().never();

    let pending = fixture
        .service(Arc::new(backend))
        .send(
            MessageTarget::NewConversation(Some(fixture.project_id)),
            MessageKind::Text,
            "hello",
        )
        .await
        .unwrap();
    let conversation_id = pending.conversation_id();
    assert_eq!(pending.message().content(), "hello");

    let reply = match pending.wait().await.unwrap() {
        ReplyOutcome::Committed(reply) => reply,
        other => panic!("expected a committed reply, got {other:?}"),
    };
    assert_eq!(reply.content(), "hi there");
    assert_eq!(reply.sender(), Sender::Agent);

    let messages = fixture.storage.list_messages(conversation_id).await.unwrap();
    let contents = messages.iter().map(|m| m.content()).collect::<Vec<_>>();
    assert_eq!(contents, vec!["hello", "hi there"]);
    assert!(fixture.registry.is_empty());

    let events = fixture.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Event::ReplyCommitted(m) if m == &reply));
}

#[tokio::test]
async fn test_stream_forwards_partials() {
    let mut fixture = Fixture::new().await;
    let backend = Arc::new(GatedBackend::default());
    backend.release.notify_one();

    let pending = fixture
        .service(backend.clone())
        .with_stream(true)
        .send(MessageTarget::NewConversation(None), MessageKind::Voice, "hi")
        .await
        .unwrap();
    let conversation_id = pending.conversation_id();
    let outcome = pending.wait().await.unwrap();
    assert!(outcome.is_committed());

    let events = fixture.drain_events();
    assert!(events.iter().all(|e| e.conversation_id() == conversation_id));
    let partials = events
        .iter()
        .filter_map(|e| match e {
            Event::ReplyPartial { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(partials, vec!["early", "early and late"]);
    assert!(matches!(events.last(), Some(Event::ReplyCommitted(m)) if m.content() == "early and late"));
}

#[tokio::test]
async fn test_stream_failure_falls_back_to_complete() {
    let fixture = Fixture::new().await;
    let mut backend = MockBackend::new();
    backend.expect_name().return_const("mock".to_string());
    backend
        .expect_stream()
        .times(1)
        .returning(|_, _| Err(eyre::eyre!("connection reset")));
    backend
        .expect_complete()
        .times(1)
        .returning(|_| Ok("fallback".to_string()));

    let outcome = fixture
        .service(Arc::new(backend))
        .with_stream(true)
        .send(MessageTarget::NewConversation(None), MessageKind::Text, "hi")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(matches!(outcome, ReplyOutcome::Committed(m) if m.content() == "fallback"));
}

#[tokio::test]
async fn test_model_failure_persists_placeholder() {
    let fixture = Fixture::new().await;
    let mut backend = MockBackend::new();
    backend
        .expect_complete()
        .returning(|_| Err(eyre::eyre!("connection refused")));

    let pending = fixture
        .service(Arc::new(backend))
        .send(MessageTarget::NewConversation(None), MessageKind::Text, "hi")
        .await
        .unwrap();
    let conversation_id = pending.conversation_id();
    let outcome = pending.wait().await.unwrap();
    assert!(outcome.is_committed());

    let messages = fixture.storage.list_messages(conversation_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].sender(), Sender::Agent);
    assert_eq!(messages[1].content(), "[Model error] connection refused");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_project_during_generation() {
    let mut fixture = Fixture::new().await;
    let backend = Arc::new(GatedBackend::default());

    let pending = fixture
        .service(backend.clone())
        .send(
            MessageTarget::NewConversation(Some(fixture.project_id)),
            MessageKind::Text,
            "hello",
        )
        .await
        .unwrap();
    let conversation_id = pending.conversation_id();

    backend.started.notified().await;
    let removed = fixture
        .storage
        .delete_project(fixture.project_id)
        .await
        .unwrap();
    assert_eq!(removed, vec![conversation_id]);
    backend.release.notify_one();

    let outcome = pending.wait().await.unwrap();
    assert_eq!(outcome, ReplyOutcome::Discarded(conversation_id));

    assert!(
        fixture
            .storage
            .list_conversations(Some(fixture.project_id))
            .await
            .unwrap()
            .is_empty()
    );
    assert!(fixture.storage.list_messages(conversation_id).await.unwrap().is_empty());
    assert!(fixture.registry.is_empty());

    let events = fixture.drain_events();
    assert!(matches!(events.as_slice(), [Event::ReplyDiscarded(id)] if *id == conversation_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partials_stop_after_cancel() {
    let mut fixture = Fixture::new().await;
    let backend = Arc::new(GatedBackend::default());
    let conversation = fixture
        .storage
        .create_conversation(Some(fixture.project_id), Some("notes"))
        .await
        .unwrap();

    let pending = fixture
        .service(backend.clone())
        .with_stream(true)
        .send(
            MessageTarget::Conversation(conversation.id()),
            MessageKind::Text,
            "hello",
        )
        .await
        .unwrap();

    backend.started.notified().await;
    fixture
        .storage
        .delete_conversation(conversation.id())
        .await
        .unwrap();
    backend.release.notify_one();

    let outcome = pending.wait().await.unwrap();
    assert_eq!(outcome, ReplyOutcome::Discarded(conversation.id()));

    let events = fixture.drain_events();
    assert_eq!(events.len(), 2, "unexpected events: {events:?}");
    assert!(matches!(&events[0], Event::ReplyPartial { text, .. } if text == "early"));
    assert!(matches!(&events[1], Event::ReplyDiscarded(id) if *id == conversation.id()));
}

#[tokio::test]
async fn test_send_to_missing_conversation() {
    let fixture = Fixture::new().await;
    let err = fixture
        .service(Arc::new(MockBackend::new()))
        .send(MessageTarget::Conversation(404), MessageKind::Text, "hello")
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());
    assert!(fixture.registry.is_empty());
}
