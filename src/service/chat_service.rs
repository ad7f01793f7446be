use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{open_stream, FragmentStream, TokenSource, TurnRequest};
use crate::db::conversation_repository::ConversationRepository;
use crate::db::kv_store::KeyValueStore;
use crate::db::settings_repository::SettingsRepository;
use crate::errors::AppError;
use crate::models::{Conversation, GenerationSettings, Message, ModelInfo, SettingsPatch};
use crate::service::turn::{self, AbortReason, TurnPhase};

/// Progress of a turn driven by [`ChatService::run_turn`]. Each event is sent
/// after the corresponding state has been written to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Submitted { conversation_id: String, message: Message },
    Started { conversation_id: String, message_id: String },
    Fragment { conversation_id: String, message_id: String, text: String },
    Settled { conversation_id: String, message_id: String, content: String },
    Aborted {
        conversation_id: String,
        message_id: Option<String>,
        reason: AbortReason,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnStatus {
    Settled,
    Aborted(AbortReason),
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation: Conversation,
    pub message_id: Option<String>,
    pub status: TurnStatus,
}

impl TurnOutcome {
    pub fn is_settled(&self) -> bool {
        self.status == TurnStatus::Settled
    }

    /// The assistant message this turn produced, if it got that far.
    pub fn reply(&self) -> Option<&Message> {
        let id = self.message_id.as_deref()?;
        self.conversation.messages.iter().find(|m| m.id == id)
    }
}

/// A turn in the `Streaming` phase, returned by [`ChatService::begin_turn`].
/// The caller owns the stream and must close it before settling or aborting.
pub struct OpenTurn {
    pub message_id: String,
    pub stream: FragmentStream,
}

/// Identity and stop signal of the turn currently holding the engine.
#[derive(Clone)]
struct ActiveTurn {
    seq: u64,
    cancel: CancellationToken,
}

struct Engine {
    conversations: ConversationRepository,
    settings: GenerationSettings,
    settings_dirty: bool,
    selected: Option<String>,
    turn: TurnPhase,
    active: Option<ActiveTurn>,
    next_seq: u64,
}

impl Engine {
    fn find(&self, id: &str) -> Result<Conversation, AppError> {
        self.conversations
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::ConversationNotFound { id: id.to_string() })
    }

    fn selected_snapshot(&self) -> Option<Conversation> {
        self.selected
            .as_deref()
            .and_then(|id| self.conversations.get(id))
            .cloned()
    }
}

struct Inner {
    engine: Mutex<Engine>,
    settings_repo: SettingsRepository,
    source: Arc<dyn TokenSource>,
    current: watch::Sender<Option<Conversation>>,
}

/// Owns the conversation collection, the selection, the generation settings
/// and the single active turn.
///
/// Every mutation runs under one lock and finishes its store write before the
/// lock is released, so mutations are applied and persisted in program order.
/// The selected conversation is also published on a watch channel for readers
/// that must not wait on the lock.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<Inner>,
}

impl ChatService {
    pub async fn open(
        kv: Arc<dyn KeyValueStore>,
        source: Arc<dyn TokenSource>,
    ) -> Result<Self, AppError> {
        let conversations = ConversationRepository::load(Arc::clone(&kv)).await?;
        let settings_repo = SettingsRepository::new(kv);
        let settings = settings_repo.load().await?;

        let selected = most_recent(conversations.list()).map(|c| c.id.clone());
        let engine = Engine {
            conversations,
            settings,
            selected,
            settings_dirty: false,
            turn: TurnPhase::Idle,
            active: None,
            next_seq: 0,
        };
        let (current, _) = watch::channel(engine.selected_snapshot());

        Ok(Self {
            inner: Arc::new(Inner {
                engine: Mutex::new(engine),
                settings_repo,
                source,
                current,
            }),
        })
    }

    // ── Turn lifecycle ────────────────────────────────────────────────────────

    /// Appends the user message and moves to `Submitting`.
    pub async fn submit(&self, conversation_id: &str, text: &str) -> Result<Message, AppError> {
        self.submit_turn(conversation_id, text)
            .await
            .map(|(message, _)| message)
    }

    async fn submit_turn(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<(Message, ActiveTurn), AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::empty_field("message"));
        }

        let mut engine = self.inner.engine.lock().await;
        if let Some(active) = engine.turn.active_conversation() {
            warn!(conversation_id, active, "Rejected submission while a turn is active");
            return Err(AppError::TurnInProgress { conversation_id: active.to_string() });
        }

        let mut conversation = engine.find(conversation_id)?;
        let model = engine.settings.model.clone();
        let message = turn::append_user_message(&mut conversation, text, &model);
        engine.next_seq += 1;
        let active = ActiveTurn { seq: engine.next_seq, cancel: CancellationToken::new() };
        engine.turn = TurnPhase::Submitting { conversation_id: conversation_id.to_string() };
        engine.active = Some(active.clone());
        self.commit(&mut engine, conversation).await;

        info!(conversation_id, message_id = %message.id, turn = active.seq, "Turn submitted");
        Ok((message, active))
    }

    /// Appends the empty assistant message, moves to `Streaming` and opens the
    /// token source with the history before that message and a settings snapshot.
    pub async fn begin_turn(&self, conversation_id: &str) -> Result<OpenTurn, AppError> {
        self.open_turn(conversation_id, None).await
    }

    /// `begin_turn`, optionally pinned to the turn numbered `seq`.
    async fn open_turn(&self, conversation_id: &str, seq: Option<u64>) -> Result<OpenTurn, AppError> {
        let mut engine = self.inner.engine.lock().await;
        let same_turn = seq.is_none() || engine.active.as_ref().map(|a| a.seq) == seq;
        match &engine.turn {
            TurnPhase::Submitting { conversation_id: active } if active == conversation_id && same_turn => {}
            other => return Err(other.reject("begin a turn in", conversation_id)),
        }

        let mut conversation = engine.find(conversation_id)?;
        let settings = engine.settings.clone();
        let history = conversation.messages.clone();
        let reply = turn::append_assistant_message(&mut conversation, &settings.model);
        engine.turn = TurnPhase::Streaming {
            conversation_id: conversation_id.to_string(),
            message_id: reply.id.clone(),
        };
        self.commit(&mut engine, conversation).await;
        drop(engine);

        info!(conversation_id, message_id = %reply.id, model = %settings.model, "Turn streaming");
        let stream = open_stream(Arc::clone(&self.inner.source), TurnRequest { history, settings });
        Ok(OpenTurn { message_id: reply.id, stream })
    }

    /// Appends `fragment` to the reply `message_id` and persists. Rejected unless
    /// that reply is the one currently streaming.
    pub async fn merge_fragment(
        &self,
        conversation_id: &str,
        message_id: &str,
        fragment: &str,
    ) -> Result<(), AppError> {
        let mut engine = self.inner.engine.lock().await;
        if engine.turn.streaming_message(conversation_id) != Some(message_id) {
            return Err(engine.turn.reject("merge a fragment into", conversation_id));
        }
        if fragment.is_empty() {
            return Ok(());
        }

        let mut conversation = engine.find(conversation_id)?;
        turn::append_fragment(&mut conversation, message_id, fragment)?;
        self.commit(&mut engine, conversation).await;
        Ok(())
    }

    /// Normal completion of the reply `message_id`: back to `Idle`.
    pub async fn settle_turn(&self, conversation_id: &str, message_id: &str) -> Result<Conversation, AppError> {
        let mut engine = self.inner.engine.lock().await;
        if engine.turn.streaming_message(conversation_id) != Some(message_id) {
            return Err(engine.turn.reject("settle", conversation_id));
        }
        self.finish(&mut engine).await;
        let conversation = engine.find(conversation_id)?;
        info!(conversation_id, message_id, "Turn settled");
        Ok(conversation)
    }

    /// Early termination: back to `Idle`, keeping whatever was merged. A
    /// `run_turn` driving this turn stops consuming and closes its stream.
    pub async fn abort_turn(
        &self,
        conversation_id: &str,
        reason: AbortReason,
    ) -> Result<Conversation, AppError> {
        let mut engine = self.inner.engine.lock().await;
        if engine.turn.active_conversation() != Some(conversation_id) {
            return Err(engine.turn.reject("abort", conversation_id));
        }
        self.finish(&mut engine).await;
        let conversation = engine.find(conversation_id)?;
        warn!(conversation_id, %reason, "Turn aborted");
        Ok(conversation)
    }

    /// Asks the active turn to stop. Returns `false` when nothing is running.
    pub async fn cancel_turn(&self) -> bool {
        let engine = self.inner.engine.lock().await;
        match (&engine.active, engine.turn.active_conversation()) {
            (Some(active), Some(conversation_id)) => {
                info!(conversation_id, turn = active.seq, "Cancellation requested");
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Ends turn `seq` on behalf of `run_turn`. When that turn was already ended
    /// through `abort_turn`, nothing changes and the outcome reads as cancelled.
    async fn close_turn(
        &self,
        conversation_id: &str,
        seq: u64,
        status: TurnStatus,
    ) -> Result<(Conversation, TurnStatus), AppError> {
        let mut engine = self.inner.engine.lock().await;
        if engine.active.as_ref().map(|a| a.seq) != Some(seq) {
            debug!(conversation_id, turn = seq, "Turn already ended");
            let conversation = engine.find(conversation_id)?;
            return Ok((conversation, TurnStatus::Aborted(AbortReason::Cancelled)));
        }
        self.finish(&mut engine).await;
        match &status {
            TurnStatus::Settled => info!(conversation_id, turn = seq, "Turn settled"),
            TurnStatus::Aborted(reason) => warn!(conversation_id, turn = seq, %reason, "Turn aborted"),
        }
        let conversation = engine.find(conversation_id)?;
        Ok((conversation, status))
    }

    /// Runs a whole turn: submit, stream every fragment into the conversation,
    /// then settle or abort. Validation failures are returned as errors with no
    /// state change; transport failures and cancellation end the turn early and
    /// are reported in the outcome.
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        text: &str,
        events: Option<mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnOutcome, AppError> {
        let (message, active) = self.submit_turn(conversation_id, text).await?;
        let guard = TurnGuard::arm(self.clone(), conversation_id, active.seq);
        emit(&events, TurnEvent::Submitted { conversation_id: conversation_id.to_string(), message }).await;

        let OpenTurn { message_id, mut stream } = match self.open_turn(conversation_id, Some(active.seq)).await {
            Ok(open) => open,
            Err(e) => {
                let reason = AbortReason::Internal { message: e.to_string() };
                let closed = self.close_turn(conversation_id, active.seq, TurnStatus::Aborted(reason)).await;
                guard.disarm();
                if let Err(close_error) = closed {
                    debug!(conversation_id, "Could not close turn: {close_error}");
                }
                return Err(e);
            }
        };
        emit(&events, TurnEvent::Started {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.clone(),
        })
        .await;

        let mut fragments = 0usize;
        let status = loop {
            let next = tokio::select! {
                biased;
                _ = active.cancel.cancelled() => break TurnStatus::Aborted(AbortReason::Cancelled),
                next = stream.next() => next,
            };
            match next {
                None => break TurnStatus::Settled,
                Some(Err(e)) => break TurnStatus::Aborted(AbortReason::Transport { message: e.to_string() }),
                Some(Ok(fragment)) => {
                    if let Err(e) = self.merge_fragment(conversation_id, &message_id, &fragment).await {
                        break TurnStatus::Aborted(AbortReason::Internal { message: e.to_string() });
                    }
                    fragments += 1;
                    emit(&events, TurnEvent::Fragment {
                        conversation_id: conversation_id.to_string(),
                        message_id: message_id.clone(),
                        text: fragment,
                    })
                    .await;
                }
            }
        };
        stream.close().await;
        debug!(conversation_id, fragments, "Fragment stream finished");

        let closed = self.close_turn(conversation_id, active.seq, status).await;
        guard.disarm();
        let (conversation, status) = closed?;
        let content = conversation
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let event = match &status {
            TurnStatus::Settled => TurnEvent::Settled {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.clone(),
                content,
            },
            TurnStatus::Aborted(reason) => TurnEvent::Aborted {
                conversation_id: conversation_id.to_string(),
                message_id: Some(message_id.clone()),
                reason: reason.clone(),
                content,
            },
        };
        emit(&events, event).await;

        Ok(TurnOutcome { conversation, message_id: Some(message_id), status })
    }

    pub async fn turn_phase(&self) -> TurnPhase {
        self.inner.engine.lock().await.turn.clone()
    }

    pub async fn is_streaming(&self) -> bool {
        matches!(self.turn_phase().await, TurnPhase::Streaming { .. })
    }

    // ── Conversations ─────────────────────────────────────────────────────────

    /// Creates an empty conversation for the current model and selects it.
    pub async fn create_conversation(&self) -> Conversation {
        let mut engine = self.inner.engine.lock().await;
        let conversation = Conversation::new(engine.settings.model.clone());
        engine.selected = Some(conversation.id.clone());
        self.commit(&mut engine, conversation.clone()).await;
        info!(conversation_id = %conversation.id, "Conversation created");
        conversation
    }

    pub async fn select_conversation(&self, id: &str) -> Result<Conversation, AppError> {
        let mut engine = self.inner.engine.lock().await;
        let conversation = engine.find(id)?;
        engine.selected = Some(conversation.id.clone());
        self.inner.current.send_replace(Some(conversation.clone()));
        Ok(conversation)
    }

    /// Deletes `id`. When it was selected, the most recently updated remaining
    /// conversation becomes selected, or nothing. Returns whether it existed.
    pub async fn delete_conversation(&self, id: &str) -> Result<bool, AppError> {
        let mut engine = self.inner.engine.lock().await;
        if engine.turn.active_conversation() == Some(id) {
            return Err(AppError::TurnInProgress { conversation_id: id.to_string() });
        }

        let existed = match engine.conversations.delete(id).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(conversation_id = id, "Keeping in-memory state after failed write: {e}");
                true
            }
        };
        if engine.selected.as_deref() == Some(id) {
            engine.selected = most_recent(engine.conversations.list()).map(|c| c.id.clone());
        }
        self.inner.current.send_replace(engine.selected_snapshot());
        if existed {
            info!(conversation_id = id, "Conversation deleted");
        }
        Ok(existed)
    }

    /// All conversations, most recently updated first.
    pub async fn get_conversations(&self) -> Vec<Conversation> {
        let engine = self.inner.engine.lock().await;
        sort_by_recency(engine.conversations.list().to_vec())
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Conversation, AppError> {
        self.inner.engine.lock().await.find(id)
    }

    /// Conversations whose title or messages contain `term`, most recent first.
    pub async fn search(&self, term: &str) -> Vec<Conversation> {
        let term = term.trim();
        let engine = self.inner.engine.lock().await;
        let matching = engine
            .conversations
            .list()
            .iter()
            .filter(|c| term.is_empty() || c.matches(term))
            .cloned()
            .collect();
        sort_by_recency(matching)
    }

    /// Snapshot of the selected conversation; does not wait on in-flight mutations.
    pub fn current_conversation(&self) -> Option<Conversation> {
        self.inner.current.borrow().clone()
    }

    /// True while memory holds changes the store has not accepted yet.
    pub async fn has_unsaved_changes(&self) -> bool {
        let engine = self.inner.engine.lock().await;
        engine.conversations.is_dirty() || engine.settings_dirty
    }

    // ── Settings & models ─────────────────────────────────────────────────────

    pub async fn settings(&self) -> GenerationSettings {
        self.inner.engine.lock().await.settings.clone()
    }

    /// Applies a partial update. Turns already streaming keep their snapshot.
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<GenerationSettings, AppError> {
        let mut engine = self.inner.engine.lock().await;
        let next = patch.apply(&engine.settings);
        next.validate()?;
        engine.settings = next.clone();
        self.save_settings(&mut engine).await;
        debug!(model = %next.model, "Settings updated");
        Ok(next)
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, AppError> {
        self.inner.source.list_models().await
    }

    pub async fn check_connection(&self) -> bool {
        self.inner.source.check_connection().await
    }

    /// Fetches the model catalogue and switches to its first model when the
    /// configured one is not offered.
    pub async fn sync_available_models(&self) -> Result<Vec<ModelInfo>, AppError> {
        let models = self.list_models().await?;
        let current = self.settings().await.model;
        if let Some(first) = models.first() {
            if !models.iter().any(|m| m.name == current) {
                info!(from = %current, to = %first.name, "Configured model unavailable, switching");
                self.update_settings(SettingsPatch {
                    model: Some(first.name.clone()),
                    ..Default::default()
                })
                .await?;
            }
        }
        Ok(models)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Reconciles the working copy into the store and republishes the selection.
    async fn commit(&self, engine: &mut Engine, conversation: Conversation) {
        let conversation_id = conversation.id.clone();
        if let Err(e) = engine.conversations.upsert(conversation).await {
            warn!(conversation_id = %conversation_id, "Keeping in-memory state after failed write: {e}");
        }
        if engine.selected.as_deref() == Some(conversation_id.as_str()) {
            self.inner.current.send_replace(engine.selected_snapshot());
        }
        if engine.settings_dirty {
            self.save_settings(engine).await;
        }
    }

    /// Writes the current settings; a failure leaves them dirty for the next mutation.
    async fn save_settings(&self, engine: &mut Engine) {
        match self.inner.settings_repo.save(&engine.settings).await {
            Ok(()) => engine.settings_dirty = false,
            Err(e) => {
                engine.settings_dirty = true;
                warn!("Keeping in-memory settings after failed write: {e}");
            }
        }
    }

    /// Back to `Idle`. Signals the turn's token so its driver stops consuming.
    async fn finish(&self, engine: &mut Engine) {
        engine.turn = TurnPhase::Idle;
        if let Some(active) = engine.active.take() {
            active.cancel.cancel();
        }
        if engine.conversations.is_dirty() {
            if let Err(e) = engine.conversations.flush().await {
                warn!("Conversations still unsaved after turn: {e}");
            }
        }
        if engine.settings_dirty {
            self.save_settings(engine).await;
        }
    }
}

/// Aborts the turn if `run_turn` is dropped before it finishes. Stays armed
/// until the turn has actually been closed.
struct TurnGuard {
    service: Option<ChatService>,
    conversation_id: String,
    seq: u64,
}

impl TurnGuard {
    fn arm(service: ChatService, conversation_id: &str, seq: u64) -> Self {
        Self { service: Some(service), conversation_id: conversation_id.to_string(), seq }
    }

    fn disarm(mut self) {
        self.service = None;
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let Some(service) = self.service.take() else { return };
        let conversation_id = std::mem::take(&mut self.conversation_id);
        let seq = self.seq;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let abandoned = TurnStatus::Aborted(AbortReason::Cancelled);
                if let Err(e) = service.close_turn(&conversation_id, seq, abandoned).await {
                    debug!(conversation_id, "Abandoned turn could not be closed: {e}");
                }
            });
        }
    }
}

async fn emit(events: &Option<mpsc::Sender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

fn most_recent(conversations: &[Conversation]) -> Option<&Conversation> {
    conversations.iter().max_by_key(|c| c.updated_at)
}

fn sort_by_recency(mut conversations: Vec<Conversation>) -> Vec<Conversation> {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    conversations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockTokenSource;
    use crate::db::kv_store::MemoryKvStore;

    async fn service_with(source: MockTokenSource) -> ChatService {
        ChatService::open(Arc::new(MemoryKvStore::new()), Arc::new(source))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn primitives_walk_the_turn_phases() {
        let service = service_with(MockTokenSource::scripted(["Hi", "!"])).await;
        let conversation = service.create_conversation().await;
        let id = conversation.id.as_str();

        service.submit(id, "  hello  ").await.unwrap();
        assert_eq!(service.turn_phase().await.name(), "submitting");

        let OpenTurn { message_id, mut stream } = service.begin_turn(id).await.unwrap();
        assert!(service.is_streaming().await);
        while let Some(fragment) = stream.next().await {
            service.merge_fragment(id, &message_id, &fragment.unwrap()).await.unwrap();
        }
        stream.close().await;

        let settled = service.settle_turn(id, &message_id).await.unwrap();
        assert_eq!(service.turn_phase().await, TurnPhase::Idle);
        assert_eq!(settled.messages[0].content, "hello");
        assert_eq!(settled.messages[1].id, message_id);
        assert_eq!(settled.messages[1].content, "Hi!");
    }

    #[tokio::test]
    async fn operations_out_of_phase_are_rejected() {
        let service = service_with(MockTokenSource::scripted(["x"])).await;
        let id = service.create_conversation().await.id;

        assert!(matches!(
            service.begin_turn(&id).await,
            Err(AppError::InvalidTransition { phase: "idle", .. })
        ));
        assert!(service.merge_fragment(&id, "m", "x").await.is_err());
        assert!(service.settle_turn(&id, "m").await.is_err());
        assert!(service.abort_turn(&id, AbortReason::Cancelled).await.is_err());
        assert!(!service.cancel_turn().await);
    }

    #[tokio::test]
    async fn primitives_reject_a_reply_that_is_not_streaming() {
        let service = service_with(MockTokenSource::scripted(["x"])).await;
        let id = service.create_conversation().await.id;
        service.submit(&id, "hello").await.unwrap();
        let OpenTurn { message_id, stream } = service.begin_turn(&id).await.unwrap();
        stream.close().await;

        assert!(matches!(
            service.merge_fragment(&id, "earlier-reply", "x").await,
            Err(AppError::InvalidTransition { phase: "streaming", .. })
        ));
        assert!(service.settle_turn(&id, "earlier-reply").await.is_err());
        assert_eq!(service.get_conversation(&id).await.unwrap().messages[1].content, "");

        service.settle_turn(&id, &message_id).await.unwrap();
        assert_eq!(service.turn_phase().await, TurnPhase::Idle);
    }

    #[tokio::test]
    async fn submitting_turn_can_be_aborted_without_a_reply() {
        let service = service_with(MockTokenSource::scripted(["x"])).await;
        let id = service.create_conversation().await.id;
        service.submit(&id, "hello").await.unwrap();

        let conversation = service.abort_turn(&id, AbortReason::Cancelled).await.unwrap();
        assert_eq!(conversation.messages.len(), 1);
        assert_eq!(service.turn_phase().await, TurnPhase::Idle);
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let service = service_with(MockTokenSource::scripted(["x"])).await;
        let err = service.submit("missing", "hello").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(service.turn_phase().await, TurnPhase::Idle);
    }

    #[tokio::test]
    async fn catalogue_sync_replaces_an_unknown_model() {
        let service = service_with(MockTokenSource::scripted(["x"])).await;
        service
            .update_settings(SettingsPatch { model: Some("gone:latest".into()), ..Default::default() })
            .await
            .unwrap();

        let models = service.sync_available_models().await.unwrap();
        assert_eq!(service.settings().await.model, models[0].name);
    }
}
