use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ichigo_core::config::ChatConfig;
use ichigo_core::domain::conversation::{
    ConversationId, ConversationRecord, ConversationSettings, Turn,
};
use ichigo_core::{AccessPolicy, Catalog, GenerationFinished, SessionError};
use ichigo_db::ConversationStore;

use crate::pipeline::{DeliveryContext, GenerationJob, GenerationPipeline};
use crate::registry::ProviderRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_history_turns: usize,
    pub max_completion_tokens: u32,
}

impl From<&ChatConfig> for SessionLimits {
    fn from(chat: &ChatConfig) -> Self {
        Self {
            max_history_turns: chat.max_history_turns,
            max_completion_tokens: chat.max_tokens_per_response,
        }
    }
}

pub fn default_settings(chat: &ChatConfig) -> ConversationSettings {
    ConversationSettings {
        model: chat.default_model.clone(),
        temperature: chat.default_temperature,
        prompt: chat.default_prompt.clone(),
    }
}

/// Collaborators the session manager is started with.
pub struct SessionSetup {
    pub catalog: Arc<Catalog>,
    pub access: Arc<AccessPolicy>,
    pub providers: ProviderRegistry,
    pub delivery: DeliveryContext,
    pub store: Arc<dyn ConversationStore>,
    pub defaults: ConversationSettings,
    pub limits: SessionLimits,
}

/// Owns every conversation record. All methods take `&mut self`: the owner
/// (the dispatch loop) is the only writer of record state and history.
///
/// Store failures are logged and never returned to callers.
pub struct SessionManager {
    records: BTreeMap<ConversationId, ConversationRecord>,
    catalog: Arc<Catalog>,
    access: Arc<AccessPolicy>,
    providers: ProviderRegistry,
    delivery: DeliveryContext,
    store: Arc<dyn ConversationStore>,
    defaults: ConversationSettings,
    limits: SessionLimits,
    finished: mpsc::UnboundedSender<GenerationFinished>,
}

impl SessionManager {
    /// Creates a record for every allow-listed identity, merging in whatever
    /// the store holds for it. Identities with nothing stored get their
    /// defaults written.
    pub async fn start(
        setup: SessionSetup,
        finished: mpsc::UnboundedSender<GenerationFinished>,
    ) -> Self {
        let SessionSetup { catalog, access, providers, delivery, store, defaults, limits } = setup;
        let mut records = BTreeMap::new();

        for id in access.conversation_ids() {
            let mut record =
                ConversationRecord::new(id, defaults.clone(), access.available_models(id));
            match store.load_conversation(id).await {
                Ok(Some(stored)) => {
                    let merged = merge_settings(&catalog, &defaults, stored.settings.clone());
                    let merged =
                        permit_model(&catalog, merged, &defaults, record.available_models());
                    if merged != stored.settings {
                        if let Err(error) = store.update_metadata(id, &merged).await {
                            warn!(
                                event_name = "store.write_failed",
                                conversation_id = %id,
                                error = %error,
                                "failed to rewrite conversation settings"
                            );
                        }
                    }
                    record.replace_settings(merged);

                    let mut turns = stored.turns;
                    let overflow = turns.len().saturating_sub(limits.max_history_turns);
                    if overflow > 0 {
                        turns.drain(..overflow);
                        if let Err(error) =
                            store.trim_to_most_recent(id, limits.max_history_turns).await
                        {
                            warn!(
                                event_name = "store.write_failed",
                                conversation_id = %id,
                                error = %error,
                                "failed to trim stored history"
                            );
                        }
                    }
                    record.replace_history(turns);
                }
                Ok(None) => {
                    let settings = permit_model(
                        &catalog,
                        defaults.clone(),
                        &defaults,
                        record.available_models(),
                    );
                    if let Err(error) = store.update_metadata(id, &settings).await {
                        warn!(
                            event_name = "store.write_failed",
                            conversation_id = %id,
                            error = %error,
                            "failed to write default conversation settings"
                        );
                    }
                    record.replace_settings(settings);
                }
                Err(error) => {
                    warn!(
                        event_name = "store.load_failed",
                        conversation_id = %id,
                        error = %error,
                        "failed to load stored conversation; starting from defaults"
                    );
                    let settings = permit_model(
                        &catalog,
                        defaults.clone(),
                        &defaults,
                        record.available_models(),
                    );
                    record.replace_settings(settings);
                }
            }
            records.insert(id, record);
        }

        info!(
            event_name = "session.started",
            conversations = records.len(),
            models = catalog.aliases().count(),
            "session manager started"
        );

        Self { records, catalog, access, providers, delivery, store, defaults, limits, finished }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn access(&self) -> &AccessPolicy {
        &self.access
    }

    pub fn conversation(&self, id: ConversationId) -> Option<&ConversationRecord> {
        self.records.get(&id)
    }

    pub fn available_models(&self, id: ConversationId) -> Result<&[String], SessionError> {
        Ok(self.record(id)?.available_models())
    }

    /// Accepts a user turn and spawns its generation. Returns the generation
    /// number of the accepted turn.
    pub async fn submit_turn(
        &mut self,
        id: ConversationId,
        chat_id: i64,
        text: &str,
    ) -> Result<u64, SessionError> {
        let record = self.record_mut(id)?;
        let collected = record.try_collect();
        let busy = record.is_responding();
        if let Some(reply) = collected {
            self.append_reply(id, reply).await;
        }
        if busy {
            debug!(event_name = "session.busy", conversation_id = %id, "turn dropped");
            return Err(SessionError::Busy(id));
        }

        let record = self.record(id)?;
        let model = self.catalog.resolve_model(record.model())?.clone();
        if !record.available_models().contains(&model.alias) {
            return Err(SessionError::ModelNotPermitted {
                conversation_id: id,
                alias: model.alias.clone(),
            });
        }
        let provider = self.providers.get(&model.provider).ok_or_else(|| {
            SessionError::ProviderUnavailable {
                alias: model.alias.clone(),
                provider: model.provider.clone(),
            }
        })?;
        let system_prompt = self
            .catalog
            .prompt(record.prompt())
            .ok_or_else(|| SessionError::PromptUnavailable { name: record.prompt().to_string() })?
            .to_string();
        let temperature = record.temperature();

        let max_completion_tokens = self.limits.max_completion_tokens;

        self.append_turn(id, Turn::user(text)).await;

        let record = self.record_mut(id)?;
        let handles = record.begin_generation();
        let generation = handles.generation;
        let job = GenerationJob {
            conversation_id: id,
            chat_id,
            model,
            temperature,
            system_prompt,
            history: record.history().to_vec(),
            max_completion_tokens,
            handles,
        };

        info!(
            event_name = "session.turn_accepted",
            conversation_id = %id,
            chat_id,
            generation,
            model = %job.model.alias,
            history_turns = job.history.len(),
            "turn accepted"
        );
        GenerationPipeline::new(provider, self.delivery.clone()).spawn(job, self.finished.clone());
        Ok(generation)
    }

    /// Collects the result of a finished generation. Notices of superseded or
    /// cancelled generations are ignored. Returns whether the record was
    /// returned to idle.
    pub async fn collect_finished(&mut self, notice: GenerationFinished) -> bool {
        let Some(record) = self.records.get_mut(&notice.conversation_id) else {
            return false;
        };
        if record.generation() != notice.generation || !record.is_responding() {
            debug!(
                event_name = "session.stale_notice",
                conversation_id = %notice.conversation_id,
                generation = notice.generation,
                current_generation = record.generation(),
                "ignoring completion notice"
            );
            return false;
        }

        let collected = record.try_collect();
        if collected.is_none() {
            // the pipeline stopped without delivering anything
            record.cancel();
        }
        if let Some(reply) = collected {
            self.append_reply(notice.conversation_id, reply).await;
        }
        true
    }

    /// Raises the cancel signal of the in-flight generation, if any.
    pub fn cancel(&mut self, id: ConversationId) -> Result<bool, SessionError> {
        let record = self.record_mut(id)?;
        let cancelled = record.cancel();
        if cancelled {
            info!(
                event_name = "session.cancelled",
                conversation_id = %id,
                generation = record.generation(),
                "generation cancelled"
            );
        }
        Ok(cancelled)
    }

    pub async fn reset_history(&mut self, id: ConversationId) -> Result<(), SessionError> {
        let record = self.record_mut(id)?;
        record.cancel();
        record.drain_result();
        record.clear_history();

        if let Err(error) = self.store.clear_history(id).await {
            warn!(
                event_name = "store.write_failed",
                conversation_id = %id,
                error = %error,
                "failed to clear stored history"
            );
        }
        Ok(())
    }

    /// Removes the last round (assistant reply and the user turn before it).
    /// Returns the number of removed turns.
    pub async fn undo(&mut self, id: ConversationId) -> Result<usize, SessionError> {
        let record = self.record_mut(id)?;
        if let Some(reply) = record.try_collect() {
            self.append_reply(id, reply).await;
        }
        let record = self.record_mut(id)?;
        if record.is_responding() {
            return Err(SessionError::Busy(id));
        }

        let removed = record.undo_last_round();
        for _ in 0..removed {
            if let Err(error) = self.store.delete_last_turn(id).await {
                warn!(
                    event_name = "store.write_failed",
                    conversation_id = %id,
                    error = %error,
                    "failed to delete stored turn"
                );
                break;
            }
        }
        Ok(removed)
    }

    pub async fn set_model(&mut self, id: ConversationId, alias: &str) -> Result<(), SessionError> {
        self.catalog.resolve_model(alias)?;
        let record = self.record_mut(id)?;
        if !record.available_models().iter().any(|available| available == alias) {
            return Err(SessionError::ModelNotPermitted {
                conversation_id: id,
                alias: alias.to_string(),
            });
        }
        record.set_model(alias);
        self.persist_settings(id).await;
        Ok(())
    }

    pub async fn set_temperature(
        &mut self,
        id: ConversationId,
        temperature: f32,
    ) -> Result<(), SessionError> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(SessionError::InvalidTemperature(temperature));
        }
        self.record_mut(id)?.set_temperature(temperature);
        self.persist_settings(id).await;
        Ok(())
    }

    pub async fn set_prompt(&mut self, id: ConversationId, name: &str) -> Result<(), SessionError> {
        if self.catalog.prompt(name).is_none() {
            return Err(SessionError::PromptUnavailable { name: name.to_string() });
        }
        self.record_mut(id)?.set_prompt(name);
        self.persist_settings(id).await;
        Ok(())
    }

    /// Cancels every generation, forgets every history and restores default
    /// settings, in memory and in the store.
    pub async fn reset_all(&mut self) {
        for record in self.records.values_mut() {
            record.cancel();
            record.drain_result();
            record.clear_history();
            record.replace_settings(self.defaults.clone());
        }

        if let Err(error) = self.store.clear_all().await {
            warn!(event_name = "store.write_failed", error = %error, "failed to clear store");
            return;
        }
        for id in self.records.keys() {
            if let Err(error) = self.store.update_metadata(*id, &self.defaults).await {
                warn!(
                    event_name = "store.write_failed",
                    conversation_id = %id,
                    error = %error,
                    "failed to write default conversation settings"
                );
            }
        }
        info!(event_name = "session.reset_all", conversations = self.records.len(), "all reset");
    }

    /// Deletes stored conversations that are no longer allow-listed. Returns
    /// how many were deleted.
    pub async fn reconcile(&self) -> u64 {
        match self.store.delete_conversations_not_in(&self.access.conversation_ids()).await {
            Ok(removed) => {
                info!(event_name = "session.reconciled", removed, "stale conversations removed");
                removed
            }
            Err(error) => {
                warn!(event_name = "store.write_failed", error = %error, "failed to reconcile store");
                0
            }
        }
    }

    /// Raises the cancel signal of every in-flight generation.
    pub fn cancel_all(&mut self) -> usize {
        self.records
            .values_mut()
            .map(ConversationRecord::cancel)
            .filter(|cancelled| *cancelled)
            .count()
    }

    fn record(&self, id: ConversationId) -> Result<&ConversationRecord, SessionError> {
        self.records.get(&id).ok_or(SessionError::NotAuthorized(id))
    }

    fn record_mut(&mut self, id: ConversationId) -> Result<&mut ConversationRecord, SessionError> {
        self.records.get_mut(&id).ok_or(SessionError::NotAuthorized(id))
    }

    async fn append_reply(&mut self, id: ConversationId, reply: String) {
        if reply.is_empty() {
            return;
        }
        self.append_turn(id, Turn::assistant(reply)).await;
    }

    /// Appends in memory and in the store, then trims both to the history cap.
    async fn append_turn(&mut self, id: ConversationId, turn: Turn) {
        let cap = self.limits.max_history_turns;
        if let Some(record) = self.records.get_mut(&id) {
            record.push_turn(turn.clone(), cap);
        }

        if let Err(error) = self.store.append_turn(id, &turn).await {
            warn!(
                event_name = "store.write_failed",
                conversation_id = %id,
                role = turn.role.as_str(),
                error = %error,
                "failed to store turn"
            );
            return;
        }
        if let Err(error) = self.store.trim_to_most_recent(id, cap).await {
            warn!(
                event_name = "store.write_failed",
                conversation_id = %id,
                error = %error,
                "failed to trim stored history"
            );
        }
    }

    async fn persist_settings(&self, id: ConversationId) {
        let Some(record) = self.records.get(&id) else {
            return;
        };
        if let Err(error) = self.store.update_metadata(id, record.settings()).await {
            warn!(
                event_name = "store.write_failed",
                conversation_id = %id,
                error = %error,
                "failed to store conversation settings"
            );
        }
    }
}

/// Stored settings win over defaults only where they still make sense against
/// the catalog.
fn merge_settings(
    catalog: &Catalog,
    defaults: &ConversationSettings,
    stored: ConversationSettings,
) -> ConversationSettings {
    ConversationSettings {
        model: if catalog.model(&stored.model).is_some() {
            stored.model
        } else {
            defaults.model.clone()
        },
        temperature: if (0.0..=2.0).contains(&stored.temperature) {
            stored.temperature
        } else {
            defaults.temperature
        },
        prompt: if catalog.prompt(&stored.prompt).is_some() {
            stored.prompt
        } else {
            defaults.prompt.clone()
        },
    }
}

/// Replaces a catalog model the identity is blocked from with the default
/// model, or the first permitted one when the default is blocked too. Models
/// missing from the catalog are left for `submit_turn` to report.
fn permit_model(
    catalog: &Catalog,
    mut settings: ConversationSettings,
    defaults: &ConversationSettings,
    available: &[String],
) -> ConversationSettings {
    let blocked = catalog.model(&settings.model).is_some()
        && !available.iter().any(|alias| *alias == settings.model);
    if blocked {
        let fallback = if available.iter().any(|alias| *alias == defaults.model) {
            Some(defaults.model.clone())
        } else {
            available.first().cloned()
        };
        if let Some(model) = fallback {
            settings.model = model;
        }
    }
    settings
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc, Notify};

    use ichigo_core::config::{AccessConfig, BlocklistRule};
    use ichigo_core::delivery::{DeliveryPolicy, EditThreshold};
    use ichigo_core::domain::catalog::{Catalog, ModelSpec};
    use ichigo_core::domain::conversation::{
        ConversationId, ConversationSettings, ConversationState, Role, Turn,
    };
    use ichigo_core::transport::{PlainRenderer, RecordingTransport};
    use ichigo_core::{AccessPolicy, GenerationFinished, SessionError, Throttler};
    use ichigo_db::{ConversationStore, InMemoryConversationStore};

    use super::{SessionLimits, SessionManager, SessionSetup};
    use crate::pipeline::DeliveryContext;
    use crate::registry::ProviderRegistry;
    use crate::scripted::{ScriptStep, ScriptedProvider};

    const ALICE: ConversationId = ConversationId(1);
    const BOB: ConversationId = ConversationId(2);

    struct Harness {
        manager: SessionManager,
        store: Arc<InMemoryConversationStore>,
        provider: Arc<ScriptedProvider>,
        finished: mpsc::UnboundedReceiver<GenerationFinished>,
    }

    impl Harness {
        async fn next_notice(&mut self) -> GenerationFinished {
            tokio::time::timeout(Duration::from_secs(5), self.finished.recv())
                .await
                .expect("generation should finish")
                .expect("channel open")
        }

        async fn settle(&mut self) -> bool {
            let notice = self.next_notice().await;
            self.manager.collect_finished(notice).await
        }

        fn history(&self, id: ConversationId) -> Vec<Turn> {
            self.manager.conversation(id).expect("record").history().to_vec()
        }

        fn state(&self, id: ConversationId) -> ConversationState {
            self.manager.conversation(id).expect("record").state()
        }
    }

    fn spec(alias: &str, provider: &str) -> ModelSpec {
        ModelSpec {
            alias: alias.to_string(),
            name: format!("{alias}-model"),
            provider: provider.to_string(),
            stream: false,
            accepts_system_role: true,
            accepts_temperature: true,
        }
    }

    fn defaults(model: &str) -> ConversationSettings {
        ConversationSettings {
            model: model.to_string(),
            temperature: 0.2,
            prompt: "default".to_string(),
        }
    }

    async fn harness_with(
        store: Arc<InMemoryConversationStore>,
        defaults: ConversationSettings,
        max_history_turns: usize,
    ) -> Harness {
        let catalog = Arc::new(Catalog::new(
            vec![spec("mini", "openai"), spec("large", "openai"), spec("orphan", "missing")],
            vec![
                ("default".to_string(), "be helpful".to_string()),
                ("pirate".to_string(), "talk like a pirate".to_string()),
            ],
        ));
        let access = Arc::new(AccessPolicy::new(
            &AccessConfig { admins: vec![1], users: vec![2], groups: Vec::new() },
            &[BlocklistRule {
                sessions: vec![2],
                models: vec!["large".to_string()],
                ..Default::default()
            }],
            &catalog,
        ));
        let provider = Arc::new(ScriptedProvider::new());
        let mut providers = ProviderRegistry::new();
        providers.insert("openai", provider.clone());

        let delivery = DeliveryContext {
            transport: Arc::new(RecordingTransport::new()),
            renderer: Arc::new(PlainRenderer),
            throttler: Arc::new(Throttler::new(Duration::from_millis(2000))),
            policy: DeliveryPolicy {
                char_limit: 4032,
                edit_interval: Duration::from_millis(2000),
                edit_threshold: EditThreshold { divisor: 4000, cap: 100 },
                max_transport_retries: 2,
            },
        };
        let (finished_tx, finished) = mpsc::unbounded_channel();
        let manager = SessionManager::start(
            SessionSetup {
                catalog,
                access,
                providers,
                delivery,
                store: store.clone(),
                defaults,
                limits: SessionLimits { max_history_turns, max_completion_tokens: 4000 },
            },
            finished_tx,
        )
        .await;

        Harness { manager, store, provider, finished }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(InMemoryConversationStore::default()), defaults("mini"), 32).await
    }

    #[tokio::test]
    async fn unknown_identity_is_not_authorized() {
        let mut h = harness().await;
        let stranger = ConversationId(7);

        assert_eq!(
            h.manager.submit_turn(stranger, 7, "hi").await,
            Err(SessionError::NotAuthorized(stranger))
        );
        assert!(h.provider.requests().is_empty());
    }

    #[tokio::test]
    async fn second_turn_while_responding_is_busy_and_dropped() {
        let mut h = harness().await;
        let gate = Arc::new(Notify::new());
        h.provider.push_steps(vec![ScriptStep::Hold(gate.clone()), ScriptStep::Delta("hi!".into())]);

        assert_eq!(h.manager.submit_turn(ALICE, 1, "hello").await, Ok(1));
        assert_eq!(h.manager.submit_turn(ALICE, 1, "again").await, Err(SessionError::Busy(ALICE)));
        assert_eq!(h.history(ALICE), vec![Turn::user("hello")]);

        gate.notify_one();
        assert!(h.settle().await);
        assert_eq!(h.state(ALICE), ConversationState::Idle);
        assert_eq!(h.history(ALICE), vec![Turn::user("hello"), Turn::assistant("hi!")]);
    }

    #[tokio::test]
    async fn delivered_result_is_appended_exactly_once() {
        let mut h = harness().await;
        h.provider.push_reply("first answer");
        h.provider.push_reply("second answer");

        h.manager.submit_turn(ALICE, 1, "q1").await.expect("accepted");
        let stale = h.next_notice().await;

        // collected inline by the next submission, before the notice is handled
        assert_eq!(h.manager.submit_turn(ALICE, 1, "q2").await, Ok(2));
        assert!(!h.manager.collect_finished(stale).await);
        assert!(h.settle().await);

        assert_eq!(
            h.history(ALICE),
            vec![
                Turn::user("q1"),
                Turn::assistant("first answer"),
                Turn::user("q2"),
                Turn::assistant("second answer"),
            ]
        );
        assert_eq!(h.store.turns(ALICE).await, h.history(ALICE));
    }

    #[tokio::test]
    async fn cancel_returns_to_idle_and_result_is_never_appended() {
        let mut h = harness().await;
        let gate = Arc::new(Notify::new());
        h.provider.push_steps(vec![ScriptStep::Hold(gate), ScriptStep::Delta("late".into())]);
        h.provider.push_reply("fresh");

        h.manager.submit_turn(ALICE, 1, "slow question").await.expect("accepted");
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.provider.requests().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("provider should be called");
        assert_eq!(h.manager.cancel(ALICE), Ok(true));
        assert_eq!(h.state(ALICE), ConversationState::Idle);
        assert_eq!(h.manager.cancel(ALICE), Ok(false));

        let cancelled = h.next_notice().await;
        assert!(!h.manager.collect_finished(cancelled).await);

        assert_eq!(h.manager.submit_turn(ALICE, 1, "next").await, Ok(2));
        assert!(h.settle().await);
        assert_eq!(
            h.history(ALICE),
            vec![Turn::user("slow question"), Turn::user("next"), Turn::assistant("fresh")]
        );
    }

    #[tokio::test]
    async fn reset_while_responding_discards_the_stale_result() {
        let mut h = harness().await;
        let gate = Arc::new(Notify::new());
        h.provider.push_steps(vec![ScriptStep::Hold(gate.clone()), ScriptStep::Delta("x".into())]);

        h.manager.submit_turn(ALICE, 1, "hello").await.expect("accepted");
        h.manager.reset_history(ALICE).await.expect("reset");
        gate.notify_one();

        let notice = h.next_notice().await;
        assert!(!h.manager.collect_finished(notice).await);
        assert!(h.history(ALICE).is_empty());
        assert!(h.store.turns(ALICE).await.is_empty());
        assert_eq!(h.state(ALICE), ConversationState::Idle);
    }

    #[tokio::test]
    async fn history_is_capped_in_memory_and_in_store() {
        let mut h =
            harness_with(Arc::new(InMemoryConversationStore::default()), defaults("mini"), 4).await;
        for round in 0..3 {
            h.provider.push_reply(format!("a{round}"));
            h.manager.submit_turn(ALICE, 1, &format!("q{round}")).await.expect("accepted");
            assert!(h.settle().await);
        }

        let expected =
            vec![Turn::user("q1"), Turn::assistant("a1"), Turn::user("q2"), Turn::assistant("a2")];
        assert_eq!(h.history(ALICE), expected);
        assert_eq!(h.store.turns(ALICE).await, expected);
    }

    #[tokio::test]
    async fn startup_trims_oversized_stored_history() {
        let store = Arc::new(InMemoryConversationStore::default());
        store.update_metadata(ALICE, &defaults("large")).await.expect("metadata");
        for index in 0..40 {
            store.append_turn(ALICE, &Turn::user(format!("t{index}"))).await.expect("append");
        }

        let mut h = harness_with(store, defaults("mini"), 32).await;
        let history = h.history(ALICE);

        assert_eq!(history.len(), 32);
        assert_eq!(history[0].text, "t8");
        assert_eq!(h.store.turns(ALICE).await, history);
        assert_eq!(h.manager.conversation(ALICE).expect("record").model(), "large");

        h.provider.push_reply("r40");
        assert_eq!(h.manager.submit_turn(ALICE, 1, "t40").await, Ok(1));
        assert!(h.settle().await);

        let history = h.history(ALICE);
        assert_eq!(history.len(), 32);
        assert_eq!(history[0].text, "t10");
        assert_eq!(history[30], Turn::user("t40"));
        assert_eq!(history[31], Turn::assistant("r40"));
        let stored = h.store.turns(ALICE).await;
        assert_eq!(stored.len(), 32);
        assert_eq!(stored, history);
    }

    #[tokio::test]
    async fn blocked_models_fall_back_to_a_permitted_one() {
        let store = Arc::new(InMemoryConversationStore::default());
        store.update_metadata(BOB, &defaults("large")).await.expect("metadata");

        let h = harness_with(store.clone(), defaults("mini"), 32).await;
        assert_eq!(h.manager.conversation(BOB).expect("record").model(), "mini");
        let stored = store.load_conversation(BOB).await.expect("load").expect("stored");
        assert_eq!(stored.settings.model, "mini");

        let mut h =
            harness_with(Arc::new(InMemoryConversationStore::default()), defaults("large"), 32)
                .await;
        assert_eq!(h.manager.conversation(ALICE).expect("record").model(), "large");
        assert_eq!(h.manager.conversation(BOB).expect("record").model(), "mini");

        h.provider.push_reply("hi bob");
        assert_eq!(h.manager.submit_turn(BOB, 2, "hello").await, Ok(1));
        assert!(h.settle().await);
        let requests = h.provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "mini-model");
    }

    #[tokio::test]
    async fn startup_ignores_stored_model_missing_from_catalog() {
        let store = Arc::new(InMemoryConversationStore::default());
        store.update_metadata(ALICE, &defaults("retired")).await.expect("metadata");

        let h = harness_with(store.clone(), defaults("mini"), 32).await;

        assert_eq!(h.manager.conversation(ALICE).expect("record").model(), "mini");
        let written = store.load_conversation(BOB).await.expect("load").expect("defaults stored");
        assert_eq!(written.settings, defaults("mini"));
    }

    #[tokio::test]
    async fn store_failures_are_not_surfaced() {
        let mut h = harness().await;
        h.store.set_unavailable(true);
        h.provider.push_reply("still works");

        assert_eq!(h.manager.submit_turn(ALICE, 1, "hello").await, Ok(1));
        assert!(h.settle().await);
        assert_eq!(h.history(ALICE).len(), 2);
        assert_eq!(h.manager.reconcile().await, 0);
    }

    #[tokio::test]
    async fn unresolvable_model_or_provider_rejects_without_appending() {
        let mut h =
            harness_with(Arc::new(InMemoryConversationStore::default()), defaults("gone"), 32)
                .await;

        assert_eq!(
            h.manager.submit_turn(ALICE, 1, "hello").await,
            Err(SessionError::ModelUnavailable { alias: "gone".to_string() })
        );

        h.manager.set_model(ALICE, "orphan").await.expect("orphan is selectable");
        assert_eq!(
            h.manager.submit_turn(ALICE, 1, "hello").await,
            Err(SessionError::ProviderUnavailable {
                alias: "orphan".to_string(),
                provider: "missing".to_string(),
            })
        );
        assert!(h.history(ALICE).is_empty());
        assert_eq!(h.state(ALICE), ConversationState::Idle);
    }

    #[tokio::test]
    async fn settings_are_validated_and_persisted() {
        let mut h = harness().await;

        assert_eq!(
            h.manager.set_model(BOB, "large").await,
            Err(SessionError::ModelNotPermitted { conversation_id: BOB, alias: "large".into() })
        );
        assert_eq!(
            h.manager.set_model(ALICE, "huge").await,
            Err(SessionError::ModelUnavailable { alias: "huge".to_string() })
        );
        assert_eq!(
            h.manager.set_temperature(ALICE, 2.5).await,
            Err(SessionError::InvalidTemperature(2.5))
        );
        assert_eq!(
            h.manager.set_prompt(ALICE, "poet").await,
            Err(SessionError::PromptUnavailable { name: "poet".to_string() })
        );

        h.manager.set_model(ALICE, "large").await.expect("model");
        h.manager.set_temperature(ALICE, 1.5).await.expect("temperature");
        h.manager.set_prompt(ALICE, "pirate").await.expect("prompt");

        let stored = h.store.load_conversation(ALICE).await.expect("load").expect("stored");
        assert_eq!(
            stored.settings,
            ConversationSettings {
                model: "large".to_string(),
                temperature: 1.5,
                prompt: "pirate".to_string(),
            }
        );
        let permitted = ["mini".to_string(), "orphan".to_string()];
        assert_eq!(h.manager.available_models(BOB), Ok(&permitted[..]));
    }

    #[tokio::test]
    async fn undo_removes_last_round_everywhere() {
        let mut h = harness().await;
        h.provider.push_reply("answer");
        h.manager.submit_turn(ALICE, 1, "question").await.expect("accepted");
        assert!(h.settle().await);

        assert_eq!(h.manager.undo(ALICE).await, Ok(2));
        assert!(h.history(ALICE).is_empty());
        assert!(h.store.turns(ALICE).await.is_empty());
        assert_eq!(h.manager.undo(ALICE).await, Ok(0));
    }

    #[tokio::test]
    async fn system_prompt_leads_the_request() {
        let mut h = harness().await;
        h.provider.push_reply("ok");
        h.manager.set_prompt(ALICE, "pirate").await.expect("prompt");
        h.manager.submit_turn(ALICE, 1, "ahoy").await.expect("accepted");
        assert!(h.settle().await);

        let request = &h.provider.requests()[0];
        assert_eq!(request.model, "mini-model");
        assert_eq!(request.messages[0].content, "talk like a pirate");
        assert_eq!(request.messages[1].content, "ahoy");
        assert_eq!(h.history(ALICE)[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn reset_all_and_reconcile_clean_the_store() {
        let mut h = harness().await;
        h.store.update_metadata(ConversationId(99), &defaults("mini")).await.expect("metadata");
        h.provider.push_reply("answer");
        h.manager.submit_turn(ALICE, 1, "question").await.expect("accepted");
        assert!(h.settle().await);
        h.manager.set_temperature(ALICE, 1.0).await.expect("temperature");

        assert_eq!(h.manager.reconcile().await, 1);

        h.manager.reset_all().await;
        assert!(h.history(ALICE).is_empty());
        assert!(h.store.turns(ALICE).await.is_empty());
        assert_eq!(h.manager.conversation(ALICE).expect("record").temperature(), 0.2);
        let ids = h.store.list_conversation_ids().await.expect("ids");
        assert_eq!(ids, vec![ALICE, BOB]);
    }
}
