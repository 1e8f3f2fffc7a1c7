use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ichigo_agent::SessionManager;
use ichigo_core::{
    CancellationToken, ConversationId, ConversationState, GenerationFinished, SessionError,
    TextFormat, Transport,
};
use ichigo_telegram::{ChatCommand, InboundMessage, ADMIN_HELP_TEXT, HELP_TEXT};

/// The single task that owns the session manager. Every inbound message and
/// every finished generation passes through here, one at a time.
pub struct Dispatcher {
    sessions: SessionManager,
    replies: Arc<dyn Transport>,
    finished: mpsc::UnboundedReceiver<GenerationFinished>,
}

impl Dispatcher {
    pub fn new(
        sessions: SessionManager,
        replies: Arc<dyn Transport>,
        finished: mpsc::UnboundedReceiver<GenerationFinished>,
    ) -> Self {
        Self { sessions, replies, finished }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Runs until `shutdown` fires or the inbound channel closes, then raises
    /// the cancel signal of every in-flight generation.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) {
        info!(event_name = "dispatch.start", "dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(notice) = self.finished.recv() => {
                    self.sessions.collect_finished(notice).await;
                }
                message = inbound.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }

        let cancelled = self.sessions.cancel_all();
        info!(event_name = "dispatch.stop", cancelled, "dispatcher stopped");
    }

    pub async fn handle(&mut self, message: InboundMessage) {
        match message.command() {
            Some(command) => self.handle_command(&message, command).await,
            None if message.private => self.chat(&message, &message.text).await,
            None => {
                debug!(
                    event_name = "dispatch.group_text_ignored",
                    conversation_id = %message.conversation_id,
                    chat_id = message.chat_id,
                    "plain group text ignored"
                );
            }
        }
    }

    async fn handle_command(&mut self, message: &InboundMessage, command: ChatCommand) {
        let id = message.conversation_id;
        debug!(
            event_name = "dispatch.command",
            conversation_id = %id,
            command = command.name(),
            "handling command"
        );

        if command.is_admin_only() && !message.is_from_admin(self.sessions.access()) {
            warn!(
                event_name = "dispatch.admin_command_denied",
                conversation_id = %id,
                user_id = message.user_id.unwrap_or_default(),
                command = command.name(),
                "admin command from a non-admin ignored"
            );
            return;
        }

        let reply = match command {
            ChatCommand::Chat(text) => {
                self.chat(message, &text).await;
                return;
            }
            ChatCommand::New => self
                .sessions
                .reset_history(id)
                .await
                .map(|()| "New conversation started.".to_string()),
            ChatCommand::Set(alias) if alias.is_empty() => Ok(self.model_list(id)),
            ChatCommand::Set(alias) => match self.sessions.set_model(id, &alias).await {
                Ok(()) => Ok(self.current_model(id)),
                Err(error) => Err(error),
            },
            ChatCommand::List => Ok(self.model_list(id)),
            ChatCommand::Undo => self.sessions.undo(id).await.map(|removed| {
                if removed == 0 {
                    "Nothing to undo.".to_string()
                } else {
                    "Last round of conversation undone.".to_string()
                }
            }),
            ChatCommand::Stop => self.sessions.cancel(id).map(|stopped| {
                let text = if stopped { "Response stopped." } else { "Nothing to stop." };
                text.to_string()
            }),
            ChatCommand::SetTemp(None) => Err(SessionError::InvalidTemperature(f32::NAN)),
            ChatCommand::SetTemp(Some(temperature)) => self
                .sessions
                .set_temperature(id, temperature)
                .await
                .map(|()| format!("Temperature set to {temperature:.2}.")),
            ChatCommand::Prompt(None) => Ok(self.prompt_list(id)),
            ChatCommand::Prompt(Some(name)) => self
                .sessions
                .set_prompt(id, &name)
                .await
                .map(|()| format!("Prompt switched to `{name}`.")),
            ChatCommand::Status => Ok(self.status(id)),
            ChatCommand::Help => {
                if message.is_from_admin(self.sessions.access()) {
                    Ok(format!("{HELP_TEXT}\n{ADMIN_HELP_TEXT}"))
                } else {
                    Ok(HELP_TEXT.to_string())
                }
            }
            ChatCommand::Clear => {
                self.sessions.reset_all().await;
                Ok("All conversations have been reset.".to_string())
            }
            ChatCommand::Tidy => {
                let removed = self.sessions.reconcile().await;
                Ok(format!("Tidy complete. Removed {removed} stale conversation(s)."))
            }
            ChatCommand::Unknown(name) => Ok(format!("Unknown command /{name}. See /help.")),
        };

        let text = reply.unwrap_or_else(|error| error.user_message());
        self.reply(message.chat_id, &text).await;
    }

    async fn chat(&mut self, message: &InboundMessage, text: &str) {
        if text.trim().is_empty() {
            self.reply(message.chat_id, "Usage: /chat <text>").await;
            return;
        }

        match self.sessions.submit_turn(message.conversation_id, message.chat_id, text).await {
            Ok(generation) => {
                debug!(
                    event_name = "dispatch.turn_accepted",
                    conversation_id = %message.conversation_id,
                    generation,
                    "turn accepted"
                );
            }
            Err(error) => {
                info!(
                    event_name = "dispatch.turn_rejected",
                    conversation_id = %message.conversation_id,
                    error = %error,
                    "turn rejected"
                );
                self.reply(message.chat_id, &error.user_message()).await;
            }
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(error) = self.replies.send_message(chat_id, text, TextFormat::Plain).await {
            warn!(event_name = "dispatch.reply_failed", chat_id, error = %error, "reply not sent");
        }
    }

    fn current_model(&self, id: ConversationId) -> String {
        let Some(record) = self.sessions.conversation(id) else {
            return SessionError::NotAuthorized(id).user_message();
        };
        match self.sessions.catalog().model(record.model()) {
            Some(model) => {
                format!("Current model: {} ({}) by {}.", model.alias, model.name, model.provider)
            }
            None => format!("Current model: {}.", record.model()),
        }
    }

    fn model_list(&self, id: ConversationId) -> String {
        let Some(record) = self.sessions.conversation(id) else {
            return SessionError::NotAuthorized(id).user_message();
        };
        let mut text = String::from("Available models:");
        for alias in record.available_models() {
            let marker = if alias == record.model() { "*" } else { " " };
            match self.sessions.catalog().model(alias) {
                Some(model) => {
                    let _ =
                        write!(text, "\n{marker} {alias}: {} by {}", model.name, model.provider);
                }
                None => {
                    let _ = write!(text, "\n{marker} {alias}");
                }
            }
        }
        text.push_str("\nUse /set <model> to switch.");
        text
    }

    fn prompt_list(&self, id: ConversationId) -> String {
        let Some(record) = self.sessions.conversation(id) else {
            return SessionError::NotAuthorized(id).user_message();
        };
        let mut text = String::from("Available prompts:");
        for name in self.sessions.catalog().prompt_names() {
            let marker = if name == record.prompt() { "*" } else { " " };
            let _ = write!(text, "\n{marker} {name}");
        }
        text.push_str("\nUse /prompt <name> to switch.");
        text
    }

    fn status(&self, id: ConversationId) -> String {
        let Some(record) = self.sessions.conversation(id) else {
            return SessionError::NotAuthorized(id).user_message();
        };
        let state = match record.state() {
            ConversationState::Idle => "idle",
            ConversationState::Responding => "responding",
        };
        format!(
            "Model: {}\nTemperature: {:.2}\nPrompt: {}\nTurns: {}\nState: {state}",
            record.model(),
            record.temperature(),
            record.prompt(),
            record.history().len()
        )
    }
}
