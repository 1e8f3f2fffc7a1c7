/// Bot commands understood by the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatCommand {
    Chat(String),
    New,
    Set(String),
    List,
    Undo,
    Stop,
    /// `None` when the argument is not a number.
    SetTemp(Option<f32>),
    Prompt(Option<String>),
    Status,
    Help,
    Clear,
    Tidy,
    Unknown(String),
}

impl ChatCommand {
    pub fn is_admin_only(&self) -> bool {
        matches!(self, Self::Clear | Self::Tidy)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Chat(_) => "chat",
            Self::New => "new",
            Self::Set(_) => "set",
            Self::List => "list",
            Self::Undo => "undo",
            Self::Stop => "stop",
            Self::SetTemp(_) => "set_temp",
            Self::Prompt(_) => "prompt",
            Self::Status => "status",
            Self::Help => "help",
            Self::Clear => "clear",
            Self::Tidy => "tidy",
            Self::Unknown(name) => name,
        }
    }
}

pub const HELP_TEXT: &str = "\
/chat <text> - talk to the model (plain text works in private chats)
/new - start a new conversation
/set <model> - switch model
/list - list the models you can use
/undo - forget the last round
/stop - stop the current response
/set_temp <0.0-2.0> - set the sampling temperature
/prompt [name] - show or switch the system prompt
/status - show the current settings
/help - show this message";

pub const ADMIN_HELP_TEXT: &str = "\
/clear - reset every conversation
/tidy - delete stored conversations that are no longer allowed";

/// Parses a message starting with `/`. Returns `None` for anything else.
/// A `@botname` suffix on the command is ignored.
pub fn parse_command(text: &str) -> Option<ChatCommand> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (head, args) = match rest.find(char::is_whitespace) {
        Some(index) => (&rest[..index], rest[index..].trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }

    let command = match name.as_str() {
        "chat" => ChatCommand::Chat(args.to_string()),
        "new" => ChatCommand::New,
        "set" => ChatCommand::Set(args.to_string()),
        "list" => ChatCommand::List,
        "undo" => ChatCommand::Undo,
        "stop" => ChatCommand::Stop,
        "set_temp" => ChatCommand::SetTemp(args.parse::<f32>().ok().filter(|t| t.is_finite())),
        "prompt" => ChatCommand::Prompt((!args.is_empty()).then(|| args.to_string())),
        "status" => ChatCommand::Status,
        "help" | "start" => ChatCommand::Help,
        "clear" => ChatCommand::Clear,
        "tidy" => ChatCommand::Tidy,
        _ => ChatCommand::Unknown(name),
    };
    Some(command)
}
