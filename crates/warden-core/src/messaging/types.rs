use crate::domain::{ChatId, UserId};

/// A slash command received from a chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub name: String,
    pub args: String,
}

impl Command {
    /// Parse `/name@bot arg1 arg2` into a command. `None` for plain text.
    pub fn parse(chat_id: ChatId, user_id: UserId, username: Option<String>, text: &str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((h, a)) => (h, a.trim()),
            None => (rest, ""),
        };
        let name = head.split('@').next().unwrap_or(head).to_lowercase();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            chat_id,
            user_id,
            username,
            name,
            args: args.to_string(),
        })
    }

    pub fn arg_list(&self) -> Vec<&str> {
        self.args.split_whitespace().collect()
    }
}

/// Outgoing "chat action" (typing indicator).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
}

/// Capabilities / feature flags of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_html: bool,
    pub supports_chat_actions: bool,
    pub max_message_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_args() {
        let c = Command::parse(ChatId(1), UserId(2), None, "/Deactivate@warden_bot 7  abuse report").unwrap();
        assert_eq!(c.name, "deactivate");
        assert_eq!(c.args, "7  abuse report");
        assert_eq!(c.arg_list(), vec!["7", "abuse", "report"]);
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(Command::parse(ChatId(1), UserId(2), None, "hello").is_none());
        assert!(Command::parse(ChatId(1), UserId(2), None, "/").is_none());
    }
}
