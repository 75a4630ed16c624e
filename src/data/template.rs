//! Chat templates.
//!
//! A template turns a conversation into text segments. Each segment knows
//! whether its tokens contribute to the training loss: only assistant
//! content and the assistant end-of-turn marker do.

use super::{Conversation, Role};
use crate::error::{Error, Result};

/// A run of rendered text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub trainable: bool,
}

impl Segment {
    fn fixed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            trainable: false,
        }
    }

    fn trained(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            trainable: true,
        }
    }
}

/// Turn markers for one model family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTemplate {
    pub name: &'static str,
    /// Text emitted once before the first turn.
    pub bos: &'static str,
    /// System prompt used when the conversation has none.
    pub system_prompt: Option<&'static str>,
    pub system_header: &'static str,
    pub user_header: &'static str,
    pub assistant_header: &'static str,
    pub end_of_turn: &'static str,
    /// Prefix inserted at the start of assistant content when missing.
    pub assistant_prefix: Option<&'static str>,
}

const QWEN: ChatTemplate = ChatTemplate {
    name: "qwen",
    bos: "",
    system_prompt: Some("You are a helpful assistant."),
    system_header: "<|im_start|>system\n",
    user_header: "<|im_start|>user\n",
    assistant_header: "<|im_start|>assistant\n",
    end_of_turn: "<|im_end|>\n",
    assistant_prefix: None,
};

const QWEN3_THINKING: ChatTemplate = ChatTemplate {
    name: "qwen3-thinking",
    bos: "",
    system_prompt: None,
    system_header: "<|im_start|>system\n",
    user_header: "<|im_start|>user\n",
    assistant_header: "<|im_start|>assistant\n",
    end_of_turn: "<|im_end|>\n",
    assistant_prefix: Some("<think>\n\n</think>\n\n"),
};

const LLAMA3: ChatTemplate = ChatTemplate {
    name: "llama3",
    bos: "<|begin_of_text|>",
    system_prompt: Some("You are a helpful assistant."),
    system_header: "<|start_header_id|>system<|end_header_id|>\n\n",
    user_header: "<|start_header_id|>user<|end_header_id|>\n\n",
    assistant_header: "<|start_header_id|>assistant<|end_header_id|>\n\n",
    end_of_turn: "<|eot_id|>",
    assistant_prefix: None,
};

impl ChatTemplate {
    /// Names accepted by [`ChatTemplate::by_name`].
    pub const NAMES: [&'static str; 3] = ["qwen", "qwen3-thinking", "llama3"];

    /// Looks up a template by name.
    pub fn by_name(name: &str) -> Result<Self> {
        match name {
            "qwen" => Ok(QWEN),
            "qwen3-thinking" => Ok(QWEN3_THINKING),
            "llama3" => Ok(LLAMA3),
            other => Err(Error::Config(format!(
                "unknown chat template '{other}' (expected one of {:?})",
                Self::NAMES
            ))),
        }
    }

    /// Renders a conversation into segments.
    pub fn render(&self, conversation: &Conversation) -> Vec<Segment> {
        let mut segments = Vec::with_capacity(conversation.conversations.len() * 2 + 2);
        let mut header = String::from(self.bos);

        let has_system = conversation
            .conversations
            .first()
            .is_some_and(|m| m.role == Role::System);
        if !has_system && let Some(prompt) = self.system_prompt {
            header.push_str(self.system_header);
            header.push_str(prompt);
            header.push_str(self.end_of_turn);
        }

        for message in &conversation.conversations {
            match message.role {
                Role::System => {
                    header.push_str(self.system_header);
                    header.push_str(&message.content);
                    header.push_str(self.end_of_turn);
                }
                Role::User => {
                    header.push_str(self.user_header);
                    header.push_str(&message.content);
                    header.push_str(self.end_of_turn);
                }
                Role::Assistant => {
                    header.push_str(self.assistant_header);
                    segments.push(Segment::fixed(std::mem::take(&mut header)));

                    let mut content = String::new();
                    if let Some(prefix) = self.assistant_prefix
                        && !message.content.starts_with("<think>")
                    {
                        content.push_str(prefix);
                    }
                    content.push_str(&message.content);
                    content.push_str(self.end_of_turn);
                    segments.push(Segment::trained(content));
                }
            }
        }
        if !header.is_empty() {
            segments.push(Segment::fixed(header));
        }
        segments
    }

    /// Renders a conversation to one string.
    pub fn render_text(&self, conversation: &Conversation) -> String {
        self.render(conversation)
            .into_iter()
            .map(|s| s.text)
            .collect()
    }
}
