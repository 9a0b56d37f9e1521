use std::fmt;

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use runcell_protocol::GeneratedFile;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A file carried alongside a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    #[serde(with = "runcell_protocol::files::base64_bytes")]
    pub bytes: Vec<u8>,
}

impl From<GeneratedFile> for Attachment {
    fn from(file: GeneratedFile) -> Self {
        Self {
            name: file.name,
            mime_type: file.mime_type,
            bytes: file.bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    /// Still streaming from the model.
    #[serde(default)]
    pub is_loading: bool,
    /// Stopped by the user before completion.
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ChatMessage {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(id),
            role,
            content: content.into(),
            is_loading: false,
            interrupted: false,
            attachments: Vec::new(),
        }
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, content)
    }

    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(id, Role::User, content)
    }
}

/// Read and write access to the conversation.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn last_message(&self) -> Option<ChatMessage>;

    /// True while the model is producing a turn.
    async fn is_generating(&self) -> bool;

    /// Replaces the content of `id` and appends `attachments` to it.
    async fn update_message(
        &self,
        id: &MessageId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<()>;
}

/// The "continue generation from message X" signal.
#[async_trait]
pub trait GenerationPipeline: Send + Sync {
    async fn continue_from(&self, id: &MessageId) -> Result<()>;
}

/// A [`TranscriptStore`] kept in memory. Every mutation bumps a revision
/// counter that [`InMemoryTranscript::revisions`] exposes.
pub struct InMemoryTranscript {
    messages: Mutex<Vec<ChatMessage>>,
    generating: Mutex<bool>,
    revision: watch::Sender<u64>,
}

impl Default for InMemoryTranscript {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl InMemoryTranscript {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            messages: Mutex::new(messages),
            generating: Mutex::new(false),
            revision,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let messages: Vec<ChatMessage> = serde_json::from_str(raw)?;
        Ok(Self::new(messages))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&*self.messages.lock())?)
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }

    pub fn push(&self, message: ChatMessage) {
        self.messages.lock().push(message);
        self.bump();
    }

    /// Applies `edit` to message `id`, if present.
    pub fn edit(&self, id: &MessageId, edit: impl FnOnce(&mut ChatMessage)) -> bool {
        let found = {
            let mut messages = self.messages.lock();
            match messages.iter_mut().find(|message| &message.id == id) {
                Some(message) => {
                    edit(message);
                    true
                }
                None => false,
            }
        };
        if found {
            self.bump();
        }
        found
    }

    pub fn set_generating(&self, generating: bool) {
        *self.generating.lock() = generating;
        self.bump();
    }

    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscript {
    async fn last_message(&self) -> Option<ChatMessage> {
        self.messages.lock().last().cloned()
    }

    async fn is_generating(&self) -> bool {
        *self.generating.lock()
    }

    async fn update_message(
        &self,
        id: &MessageId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<()> {
        let updated = self.edit(id, |message| {
            message.content = content;
            message.attachments.extend(attachments);
        });
        if !updated {
            bail!("message {id} not found in transcript");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_json_uses_defaults() {
        let raw = r#"[
            {"id": "u1", "role": "user", "content": "plot it"},
            {"id": "a1", "role": "assistant", "content": "sure", "is_loading": true}
        ]"#;
        let transcript = InMemoryTranscript::from_json(raw).unwrap();
        let messages = transcript.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].is_loading);
        assert!(!messages[1].interrupted);
    }

    #[tokio::test]
    async fn update_appends_attachments_and_bumps_revision() {
        let transcript = InMemoryTranscript::new(vec![ChatMessage::assistant("a1", "hi")]);
        let revisions = transcript.revisions();
        let id = MessageId::new("a1");

        transcript
            .update_message(
                &id,
                "hi again".to_owned(),
                vec![Attachment::from(GeneratedFile::new("out.txt", "text/plain", b"x".to_vec()))],
            )
            .await
            .unwrap();

        let last = transcript.last_message().await.unwrap();
        assert_eq!(last.content, "hi again");
        assert_eq!(last.attachments.len(), 1);
        assert!(revisions.has_changed().unwrap());

        let missing = transcript
            .update_message(&MessageId::new("nope"), String::new(), Vec::new())
            .await;
        assert!(missing.is_err());
    }
}
