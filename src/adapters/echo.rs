//! Echo dialogue engine: replies with what the user said.
//!
//! Lets the whole pipeline run end to end with only a transcriber and synthesizer
//! configured.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::adapters::{DialogueEngine, ReplyChunk, ReplyStream};
use crate::error::{VoiceError, VoiceResult};
use crate::session::conversation::ConversationContext;

#[derive(Debug, Clone)]
pub struct EchoDialogue {
    prefix: String,
}

impl EchoDialogue {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl Default for EchoDialogue {
    fn default() -> Self {
        Self::new("You said: ")
    }
}

#[async_trait]
impl DialogueEngine for EchoDialogue {
    async fn respond(
        &self,
        _context: ConversationContext,
        user_text: String,
        cancel: CancellationToken,
    ) -> VoiceResult<ReplyStream> {
        if cancel.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }

        // One token per word, so streaming synthesis sees an incremental reply
        let reply = format!("{}{}", self.prefix, user_text.trim());
        let mut chunks: Vec<VoiceResult<ReplyChunk>> = Vec::new();
        for (i, word) in reply.split_whitespace().enumerate() {
            let token = if i == 0 { word.to_string() } else { format!(" {}", word) };
            chunks.push(Ok(ReplyChunk::Token(token)));
        }
        chunks.push(Ok(ReplyChunk::EndOfReply));

        Ok(stream::iter(chunks)
            .take_until(cancel.cancelled_owned())
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_reply() {
        let engine = EchoDialogue::default();
        let stream = engine
            .respond(ConversationContext::new("preamble"), "hello world".into(), CancellationToken::new())
            .await
            .unwrap();

        let chunks: Vec<ReplyChunk> = stream.map(|c| c.unwrap()).collect().await;
        let text: String = chunks
            .iter()
            .filter_map(|c| match c {
                ReplyChunk::Token(t) => Some(t.as_str()),
                ReplyChunk::EndOfReply => None,
            })
            .collect();
        assert_eq!(text, "You said: hello world");
        assert_eq!(chunks.last(), Some(&ReplyChunk::EndOfReply));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = EchoDialogue::default()
            .respond(ConversationContext::new(""), "hi".into(), cancel)
            .await;
        assert!(matches!(result, Err(VoiceError::Cancelled)));
    }
}
