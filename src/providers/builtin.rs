//! Built-in leaf adapters
//!
//! - `channel`: input fed programmatically through an mpsc sender
//! - `console`: input read line by line from stdin
//! - `log`: output that writes render parameters to the log

use super::input::{InputProvider, RawDataStream};
use super::output::OutputProvider;
use crate::events::EventBus;
use crate::messages::{ProviderInfo, RawData, RenderParameters};
use crate::{MurmurError, Result};
use async_stream::stream;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Input provider fed through a channel
pub struct ChannelInput {
    name: String,
    rx: Option<mpsc::Receiver<RawData>>,
    cancel: CancellationToken,
}

impl ChannelInput {
    /// Create the provider and the sender that feeds it
    pub fn new(name: impl Into<String>, buffer: usize) -> (Self, mpsc::Sender<RawData>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let provider = Self {
            name: name.into(),
            rx: Some(rx),
            cancel: CancellationToken::new(),
        };
        (provider, tx)
    }
}

#[async_trait]
impl InputProvider for ChannelInput {
    fn info(&self) -> ProviderInfo {
        ProviderInfo::new(self.name.clone())
            .with_description("Programmatic input channel")
            .with_data_types(&["text"])
    }

    async fn start(&mut self) -> Result<RawDataStream> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| MurmurError::provider(&self.name, "already started"))?;
        let cancel = self.cancel.clone();

        Ok(Box::pin(stream! {
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => None,
                    item = rx.recv() => item,
                };
                match item {
                    Some(raw) => yield Ok(raw),
                    None => break,
                }
            }
        }))
    }

    async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Input provider reading lines from stdin
pub struct ConsoleInput {
    name: String,
    cancel: CancellationToken,
    started: bool,
}

impl ConsoleInput {
    pub const NAME: &'static str = "console";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cancel: CancellationToken::new(),
            started: false,
        }
    }
}

impl Default for ConsoleInput {
    fn default() -> Self {
        Self::new(Self::NAME)
    }
}

#[async_trait]
impl InputProvider for ConsoleInput {
    fn info(&self) -> ProviderInfo {
        ProviderInfo::new(self.name.clone())
            .with_description("Lines typed on standard input")
            .with_data_types(&["text"])
    }

    async fn start(&mut self) -> Result<RawDataStream> {
        if self.started {
            return Err(MurmurError::provider(&self.name, "already started"));
        }
        self.started = true;

        let name = self.name.clone();
        let cancel = self.cancel.clone();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        Ok(Box::pin(stream! {
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => Ok(None),
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => yield Ok(RawData::text(line, name.clone())),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(MurmurError::from(e));
                        break;
                    }
                }
            }
        }))
    }

    async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Output provider that logs what would be rendered
pub struct LogOutput {
    name: String,
}

impl LogOutput {
    pub const NAME: &'static str = "log";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LogOutput {
    fn default() -> Self {
        Self::new(Self::NAME)
    }
}

#[async_trait]
impl OutputProvider for LogOutput {
    fn info(&self) -> ProviderInfo {
        ProviderInfo::new(self.name.clone()).with_description("Writes render parameters to the log")
    }

    async fn setup(&mut self, _bus: Arc<EventBus>) -> Result<()> {
        Ok(())
    }

    async fn render(&mut self, parameters: &RenderParameters) -> Result<()> {
        if parameters.subtitle_enabled && !parameters.subtitle_text.is_empty() {
            info!(renderer = %self.name, "Subtitle: {}", parameters.subtitle_text);
        }
        if parameters.expressions_enabled && !parameters.expressions.is_empty() {
            info!(renderer = %self.name, expressions = ?parameters.expressions, "Expressions");
        }
        if parameters.hotkeys_enabled && !parameters.hotkeys.is_empty() {
            info!(renderer = %self.name, hotkeys = ?parameters.hotkeys, "Hotkeys");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_channel_input_streams_until_stopped() {
        let (mut input, tx) = ChannelInput::new("test", 8);
        let mut stream = input.start().await.unwrap();

        tx.send(RawData::text("one", "test")).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.content.as_text(), Some("one"));

        input.stop().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_input_not_restartable() {
        let (mut input, _tx) = ChannelInput::new("test", 8);
        let _stream = input.start().await.unwrap();
        assert!(input.start().await.is_err());
    }

    #[tokio::test]
    async fn test_log_output_renders() {
        let mut output = LogOutput::default();
        output.setup(Arc::new(EventBus::default())).await.unwrap();
        assert!(output.render(&RenderParameters::speech("hi")).await.is_ok());
    }
}
