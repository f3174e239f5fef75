//! Status and delivery surfaces backed by Discord channel messages.

use std::sync::Arc;

use async_trait::async_trait;
use poise::serenity_prelude::{
    ButtonStyle, ChannelId, Colour, CreateActionRow, CreateAttachment, CreateButton, CreateEmbed,
    CreateEmbedFooter, CreateMessage, EditMessage, Http, MessageId, ReactionType,
};
use tracing::debug;

use genrelay::relay::{
    Artifact, ArtifactPayload, ChunkContent, DeliverySurface, OutputChunk, StatusSurface,
    SurfaceHandle, SurfaceResult,
};

/// Progress shown as channel messages edited in place.
pub struct ChannelStatus {
    http: Arc<Http>,
    channel_id: ChannelId,
    cancel_id: String,
}

impl ChannelStatus {
    pub fn new(http: Arc<Http>, channel_id: ChannelId, cancel_id: impl Into<String>) -> Self {
        Self {
            http,
            channel_id,
            cancel_id: cancel_id.into(),
        }
    }
}

fn cancel_button(custom_id: &str) -> Vec<CreateActionRow> {
    let cancel = CreateButton::new(custom_id)
        .emoji(ReactionType::Unicode("✖️".to_string()))
        .style(ButtonStyle::Danger)
        .label("Cancel");

    vec![CreateActionRow::Buttons(vec![cancel])]
}

#[async_trait]
impl StatusSurface for ChannelStatus {
    async fn create(&self, text: &str) -> SurfaceResult<SurfaceHandle> {
        let message = self
            .channel_id
            .send_message(&self.http, CreateMessage::new().content(text))
            .await?;
        Ok(SurfaceHandle::new(message.id.get()))
    }

    async fn update(&self, handle: SurfaceHandle, text: &str) -> SurfaceResult<()> {
        self.channel_id
            .edit_message(
                &self.http,
                MessageId::new(handle.get()),
                EditMessage::new().content(text),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, handle: SurfaceHandle) -> SurfaceResult<()> {
        self.channel_id
            .delete_message(&self.http, MessageId::new(handle.get()))
            .await?;
        Ok(())
    }

    async fn add_cancel_affordance(&self, handle: SurfaceHandle) -> SurfaceResult<()> {
        self.channel_id
            .edit_message(
                &self.http,
                MessageId::new(handle.get()),
                EditMessage::new().components(cancel_button(&self.cancel_id)),
            )
            .await?;
        Ok(())
    }

    async fn remove_cancel_affordance(&self, handle: SurfaceHandle) -> SurfaceResult<()> {
        self.channel_id
            .edit_message(
                &self.http,
                MessageId::new(handle.get()),
                EditMessage::new().components(Vec::new()),
            )
            .await?;
        Ok(())
    }
}

/// Final results posted as plain messages or image embeds.
pub struct ChannelDelivery {
    http: Arc<Http>,
    channel_id: ChannelId,
    title: String,
    requester: String,
}

impl ChannelDelivery {
    pub fn new(http: Arc<Http>, channel_id: ChannelId, title: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            http,
            channel_id,
            title: title.into(),
            requester: requester.into(),
        }
    }

    fn footer(&self, caption: &str, artifact: &Artifact) -> String {
        let mut footer = format!("{caption}, requested by {}", self.requester);
        if let Some(seed) = artifact.seed {
            footer.push_str(&format!("\nSeed: {seed}"));
        }
        footer.push_str("\nView this output on a desktop client for best results.");
        footer
    }

    fn artifact_message(&self, caption: &str, artifacts: &[Artifact]) -> CreateMessage {
        let mut message = CreateMessage::new();
        let mut embeds = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            let file_name = artifact.file_name();
            let bytes = match &artifact.payload {
                ArtifactPayload::Image(bytes) => {
                    embeds.push(
                        CreateEmbed::new()
                            .title(&self.title)
                            .colour(Colour::BLURPLE)
                            .image(format!("attachment://{file_name}"))
                            .footer(CreateEmbedFooter::new(self.footer(caption, artifact))),
                    );
                    bytes.clone()
                }
                ArtifactPayload::Text(text) => text.clone().into_bytes(),
            };
            message = message.add_file(CreateAttachment::bytes(bytes, file_name));
        }

        message.embeds(embeds)
    }
}

#[async_trait]
impl DeliverySurface for ChannelDelivery {
    async fn deliver(&self, chunk: &OutputChunk) -> SurfaceResult<()> {
        let message = match &chunk.content {
            ChunkContent::Text(text) => CreateMessage::new().content(text),
            ChunkContent::Artifacts(artifacts) => self.artifact_message(&chunk.caption, artifacts),
        };

        let sent = self.channel_id.send_message(&self.http, message).await?;
        debug!("Delivered chunk as message {}", sent.id);
        Ok(())
    }
}
