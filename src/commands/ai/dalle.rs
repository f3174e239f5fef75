use super::*;
use genrelay::backends::dalle::MAX_IMAGES;

/// Generate images through DALL-E mini
#[poise::command(slash_command, guild_only, category = "AI")]
pub async fn dalle(
    ctx: Context<'_>,
    #[description = "What to draw"] prompt: String,
    #[description = "Number of images"]
    #[min = 1]
    #[max = 4]
    count: Option<u32>,
) -> CommandResult {
    let Some(controller) = ctx.data().dalle.clone() else {
        ctx.say("DALL-E mini is not configured here.").await?;
        return Ok(());
    };

    let request = GenerationRequest::new(prompt).with_count(count.unwrap_or(1).min(MAX_IMAGES));
    let request = with_inline_options(ctx, request, count, &[]);

    relay(ctx, &controller, request).await
}
