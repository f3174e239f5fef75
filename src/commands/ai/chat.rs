use super::*;

/// Ask ChatGPT a question
#[poise::command(slash_command, guild_only, category = "AI")]
pub async fn chatgpt(
    ctx: Context<'_>,
    #[description = "Your question"]
    #[rest]
    prompt: String,
) -> CommandResult {
    let Some(controller) = ctx.data().chat.clone() else {
        ctx.say("ChatGPT is not configured here.").await?;
        return Ok(());
    };

    relay(ctx, &controller, GenerationRequest::new(prompt)).await
}
