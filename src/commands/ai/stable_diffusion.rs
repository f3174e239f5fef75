use super::*;
use poise::ChoiceParameter;
use genrelay::backends::stable_diffusion::ALLOWED_OPTIONS;

#[derive(Debug, ChoiceParameter)]
pub enum Sampler {
    #[name = "k_lms"]
    KLms,
    #[name = "k_euler"]
    KEuler,
    #[name = "k_euler_a"]
    KEulerA,
    #[name = "k_heun"]
    KHeun,
    #[name = "k_dpm_2"]
    KDpm2,
    #[name = "ddim"]
    Ddim,
    #[name = "plms"]
    Plms,
}

/// Generate images through Stable Diffusion
#[poise::command(slash_command, guild_only, rename = "stablediffusion", category = "AI")]
#[allow(clippy::too_many_arguments)]
pub async fn stable_diffusion(
    ctx: Context<'_>,
    #[description = "What to draw"] prompt: String,
    #[description = "Number of images"]
    #[min = 1]
    #[max = 8]
    count: Option<u32>,
    #[description = "Sampling steps per image"]
    #[min = 1]
    #[max = 150]
    steps: Option<u32>,
    #[description = "How strictly to follow the prompt"] cfgscale: Option<f64>,
    #[description = "Sampler"] sampler: Option<Sampler>,
    #[description = "Seed, -1 for random"] seed: Option<i64>,
    #[description = "Image width in pixels"] width: Option<u32>,
    #[description = "Image height in pixels"] height: Option<u32>,
) -> CommandResult {
    let Some(controller) = ctx.data().stable_diffusion.clone() else {
        ctx.say("Stable Diffusion is not configured here.").await?;
        return Ok(());
    };

    let options = [
        ("steps", steps.map(|v| v.to_string())),
        ("cfgscale", cfgscale.map(|v| v.to_string())),
        ("sampler", sampler.map(|v| v.name().to_string())),
        ("seed", seed.map(|v| v.to_string())),
        ("width", width.map(|v| v.to_string())),
        ("height", height.map(|v| v.to_string())),
    ];
    let request = GenerationRequest::new(prompt)
        .with_count(count.unwrap_or(1))
        .with_options(options.into_iter().filter_map(|(key, value)| Some((key, value?))));
    let request = with_inline_options(ctx, request, count, ALLOWED_OPTIONS);

    relay(ctx, &controller, request).await
}
