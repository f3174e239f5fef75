//! Commands that relay prompts to the chat and image backends.
//!
//! Every command follows the same shape: build a [`GenerationRequest`], start
//! it on the matching [`JobController`], wait for the outcome while listening
//! for the Cancel button, then post the result.

/// Submodule defining the `/chatgpt` command.
pub(crate) mod chat;
/// Submodule defining the `/dalle` command.
pub(crate) mod dalle;
/// Submodule defining the `/stablediffusion` command.
pub(crate) mod stable_diffusion;
/// Discord implementations of the status and delivery surfaces.
pub(crate) mod surface;

use std::sync::Arc;

use poise::serenity_prelude::ComponentInteractionCollector;
use tracing::{error, info, warn};

use genrelay::relay::{
    GenerationRequest, JobController, JobKind, Outcome, PROMPT_EXCERPT_CHARS, deliver_all, excerpt,
};
use genrelay::utils::prompt_options;

use crate::CommandResult;
use crate::Context;
use surface::{ChannelDelivery, ChannelStatus};

/// Folds legacy `key:value` tokens from the prompt into `request` when
/// inline options are enabled. `count` is the count the user passed
/// explicitly, if any.
fn with_inline_options(
    ctx: Context<'_>,
    request: GenerationRequest,
    count: Option<u32>,
    allowed: &[&str],
) -> GenerationRequest {
    if !ctx.data().inline_options {
        return request;
    }
    prompt_options::parse(request.prompt(), allowed).apply(request, count)
}

/// Runs `request` on `controller` and reports the outcome in the channel.
pub(crate) async fn relay(
    ctx: Context<'_>,
    controller: &JobController,
    request: GenerationRequest,
) -> CommandResult {
    ctx.defer().await?;

    let http = ctx.serenity_context().http.clone();
    let cancel_id = format!("relay_cancel_{}", ctx.id());
    let status = Arc::new(ChannelStatus::new(http.clone(), ctx.channel_id(), cancel_id.clone()));
    let prompt = excerpt(request.prompt(), PROMPT_EXCERPT_CHARS);
    let kind = controller.kind();

    let handle = match controller.start(request, status) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("{} refused for {}: {}", kind, ctx.author().name, e);
            ctx.say(format!("Something went wrong... :( [{}]", e.category().user_message()))
                .await?;
            return Ok(());
        }
    };
    let control = handle.control();
    info!("{} started {} for {}", handle.id(), kind, ctx.author().name);

    let outcome = handle.outcome();
    tokio::pin!(outcome);
    let outcome = loop {
        tokio::select! {
            outcome = &mut outcome => break outcome,
            press = ComponentInteractionCollector::new(ctx.serenity_context())
                .channel_id(ctx.channel_id())
                .custom_ids(vec![cancel_id.clone()]) => {
                let Some(press) = press else { continue };
                if let Err(e) = press.defer(ctx.http()).await {
                    warn!("Failed to acknowledge cancel button: {}", e);
                }
                if control.cancel() {
                    info!("{} cancelled by {}", kind, press.user.name);
                }
            }
        }
    };

    match outcome {
        Outcome::Succeeded { chunks, .. } if chunks.is_empty() => {
            ctx.say(format!("I didn't find anything for `{prompt}`.")).await?;
        }
        Outcome::Succeeded { chunks, elapsed } => {
            let header = match kind {
                JobKind::Chat => format!("**{}**: {prompt}", ctx.author().name),
                _ => format!(
                    "{kind} results for `{prompt}` ({:.1}s)",
                    elapsed.as_secs_f64()
                ),
            };
            if let Err(e) = ctx.say(header).await {
                warn!("Failed to post results header: {}", e);
            }

            let delivery = ChannelDelivery::new(
                http,
                ctx.channel_id(),
                format!("{kind} results"),
                ctx.author().name.clone(),
            );
            let report = deliver_all(&delivery, &chunks).await;
            if !report.is_complete() {
                ctx.say(format!(
                    "Discord is sucking... >:( {} of {} result message(s) could not be posted",
                    report.failed,
                    chunks.len()
                ))
                .await?;
            }
        }
        Outcome::Cancelled => {
            ctx.say("Cancelled.").await?;
        }
        Outcome::Failed { category, detail } => {
            error!("{} failed for {}: {}", kind, ctx.author().name, detail);
            ctx.say(format!("Something went wrong... :( [{}]", category.user_message()))
                .await?;
        }
    }

    Ok(())
}
