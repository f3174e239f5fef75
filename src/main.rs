use std::sync::Arc;

use ::serenity::all::ClientBuilder;
use dotenv::dotenv;
use poise::serenity_prelude as serenity;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use genrelay::backends::{
    self, BackendClient, ChatBackend, DalleBackend, StableDiffusionBackend, UnknownOptions,
};
use genrelay::relay::{AdmissionLimiter, JobController};
use genrelay::utils::config::BotConfig;

mod commands;

use commands::ai::{chat::*, dalle::*, stable_diffusion::*};

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;
type CommandResult = Result<(), Error>;

/// Shared state handed to every command invocation.
struct Data {
    chat: Option<Arc<JobController>>,
    dalle: Option<Arc<JobController>>,
    stable_diffusion: Option<Arc<JobController>>,
    inline_options: bool,
}

#[poise::command(slash_command, category = "General")]
async fn help(
    ctx: Context<'_>,
    #[description = "Specific command to show help about"]
    #[autocomplete = "poise::builtins::autocomplete_command"]
    command: Option<String>,
) -> CommandResult {
    poise::builtins::help(
        ctx,
        command.as_deref(),
        poise::builtins::HelpConfiguration {
            show_context_menu_commands: true,
            ..Default::default()
        },
    )
    .await
    .map_err(|e| e.into())
}

#[poise::command(prefix_command, hide_in_help)]
async fn register(ctx: Context<'_>) -> Result<(), Error> {
    poise::builtins::register_application_commands_buttons(ctx)
        .await
        .map_err(|e| e.into())
}

fn controller(
    config: &BotConfig,
    limiter: &Arc<AdmissionLimiter>,
    backend: Arc<dyn BackendClient>,
) -> Arc<JobController> {
    let settings = config.relay_settings(backend.spec().kind);
    Arc::new(JobController::new(backend, limiter.clone(), settings))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize logging with debug level for our crate
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("genrelay=debug,warn")),
        )
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_target(true)
        .with_ansi(true)
        .pretty()
        .init();

    dotenv().ok();

    let config = BotConfig::from_env()?;
    let http = backends::http_client(config.request_timeout)?;
    let limiter = Arc::new(config.limits.limiter());

    let mut commands = vec![register(), help()];

    let chat = config.chat_endpoint.clone().map(|endpoint| {
        commands.push(chatgpt());
        controller(&config, &limiter, Arc::new(ChatBackend::new(http.clone(), endpoint)))
    });
    let dalle = config.dalle_endpoint.clone().map(|endpoint| {
        commands.push(self::dalle());
        controller(&config, &limiter, Arc::new(DalleBackend::new(http.clone(), endpoint)))
    });
    let stable_diffusion = config.stable_diffusion_endpoint.clone().map(|endpoint| {
        let unknown = if config.passthrough_options {
            UnknownOptions::PassThrough
        } else {
            UnknownOptions::Reject
        };
        commands.push(self::stable_diffusion());
        controller(
            &config,
            &limiter,
            Arc::new(StableDiffusionBackend::new(http.clone(), endpoint).with_unknown_options(unknown)),
        )
    });

    if commands.len() == 2 {
        warn!("No backend endpoint is configured; only the help commands are available");
    }
    info!("Registering {} command(s)", commands.len());

    let data = Data {
        chat,
        dalle,
        stable_diffusion,
        inline_options: config.inline_options,
    };

    let intents =
        serenity::GatewayIntents::non_privileged() | serenity::GatewayIntents::MESSAGE_CONTENT;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands,
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(data)
            })
        });

    let mut client = ClientBuilder::new(&config.discord_token, intents)
        .framework(framework.build())
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutting down");
        shard_manager.shutdown_all().await;
    });

    client.start().await.map_err(Into::into)
}
