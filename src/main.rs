use std::env;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tts_multiplex::config::parse_bool;
use tts_multiplex::{
    ClientConfig, ConnectParams, ContextCallbacks, ContextEvent, MAX_CONTEXTS, MultiContextClient,
    TTSContext,
};

/// How long one context may take to deliver its final chunk
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

const MULTI_TEXTS: [&str; MAX_CONTEXTS] = [
    "Hello, I am your assistant.",
    "The weather is lovely today.",
    "Happy to help you.",
    "Welcome to the product.",
    "Thank you for your support.",
];

const USAGE: &str = "Usage: tts-multiplex speak <context-id> <text>\n       tts-multiplex multi";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let mut args = env::args();
    let _ = args.next();
    let command = args.next().ok_or_else(|| anyhow!(USAGE))?;

    // Load configuration
    let config = ClientConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    let params = ConnectParams::new()
        .with_model_id("flash_v2_5")
        .with_format("pcm_16000");

    let client = MultiContextClient::new(config);
    client.on_global_error(|error| {
        Box::pin(async move {
            error!("Service error: {}", error);
        })
    });

    match command.as_str() {
        "speak" => {
            let context_id = args
                .next()
                .ok_or_else(|| anyhow!("'speak' requires a context id\n{USAGE}"))?;
            let text: Vec<String> = args.collect();
            if text.is_empty() {
                anyhow::bail!("'speak' requires text\n{USAGE}");
            }

            client.connect(params).await?;
            let result = speak(&client, &context_id, &text.join(" ")).await;
            client.disconnect().await;
            result?;
        }
        "multi" => {
            if let Some(extra) = args.next() {
                anyhow::bail!("Unexpected argument '{extra}' after 'multi'");
            }

            client.connect(params).await?;
            let result = multi(&client).await;
            client.disconnect().await;
            result?;
        }
        other => anyhow::bail!("Unknown command '{other}'\n{USAGE}"),
    }

    Ok(())
}

/// `info` by default, `debug` when `TTS_DEBUG` is set; `RUST_LOG` overrides both
fn init_tracing() {
    let debug = env::var("TTS_DEBUG")
        .ok()
        .and_then(|value| parse_bool(&value))
        .unwrap_or(false);
    let default_level = if debug { "debug" } else { "info" };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn speak(client: &MultiContextClient, context_id: &str, text: &str) -> anyhow::Result<()> {
    let ctx = client.create_context(context_id)?;
    let (callbacks, events) = ContextCallbacks::channel();
    ctx.register_callbacks(callbacks);

    info!("[{}] sending: {}", context_id, text);
    ctx.send_text(text, true)?;
    ctx.end_input()?;

    finish(ctx, events).await
}

async fn multi(client: &MultiContextClient) -> anyhow::Result<()> {
    let mut tasks = Vec::with_capacity(MULTI_TEXTS.len());

    for (i, text) in MULTI_TEXTS.iter().enumerate() {
        let context_id = format!("ctx_{:03}", i + 1);
        let ctx = client.create_context(&context_id)?;
        let (callbacks, events) = ContextCallbacks::channel();
        ctx.register_callbacks(callbacks);

        info!("[{}] sending: {}", context_id, text);
        ctx.send_text(text, true)?;
        ctx.end_input()?;

        tasks.push(tokio::spawn(finish(ctx, events)));

        // Stagger the starts a little
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("Waiting for {} contexts to complete", tasks.len());
    for task in tasks {
        if let Err(e) = task.await? {
            warn!("{}", e);
        }
    }

    info!("Active contexts: {}", client.active_context_count());
    Ok(())
}

/// Wait for the context to complete, close it and write its audio to `<context-id>.pcm`
async fn finish(
    ctx: TTSContext,
    mut events: UnboundedReceiver<ContextEvent>,
) -> anyhow::Result<()> {
    let context_id = ctx.context_id().to_string();

    let waited = timeout(COMPLETION_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                ContextEvent::Audio(chunk) => info!(
                    "[{}] received {} bytes of audio (final: {})",
                    chunk.context_id,
                    chunk.data.len(),
                    chunk.is_final
                ),
                ContextEvent::Error(e) => error!("[{}] error: {}", context_id, e),
                ContextEvent::Complete => return,
            }
        }
    })
    .await;

    if let Err(e) = ctx.close() {
        warn!("[{}] close: {}", context_id, e);
    }

    if waited.is_err() {
        anyhow::bail!("[{context_id}] timed out after {COMPLETION_TIMEOUT:?}");
    }

    let audio = ctx.all_audio();
    let path = format!("{context_id}.pcm");
    tokio::fs::write(&path, &audio)
        .await
        .map_err(|e| anyhow!("Failed to write {}: {}", path, e))?;
    info!("[{}] wrote {} bytes to {}", context_id, audio.len(), path);

    Ok(())
}
