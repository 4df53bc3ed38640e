use anyhow::Context;
use avs_client_rs::{
    config::{load_access_token, AvsConfig},
    transport::PushStream,
    ConnectionManager,
};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "avs-send-audio")]
#[command(about = "Send a recorded utterance to the Alexa Voice Service and save the reply")]
struct Args {
    /// Raw 16 kHz mono L16 audio to send
    input: PathBuf,

    /// Where to write the audio reply
    output: PathBuf,

    /// JSON file with the device state sent as event context
    #[arg(long)]
    device_state: Option<PathBuf>,

    /// Service host, overrides AVS_ENDPOINT
    #[arg(long)]
    endpoint: Option<String>,
}

/// Log pushed directive data until the session closes
async fn read_downchannel(mut stream: PushStream) {
    while let Some(chunk) = stream.next_chunk().await {
        match chunk {
            Ok(chunk) => log::info!("📥 Downchannel: {} bytes", chunk.len()),
            Err(e) => {
                log::warn!("Downchannel failed: {}", e);
                break;
            }
        }
    }
    log::info!("Downchannel closed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = AvsConfig::from_env()?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    let auth = load_access_token()?.auth_headers();

    let device_state: serde_json::Value = match &args.device_state {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading device state from {}", path.display()))?;
            serde_json::from_slice(&raw).context("parsing device state")?
        }
        None => serde_json::json!([]),
    };

    log::info!("🚀 Connecting to {}", config.endpoint);
    let mut manager = ConnectionManager::new(config);
    manager.create_connection().await?;
    manager.establish_downchannel_stream(&auth).await?;
    let downchannel = manager
        .take_downchannel()
        .map(|stream| tokio::spawn(read_downchannel(stream)));

    manager.synchronize_device_state(&auth, &device_state).await?;

    let audio = tokio::fs::File::open(&args.input)
        .await
        .with_context(|| format!("opening {}", args.input.display()))?;
    match manager.send_audio_file(&auth, &device_state, audio).await? {
        Some(reply) => {
            tokio::fs::write(&args.output, &reply)
                .await
                .with_context(|| format!("writing {}", args.output.display()))?;
            println!("🗣️  Saved {} bytes of reply audio to {}", reply.len(), args.output.display());
        }
        None => println!("🤐 No spoken reply"),
    }

    manager.close();
    if let Some(handle) = downchannel {
        let _ = handle.await;
    }

    Ok(())
}
