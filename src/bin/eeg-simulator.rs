use anyhow::Context;
use clap::Parser;
use eeg_ingest::simulator::ReadingGenerator;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

const MAX_RATE_HZ: f64 = 10_000.0;

/// Publish synthetic EEG readings on a ZeroMQ PUB socket
#[derive(Parser, Debug)]
#[command(name = "eeg-simulator", version, about)]
struct Args {
    /// Endpoint to bind
    #[arg(long, default_value = "tcp://0.0.0.0:5556")]
    bind: String,

    /// Topic frame sent with every reading
    #[arg(long, default_value = "eeg/data")]
    topic: String,

    /// Patient the readings belong to
    #[arg(long, default_value_t = 1)]
    patient_id: i64,

    /// Channels per reading
    #[arg(long, default_value_t = 8)]
    channels: usize,

    /// Readings per second
    #[arg(long, default_value_t = 10.0)]
    rate_hz: f64,

    /// Stop after this many readings (runs until interrupted when omitted)
    #[arg(long)]
    count: Option<u64>,
}

impl Args {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.rate_hz.is_finite() && self.rate_hz > 0.0 && self.rate_hz <= MAX_RATE_HZ,
            "--rate-hz must be positive and at most {}",
            MAX_RATE_HZ
        );
        Ok(())
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eeg_simulator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    args.validate()?;

    let mut socket = PubSocket::new();
    socket
        .bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!(
        "Publishing patient {} on {} (topic '{}', {} Hz)",
        args.patient_id, args.bind, args.topic, args.rate_hz
    );

    let mut generator = ReadingGenerator::new(args.patient_id, args.channels);
    let mut interval = tokio::time::interval(args.period());
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = interval.tick() => {}
        }

        let payload = generator.next_payload()?;
        let mut message = ZmqMessage::from(payload.into_bytes());
        message.prepend(&ZmqMessage::from(args.topic.clone().into_bytes()));
        socket.send(message).await.context("Failed to publish reading")?;

        sent += 1;
        if sent % 100 == 0 {
            debug!("Published {} readings", sent);
        }
        if args.count.is_some_and(|count| sent >= count) {
            break;
        }
    }

    info!("Published {} readings", sent);
    let _ = socket.close().await;
    Ok(())
}
