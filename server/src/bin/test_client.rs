use clap::Parser;
use env_logger::Env;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use rand::Rng;
use shared::{ClientEvent, MovementRecord, ServerEvent, WireCodec};
use std::time::Duration;
use tokio::time::{interval, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Scripted participant: joins a room, moves around, fires once and logs
/// everything the relay sends back.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address
    #[arg(short = 's', long, default_value = "127.0.0.1:3000")]
    server: String,

    /// Room to join
    #[arg(short = 'r', long, default_value = "12345678-1234-5678-1234-567812345678")]
    room: String,

    /// Participant id; random when omitted
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Number of moves to send
    #[arg(short = 'm', long, default_value = "10")]
    moves: u32,

    /// Milliseconds between moves
    #[arg(short = 'i', long, default_value = "500")]
    interval_ms: u64,

    /// Frame codec: json or bincode
    #[arg(short = 'c', long, default_value = "json")]
    codec: WireCodec,
}

fn random_user_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

/// A unit-length direction and the facing that goes with it
fn random_move() -> MovementRecord {
    let angle: f32 = rand::thread_rng().gen_range(0.0..std::f32::consts::TAU);
    MovementRecord::new(angle.cos(), angle.sin(), angle - std::f32::consts::FRAC_PI_2)
}

fn encode(codec: WireCodec, event: &ClientEvent) -> Result<Message, Box<dyn std::error::Error>> {
    let bytes = codec.encode(event)?;
    Ok(match codec {
        WireCodec::Json => Message::text(String::from_utf8(bytes)?),
        WireCodec::Bincode => Message::binary(bytes),
    })
}

fn describe(message: &Message) -> Option<ServerEvent> {
    let decoded = match message {
        Message::Text(text) => WireCodec::Json.decode(text.as_str().as_bytes()),
        Message::Binary(data) => WireCodec::Bincode.decode(data),
        _ => return None,
    };
    match decoded {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Undecodable frame: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let user_id = args.user.clone().unwrap_or_else(random_user_id);

    let url = format!(
        "ws://{}/?{}={}&{}={}&{}={}",
        args.server,
        shared::USER_ID_PARAM,
        user_id,
        shared::ROOM_ID_PARAM,
        args.room,
        shared::CODEC_PARAM,
        args.codec
    );
    info!("Connecting to {} as {}", url, user_id);

    let (ws_stream, _) = connect_async(url.as_str()).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut ticker = interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut sent = 0;

    while sent < args.moves {
        tokio::select! {
            _ = ticker.tick() => {
                let record = random_move();
                ws_sender.send(encode(args.codec, &ClientEvent::Move(record))?).await?;
                sent += 1;
                info!("Sent move {}/{}: {:?}", sent, args.moves, record);
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(message)) => {
                    if let Some(event) = describe(&message) {
                        info!("Received {}: {:?}", event.name(), event);
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    warn!("Relay closed the connection");
                    return Ok(());
                }
            },
        }
    }

    ws_sender.send(encode(args.codec, &ClientEvent::Shot)?).await?;
    info!("Sent shot");

    // Give the relay a moment to deliver anything still in flight
    sleep(Duration::from_millis(200)).await;
    ws_sender.send(Message::Close(None)).await?;
    info!("Test client finished");

    Ok(())
}
