//! Simulated mesh call.
//!
//! Runs every participant in-process over the loopback media engine, with
//! negotiation going through the memory relay or a real PeerJS server. Drives
//! a shared roster through join / leave phases and logs the resulting mesh
//! after each phase.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use meshcall_core::engine::LoopbackNetwork;
use meshcall_core::ids::wire_id;
use meshcall_core::media::SyntheticDevices;
use meshcall_core::signaling::{MemoryRelay, PeerJsRendezvous};
use meshcall_core::{
    CallRoom, ConfigStore, MeshConfig, MeshDeps, MeshError, MeshEvent, MeshEventListener,
    Participant, PeerId, Rendezvous, Role, RoomId, RoomStatusSink, Roster, SessionContext,
};
use tokio::sync::watch;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Signaling {
    /// In-process relay
    Memory,
    /// PeerJS server(s) listed in the mesh configuration
    Peerjs,
}

#[derive(Parser, Debug)]
#[command(name = "meshcall-sim", about = "Run a simulated full-mesh call")]
struct Args {
    /// Number of participants
    #[arg(short = 'n', long, default_value_t = 4)]
    participants: usize,

    /// Room identifier
    #[arg(long, default_value = "demo")]
    room: String,

    /// JSON mesh configuration (defaults when missing or invalid)
    #[arg(long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding settings.json with media preferences
    #[arg(long, env = "MESHCALL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Where negotiation messages travel
    #[arg(long, value_enum, default_value_t = Signaling::Memory)]
    signaling: Signaling,

    /// Participant whose connectivity never completes
    #[arg(long)]
    unreachable: Option<String>,

    /// Simulated media setup latency in milliseconds
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// How long to let the mesh settle after each roster change
    #[arg(long, default_value_t = 1_000)]
    settle_ms: u64,
}

struct LogListener {
    peer: PeerId,
}

impl MeshEventListener for LogListener {
    fn on_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::PeerJoined(peer) => tracing::info!("[{}] media from {peer}", self.peer),
            MeshEvent::PeerLeft(peer) => tracing::info!("[{}] {peer} left", self.peer),
            MeshEvent::NegotiationFailed { peer_id, reason } => {
                tracing::warn!("[{}] negotiation with {peer_id} failed: {reason}", self.peer)
            }
            other => tracing::debug!("[{}] {other:?}", self.peer),
        }
    }
}

struct LoggedStatus;

#[async_trait]
impl RoomStatusSink for LoggedStatus {
    async fn set_room_active(&self, room_id: &RoomId, active: bool) -> Result<(), MeshError> {
        tracing::info!("directory: room {room_id} active={active}");
        Ok(())
    }
}

fn participant_name(index: usize) -> String {
    format!("p{}", index + 1)
}

fn roster_of(names: &[String]) -> Roster {
    Roster::new(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Participant {
                peer_id: PeerId::new(name.as_str()),
                display_name: name.to_uppercase(),
                role: if i == 0 { Role::Host } else { Role::Participant },
            })
            .collect(),
    )
}

async fn report(rooms: &[(String, CallRoom)]) {
    for (name, room) in rooms {
        if !room.is_joined().await {
            continue;
        }
        let peers = room.peers().await;
        let summary: Vec<String> = peers
            .iter()
            .map(|p| format!("{}:{}", p.peer_id, p.state))
            .collect();
        tracing::info!(
            "{name}: {} streams, peers [{}]",
            room.remote_streams().await.len(),
            summary.join(", ")
        );
    }
}

async fn run(args: Args) -> Result<(), MeshError> {
    if args.participants < 2 {
        return Err(MeshError::Config("need at least two participants".into()));
    }
    let config = match &args.config {
        Some(path) => MeshConfig::load(path),
        None => MeshConfig::default(),
    };
    config.validate()?;
    let preferences = args.data_dir.as_deref().map(|dir| ConfigStore::new(dir).get());

    let room_id = RoomId::new(args.room.as_str());
    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();
    network.set_latency(Duration::from_millis(args.latency_ms));
    if let Some(peer) = &args.unreachable {
        network.set_unreachable(&wire_id(&PeerId::new(peer.as_str()), &room_id), true);
    }

    let names: Vec<String> = (0..args.participants).map(participant_name).collect();
    let (roster_tx, roster_rx) = watch::channel(Roster::default());
    let settle = Duration::from_millis(args.settle_ms);

    let mut rooms = Vec::new();
    for name in &names {
        let room = CallRoom::new(config.clone());
        room.add_listener(Arc::new(LogListener {
            peer: PeerId::new(name.as_str()),
        }));
        if let Some(preferences) = &preferences {
            room.set_preferences(preferences.clone()).await;
        }
        let rendezvous: Arc<dyn Rendezvous> = match args.signaling {
            Signaling::Memory => Arc::new(relay.client()),
            Signaling::Peerjs => Arc::new(PeerJsRendezvous::from_config(&config)?),
        };
        let deps = MeshDeps {
            rendezvous,
            engine: Arc::new(network.engine()),
        };
        let ctx = SessionContext::new(room_id.clone(), PeerId::new(name.as_str()))
            .with_display_name(name.to_uppercase());
        room.join(ctx, &SyntheticDevices::new(), deps).await?;
        room.follow_roster(roster_rx.clone()).await?;
        rooms.push((name.clone(), room));
    }

    tracing::info!("phase 1: {} participants join", names.len());
    let _ = roster_tx.send(roster_of(&names));
    tokio::time::sleep(settle).await;
    report(&rooms).await;

    let remaining = &names[..names.len() - 1];
    let departing = &names[names.len() - 1];
    tracing::info!("phase 2: {departing} leaves");
    let _ = roster_tx.send(roster_of(remaining));
    if let Some((_, room)) = rooms.iter().find(|(name, _)| name == departing) {
        room.leave().await?;
    }
    tokio::time::sleep(settle).await;
    report(&rooms).await;

    tracing::info!("phase 3: host ends the room");
    if let Some((_, host)) = rooms.first() {
        host.end_room(&LoggedStatus).await?;
    }
    for (_, room) in &rooms {
        room.leave().await?;
    }
    if args.signaling == Signaling::Memory {
        tracing::info!("relay carried {} messages", relay.relayed().len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("meshcall_core=info,meshcall_sim=info")
            }),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("simulation failed: {e}");
            ExitCode::FAILURE
        }
    }
}
