use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;

use zvnet::auth::{Ed25519Signer, Ed25519Verifier};
use zvnet::protocol::probe::{ProbeReply, ProbeRequest};
use zvnet::protocol::protocol_type::ProtocolType;
use zvnet::protocol::NetPacket;
use zvnet::{Builder, ChannelCallback, Event, SessionId};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Node id of this process.
    #[arg(short, long, default_value_t = 1)]
    id: u64,
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:23333")]
    listen: SocketAddr,
    /// Proxy used for the NAT check and relaying.
    /// example: --proxy 192.168.10.2:3478
    #[arg(long)]
    proxy: Option<SocketAddr>,
    /// Peer to connect to, as id@address.
    /// example: --peer 2@192.168.10.13:23333
    #[arg(short, long)]
    peer: Option<String>,
    /// Run as the proxy instead, answering probes on `listen` and its port + 1.
    #[arg(long)]
    rendezvous: bool,
}

#[tokio::main]
pub async fn main() -> zvnet::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    if args.rendezvous {
        return rendezvous(args.listen).await;
    }
    let peer = match args.peer.as_deref() {
        Some(peer) => Some(parse_peer(peer).expect("--peer id@address")),
        None => None,
    };

    let (callback, events) = ChannelCallback::channel();
    let engine = Arc::new(
        Builder::new()
            .node_id(args.id)
            .signer(Ed25519Signer::generate())
            .verifier(Ed25519Verifier)
            .callback(callback)
            .build()?,
    );
    engine.on_send_waited(|session, peer_id| {
        log::info!("session {session} to {peer_id} can send again");
    });
    engine.proxy(args.proxy);
    let local = engine.listen(args.listen).await?;
    log::info!("node {} listening on {local}", args.id);
    if let Some((peer_id, addr)) = peer {
        engine.connect(peer_id, addr)?;
    }

    let sessions = Arc::new(parking_lot::Mutex::new(Vec::<SessionId>::new()));
    let sessions_ = sessions.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                Event::Recved { peer_id, data, .. } => {
                    println!("{peer_id}> {}", String::from_utf8_lossy(&data));
                }
                Event::Connected {
                    session,
                    peer_id,
                    nat_type,
                } => {
                    log::info!("session {session} with {peer_id} up, local nat {nat_type}");
                    sessions_.lock().push(session);
                }
                Event::Accepted {
                    session,
                    peer_id,
                    addr,
                    ..
                } => {
                    log::info!("session {session} with {peer_id} at {addr} up");
                    sessions_.lock().push(session);
                }
                Event::Disconnected {
                    peer_id,
                    session,
                    reason,
                } => {
                    log::info!("peer {peer_id} gone: {reason}");
                    if let Some(session) = session {
                        sessions_.lock().retain(|v| *v != session);
                    }
                }
                event => log::info!("{event:?}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let current = sessions.lock().clone();
        for session in current {
            if let Err(e) = engine.send(session, line.as_bytes()) {
                log::warn!("send on {session} {e}");
            }
        }
    }
    engine.close();
    Ok(())
}

fn parse_peer(s: &str) -> Option<(u64, SocketAddr)> {
    let (id, addr) = s.split_once('@')?;
    Some((id.parse().ok()?, addr.parse().ok()?))
}

/// Minimal proxy: reports observed addresses and forwards relay datagrams to
/// the last address each node id was seen at.
async fn rendezvous(addr: SocketAddr) -> zvnet::Result<()> {
    let primary = Arc::new(UdpSocket::bind(addr).await?);
    let alt_addr = SocketAddr::new(addr.ip(), addr.port().wrapping_add(1));
    let alt = Arc::new(UdpSocket::bind(alt_addr).await?);
    log::info!("rendezvous on {} and {}", primary.local_addr()?, alt.local_addr()?);
    let alt_port = alt.local_addr()?.port();
    let nodes = Arc::new(parking_lot::Mutex::new(HashMap::<u64, SocketAddr>::new()));
    let alt_task = tokio::spawn(serve(alt, primary.clone(), 0, nodes.clone()));
    serve(primary.clone(), primary, alt_port, nodes).await;
    alt_task.abort();
    Ok(())
}

async fn serve(
    socket: Arc<UdpSocket>,
    relay: Arc<UdpSocket>,
    alt_port: u16,
    nodes: Arc<parking_lot::Mutex<HashMap<u64, SocketAddr>>>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(rs) => rs,
            Err(e) => {
                log::debug!("recv_from {e:?}");
                continue;
            }
        };
        let Ok(packet) = NetPacket::new(&buf[..len]) else {
            continue;
        };
        nodes.lock().insert(packet.src_id(), from);
        match packet.protocol() {
            ProtocolType::ProbeRequest => {
                let Ok(request) = ProbeRequest::decode(packet.payload()) else {
                    continue;
                };
                let reply = ProbeReply {
                    nonce: request.nonce,
                    mapped: from,
                    alt_ip: None,
                    alt_port,
                };
                let mut body = Vec::new();
                reply.encode(&mut body);
                let reply = NetPacket::build(ProtocolType::ProbeReply, 0, packet.src_id(), &body);
                if let Err(e) = socket.send_to(reply.buffer(), from).await {
                    log::debug!("probe reply to {from} {e:?}");
                }
            }
            ProtocolType::Relay => {
                let target = nodes.lock().get(&packet.dst_id()).copied();
                match target {
                    Some(target) => {
                        if let Err(e) = relay.send_to(packet.buffer(), target).await {
                            log::debug!("relay to {target} {e:?}");
                        }
                    }
                    None => log::debug!("relay for unknown node {}", packet.dst_id()),
                }
            }
            protocol => log::debug!("ignore {protocol:?} from {from}"),
        }
    }
}
