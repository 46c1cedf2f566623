use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::cryptography::{derive_transit_key, TransitKeys};
use crate::error::{Error, Result};
use crate::handshake;
use crate::messages::{
    decode_msg, encode_msg, Ability, ConnectionHint, Hint, TransitMsg, TransitPayload,
};
use crate::networking::{
    allocate_tcp_port, bind_listener, local_direct_hints, try_connect, Endpoint, EndpointKind,
};
use crate::wormhole::EncryptedConnection;
use crate::CONNECT_TIMEOUT_SECS;

/// Each step down in direct-hint priority starts this much later, so the
/// highest-priority reachable hint finishes its handshake first instead of
/// leaving the election to scheduling order.
const DIRECT_DIAL_STAGGER: Duration = Duration::from_millis(100);

/// Relay dials start slightly behind direct ones, giving a reachable direct
/// path first claim on the election.
const RELAY_DIAL_DELAY: Duration = Duration::from_millis(150);

/// After the election, candidates that already hold a connection get this
/// long to finish their handshake and read their `nevermind`; whatever is
/// still running afterwards is torn down.
const RACE_TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Which end of the transfer this peer is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Connection negotiation knobs.
pub struct TransitOptions {
    /// Bind an inbound listener and advertise local interface addresses.
    pub listen: bool,
    /// Also advertise the loopback address, for same-host transfers.
    pub advertise_loopback: bool,
    /// Relay server to advertise and dial.
    pub relay: Option<Hint>,
    /// Additional hints to advertise, e.g. a NAT port-forward.
    pub extra_hints: Vec<ConnectionHint>,
}

impl Default for TransitOptions {
    fn default() -> Self {
        TransitOptions {
            listen: true,
            advertise_loopback: false,
            relay: None,
            extra_hints: Vec::new(),
        }
    }
}

/// The outcome of a successful negotiation: the one elected endpoint plus
/// the key schedule for the record pipeline.
pub struct Transit {
    pub endpoint: Endpoint,
    pub keys: TransitKeys,
}

/// Random per-transfer identifier for relay pairing, 8 bytes as 16 hex
/// chars.
pub fn new_side() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Negotiate a transit connection with the peer.
///
/// Exchanges `transit` messages over the wormhole channel, then races one
/// candidate connection per usable hint (plus any inbound connections on
/// our own listener) until one of them survives the full handshake. The
/// sender arbitrates the race by sending `go` on exactly one candidate and
/// `nevermind` on every other.
pub async fn establish<C: EncryptedConnection>(
    conn: &mut C,
    appid: &str,
    role: Role,
    options: &TransitOptions,
) -> Result<Transit> {
    let transit_key = derive_transit_key(&conn.shared_key(), appid);
    let keys = TransitKeys::derive(&transit_key);
    let side = new_side();

    let (listener, mut our_hints) = if options.listen {
        let port = allocate_tcp_port()?;
        let listener = bind_listener(port)?;
        let mut hints: Vec<ConnectionHint> = local_direct_hints(port)?
            .into_iter()
            .map(ConnectionHint::direct)
            .collect();
        if options.advertise_loopback {
            hints.push(ConnectionHint::direct(Hint::direct("127.0.0.1", port)));
        }
        (Some(listener), hints)
    } else {
        (None, Vec::new())
    };
    if let Some(relay) = &options.relay {
        our_hints.push(ConnectionHint::relay(vec![relay.clone()]));
    }
    our_hints.extend(options.extra_hints.iter().cloned());

    let ours = TransitPayload::new(
        vec![Ability::DirectTcpV1, Ability::RelayV1],
        our_hints,
    )
    .normalized();

    conn.send_plain(&encode_msg(&TransitMsg::Transit(ours))?).await?;
    let peer = match decode_msg(&conn.receive_plain().await?)? {
        TransitMsg::Transit(payload) => payload.normalized(),
        TransitMsg::Error(text) => {
            return Err(Error::UnexpectedMessage(format!("peer error: {}", text)))
        }
        TransitMsg::Answer(_) => {
            return Err(Error::UnexpectedMessage(
                "answer in place of transit".into(),
            ))
        }
    };
    debug!(
        "peer advertises {} abilities, {} hints",
        peer.abilities.len(),
        peer.hints.len()
    );

    let endpoint = race(listener, &peer, options.relay.clone(), &keys, &side, role).await?;
    info!("elected {:?} endpoint", endpoint.kind);
    Ok(Transit { endpoint, keys })
}

/// Run the full per-candidate handshake sequence on a fresh connection.
async fn candidate(
    mut endpoint: Endpoint,
    keys: &TransitKeys,
    side: &str,
    role: Role,
) -> Result<Endpoint> {
    if endpoint.kind == EndpointKind::Relay {
        handshake::relay_connect(&mut endpoint.stream, &keys.relay_handshake, side).await?;
    }
    match role {
        Role::Sender => {
            handshake::exchange(
                &mut endpoint.stream,
                &handshake::sender_handshake(&keys.sender_handshake),
                &handshake::receiver_handshake(&keys.receiver_handshake),
            )
            .await?;
        }
        Role::Receiver => {
            handshake::exchange(
                &mut endpoint.stream,
                &handshake::receiver_handshake(&keys.receiver_handshake),
                &handshake::sender_handshake(&keys.sender_handshake),
            )
            .await?;
            // the record stream must not start before the sender's verdict
            handshake::expect_go(&mut endpoint.stream).await?;
        }
    }
    Ok(endpoint)
}

/// Expand the peer's hints (plus our own configured relay) into the dial
/// list: direct hints by descending priority with one stagger step per
/// priority rank, relay entry points after, deduplicated by address.
fn dial_candidates(
    peer: &TransitPayload,
    own_relay: Option<Hint>,
) -> Vec<(EndpointKind, Hint, Duration)> {
    let mut directs: Vec<Hint> = Vec::new();
    let mut relays: Vec<Hint> = Vec::new();

    for hint in &peer.hints {
        match hint {
            ConnectionHint::Direct(h) if h.ability == Ability::DirectTcpV1 => {
                directs.push(h.clone())
            }
            ConnectionHint::Direct(_) => {}
            ConnectionHint::Relay { hints, .. } => relays.extend(hints.iter().cloned()),
        }
    }
    // we dial our own configured relay too: the relay can only pair the
    // transfer once both sides show up there
    if let Some(relay) = own_relay {
        relays.push(relay);
    }

    directs.sort_by(|a, b| b.priority.total_cmp(&a.priority));

    let mut candidates: Vec<(EndpointKind, Hint, Duration)> = Vec::new();
    let mut rank: u32 = 0;
    let mut last_priority: Option<f64> = None;
    for hint in directs {
        if let Some(previous) = last_priority {
            if hint.priority < previous {
                rank += 1;
            }
        }
        last_priority = Some(hint.priority);
        push_unique(
            &mut candidates,
            EndpointKind::Direct,
            hint,
            DIRECT_DIAL_STAGGER * rank,
        );
    }
    for hint in relays {
        push_unique(&mut candidates, EndpointKind::Relay, hint, RELAY_DIAL_DELAY);
    }
    candidates
}

fn push_unique(
    candidates: &mut Vec<(EndpointKind, Hint, Duration)>,
    kind: EndpointKind,
    hint: Hint,
    delay: Duration,
) {
    let duplicate = candidates
        .iter()
        .any(|(k, h, _)| *k == kind && h.hostname == hint.hostname && h.port == hint.port);
    if !duplicate {
        candidates.push((kind, hint, delay));
    }
}

/// Resolve a finished candidate against the election.
///
/// The first candidate through the full handshake claims the election: as
/// sender it seals the claim by putting `go` on the wire before handing the
/// endpoint to the orchestrator. Every later candidate is told `nevermind`
/// and dropped.
async fn arbitrate(
    mut endpoint: Endpoint,
    role: Role,
    claimed: &AtomicBool,
    winner_tx: &mpsc::Sender<Result<Endpoint>>,
) {
    let first = !claimed.swap(true, Ordering::SeqCst);
    if first {
        let result = match role {
            Role::Sender => handshake::send_go(&mut endpoint.stream)
                .await
                .map(|()| endpoint),
            Role::Receiver => Ok(endpoint),
        };
        let _ = winner_tx.send(result).await;
    } else {
        if role == Role::Sender {
            let _ = handshake::send_nevermind(&mut endpoint.stream).await;
        }
        debug!("closed losing {:?} candidate", endpoint.kind);
    }
}

/// Accept inbound connections and run each through the candidate handshake.
async fn accept_candidates(
    listener: TcpListener,
    keys: TransitKeys,
    side: String,
    role: Role,
    claimed: Arc<AtomicBool>,
    winner_tx: mpsc::Sender<Result<Endpoint>>,
) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!("inbound candidate from {}", addr);
                        let keys = keys.clone();
                        let side = side.clone();
                        let claimed = claimed.clone();
                        let winner_tx = winner_tx.clone();
                        handshakes.spawn(async move {
                            let endpoint = Endpoint { kind: EndpointKind::Direct, stream };
                            match candidate(endpoint, &keys, &side, role).await {
                                Ok(endpoint) => arbitrate(endpoint, role, &claimed, &winner_tx).await,
                                Err(e) => debug!("inbound candidate {} dropped: {}", addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        debug!("accept failed: {}", e);
                        return;
                    }
                }
            }
            _ = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
}

async fn race(
    listener: Option<TcpListener>,
    peer: &TransitPayload,
    own_relay: Option<Hint>,
    keys: &TransitKeys,
    side: &str,
    role: Role,
) -> Result<Endpoint> {
    let claimed = Arc::new(AtomicBool::new(false));
    let (winner_tx, mut winner_rx) = mpsc::channel::<Result<Endpoint>>(1);

    let accept_task = listener.map(|listener| {
        tokio::spawn(accept_candidates(
            listener,
            keys.clone(),
            side.to_string(),
            role,
            claimed.clone(),
            winner_tx.clone(),
        ))
    });

    let mut dials = JoinSet::new();
    for (kind, hint, delay) in dial_candidates(peer, own_relay) {
        let keys = keys.clone();
        let side = side.to_string();
        let claimed = claimed.clone();
        let winner_tx = winner_tx.clone();
        dials.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let attempt = async {
                let endpoint = try_connect(&hint, kind).await?;
                candidate(endpoint, &keys, &side, role).await
            };
            match attempt.await {
                Ok(endpoint) => arbitrate(endpoint, role, &claimed, &winner_tx).await,
                Err(e) => debug!(
                    "candidate {}:{} ({:?}) dropped: {}",
                    hint.hostname, hint.port, kind, e
                ),
            }
        });
    }
    drop(winner_tx);

    // first candidate through the full handshake wins
    let elected = loop {
        if dials.is_empty() {
            if accept_task.is_some() {
                // every dial failed, but the peer may still reach our
                // listener; wait one more connect window before giving up
                break match timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), winner_rx.recv())
                    .await
                {
                    Ok(Some(result)) => result,
                    _ => Err(Error::NoUsableHint),
                };
            }
            break match winner_rx.recv().await {
                Some(result) => result,
                None => Err(Error::NoUsableHint),
            };
        }
        tokio::select! {
            maybe = winner_rx.recv() => break maybe.unwrap_or(Err(Error::NoUsableHint)),
            _ = dials.join_next() => {}
        }
    };

    // losing candidates that already hold a connection finish their
    // handshake and read their nevermind inside the grace window; anything
    // still running after that is torn down
    tokio::spawn(async move {
        tokio::time::sleep(RACE_TEARDOWN_GRACE).await;
        dials.shutdown().await;
        if let Some(task) = accept_task {
            task.abort();
        }
    });

    elected
}
