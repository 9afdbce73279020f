// rust/cir-core/src/group/server.rs

//! Rendezvous and barrier server for multi-process groups.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use super::protocol::{read_message_async, write_message_async, GroupMessage};
use crate::error::{Result, RuntimeError};

/// Member state tracked by the server.
#[derive(Debug, Clone)]
struct MemberState {
    session_token: String,
    peer: SocketAddr,
    connected: bool,
}

#[derive(Debug, Default)]
struct Inner {
    /// Joined members by rank.
    members: BTreeMap<u32, MemberState>,
    /// Ranks that reached each barrier epoch not yet released.
    arrivals: HashMap<u64, BTreeSet<u32>>,
}

/// Shared server state.
struct GroupState {
    size: u32,
    inner: Mutex<Inner>,
    /// Highest barrier epoch released so far.
    released: watch::Sender<u64>,
}

impl GroupState {
    fn new(size: u32) -> Self {
        let (released, _) = watch::channel(0);
        Self {
            size,
            inner: Mutex::new(Inner::default()),
            released,
        }
    }

    /// Assigns a rank: the hint if it is in range and free, otherwise the
    /// lowest free rank.
    async fn join(
        &self,
        hint: Option<u32>,
        peer: SocketAddr,
    ) -> std::result::Result<(u32, String), String> {
        let mut inner = self.inner.lock().await;

        if inner.members.len() as u32 >= self.size {
            return Err(format!("group of {} is already full", self.size));
        }

        let rank = match hint {
            Some(hint) if hint < self.size && !inner.members.contains_key(&hint) => hint,
            _ => {
                if let Some(hint) = hint {
                    tracing::warn!(
                        "Rank hint {} from {} unavailable, assigning lowest free rank",
                        hint,
                        peer
                    );
                }
                (0..self.size)
                    .find(|rank| !inner.members.contains_key(rank))
                    .ok_or_else(|| format!("group of {} is already full", self.size))?
            }
        };

        let session_token = Uuid::new_v4().to_string();
        inner.members.insert(
            rank,
            MemberState {
                session_token: session_token.clone(),
                peer,
                connected: true,
            },
        );

        tracing::info!(
            "Rank {} joined from {} ({}/{})",
            rank,
            peer,
            inner.members.len(),
            self.size
        );
        Ok((rank, session_token))
    }

    /// Records `rank` at barrier `epoch` and waits for the epoch's release.
    async fn arrive(&self, rank: u32, epoch: u64) -> Result<()> {
        let mut released = self.released.subscribe();

        {
            let mut inner = self.inner.lock().await;
            let arrived = inner.arrivals.entry(epoch).or_default();
            arrived.insert(rank);

            if arrived.len() as u32 == self.size {
                inner.arrivals.remove(&epoch);
                self.released.send_modify(|current| *current = (*current).max(epoch));
                tracing::debug!("Barrier {} released", epoch);
            }
        }

        released
            .wait_for(|current| *current >= epoch)
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::group_with_source("barrier release channel closed", e))
    }

    async fn disconnect(&self, rank: u32) {
        let mut inner = self.inner.lock().await;
        if let Some(member) = inner.members.get_mut(&rank) {
            member.connected = false;
            tracing::debug!(
                "Rank {} (peer {}, session {}) disconnected",
                rank,
                member.peer,
                member.session_token
            );
        }
    }

    async fn connected_count(&self) -> u32 {
        let inner = self.inner.lock().await;
        inner.members.values().filter(|m| m.connected).count() as u32
    }
}

/// Accepts a fixed number of members and coordinates their barriers.
///
/// Ranks are never reused: a member that disconnects keeps its rank, and a
/// barrier it never reached is never released. Peers waiting on it block
/// until their own barrier wait policy gives up.
pub struct GroupServer {
    listener: TcpListener,
    state: Arc<GroupState>,
}

impl GroupServer {
    /// Binds a server for a group of `size` members.
    pub async fn bind(addr: &str, size: u32) -> Result<Self> {
        if size == 0 {
            return Err(RuntimeError::config("group size must be greater than 0"));
        }

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            RuntimeError::group_with_source(format!("failed to bind group server to {addr}"), e)
        })?;

        Ok(Self {
            listener,
            state: Arc::new(GroupState::new(size)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RuntimeError::group_with_source("failed to read local address", e))
    }

    pub fn size(&self) -> u32 {
        self.state.size
    }

    /// Accepts members until the task is dropped or aborted.
    pub async fn serve(self) -> Result<()> {
        tracing::info!(
            "Group server listening on {} for {} members",
            self.local_addr()?,
            self.state.size
        );

        loop {
            let (stream, peer) = self.listener.accept().await.map_err(|e| {
                RuntimeError::group_with_source("failed to accept group member", e)
            })?;

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_member(state, stream, peer).await {
                    tracing::warn!("Group member {} failed: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_member(
    state: Arc<GroupState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let hint = match read_message_async(&mut reader).await? {
        Some(GroupMessage::Join { hint }) => hint,
        Some(other) => {
            return Err(RuntimeError::group(format!(
                "expected join from {peer}, got {other:?}"
            )))
        }
        None => return Ok(()),
    };

    let rank = match state.join(hint, peer).await {
        Ok((rank, session_token)) => {
            write_message_async(
                &mut writer,
                &GroupMessage::Welcome {
                    rank,
                    size: state.size,
                    session_token,
                },
            )
            .await?;
            rank
        }
        Err(reason) => {
            tracing::warn!("Rejected join from {}: {}", peer, reason);
            return write_message_async(&mut writer, &GroupMessage::Rejected { reason }).await;
        }
    };

    let result = serve_member(&state, rank, &mut reader, &mut writer).await;
    state.disconnect(rank).await;
    tracing::debug!("{} members still connected", state.connected_count().await);
    result
}

async fn serve_member<R, W>(
    state: &GroupState,
    rank: u32,
    reader: &mut R,
    writer: &mut W,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut expected_epoch = 1;

    loop {
        match read_message_async(reader).await? {
            Some(GroupMessage::Barrier { epoch }) => {
                if epoch != expected_epoch {
                    return Err(RuntimeError::group(format!(
                        "rank {rank} sent barrier {epoch}, expected {expected_epoch}"
                    )));
                }
                state.arrive(rank, epoch).await?;
                write_message_async(writer, &GroupMessage::Release { epoch }).await?;
                expected_epoch += 1;
            }
            Some(GroupMessage::Leave) => {
                tracing::info!("Rank {} left the group", rank);
                return Ok(());
            }
            Some(other) => {
                return Err(RuntimeError::group(format!(
                    "unexpected message from rank {rank}: {other:?}"
                )))
            }
            None => {
                tracing::warn!("Rank {} disconnected without leaving", rank);
                return Ok(());
            }
        }
    }
}
