// rust/cir-core/src/group/client.rs

//! Group client for workers running as separate processes.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use super::protocol::{read_message, write_message, GroupMessage};
use super::{BarrierWait, Membership, ProcessGroup};
use crate::config::GroupConfig;
use crate::error::{Result, RuntimeError};

/// Upper bound for the delay between connection attempts.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Blocking TCP connection to a [`GroupServer`](super::GroupServer).
pub struct TcpGroup {
    config: GroupConfig,
    wait: BarrierWait,
    stream: Option<TcpStream>,
    membership: Option<Membership>,
    session_token: Option<String>,
    epoch: u64,
}

impl TcpGroup {
    pub fn new(config: GroupConfig) -> Self {
        let wait = config.barrier_wait();
        Self {
            config,
            wait,
            stream: None,
            membership: None,
            session_token: None,
            epoch: 0,
        }
    }

    /// Session token issued by the server on join.
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    fn resolve_address(&self) -> Result<SocketAddr> {
        self.config
            .address
            .to_socket_addrs()
            .map_err(|e| {
                RuntimeError::group_with_source(
                    format!("invalid group address '{}'", self.config.address),
                    e,
                )
            })?
            .next()
            .ok_or_else(|| {
                RuntimeError::group(format!(
                    "group address '{}' did not resolve",
                    self.config.address
                ))
            })
    }

    fn connect(&self, addr: &SocketAddr) -> Result<TcpStream> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = TcpStream::connect_timeout(addr, timeout).map_err(|e| {
            RuntimeError::group_with_source(format!("failed to connect to group at {addr}"), e)
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| RuntimeError::group_with_source("failed to configure socket", e))?;
        Ok(stream)
    }

    /// Connect with retry logic.
    fn connect_with_retry(&self) -> Result<TcpStream> {
        let addr = self.resolve_address()?;
        let mut attempts = 0;
        let mut delay = Duration::from_millis(50);

        loop {
            match self.connect(&addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.connect_attempts {
                        return Err(RuntimeError::group(format!(
                            "failed to connect after {} attempts: {}",
                            attempts, e
                        )));
                    }

                    tracing::debug!("Group server not reachable yet ({}), retrying", e);
                    std::thread::sleep(delay);
                    delay = std::cmp::min(delay * 2, MAX_RECONNECT_DELAY);
                }
            }
        }
    }

    fn joined(&mut self) -> Result<(Membership, &mut TcpStream)> {
        let membership = self
            .membership
            .ok_or_else(|| RuntimeError::group("group not initialized"))?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RuntimeError::group("group connection already closed"))?;
        Ok((membership, stream))
    }
}

impl ProcessGroup for TcpGroup {
    fn initialize(&mut self) -> Result<Membership> {
        if self.membership.is_some() {
            return Err(RuntimeError::group("group already initialized"));
        }

        let mut stream = self.connect_with_retry()?;
        write_message(
            &mut stream,
            &GroupMessage::Join {
                hint: self.config.rank_hint,
            },
        )?;

        let reply = read_message(&mut stream)
            .map_err(|e| RuntimeError::group_with_source("no reply to join request", e))?;

        match reply {
            GroupMessage::Welcome {
                rank,
                size,
                session_token,
            } => {
                if size != self.config.size {
                    tracing::warn!(
                        "Group server reports {} members, configuration says {}",
                        size,
                        self.config.size
                    );
                }
                tracing::info!("Joined group as rank {} of {}", rank, size);

                let membership = Membership { rank, size };
                self.membership = Some(membership);
                self.session_token = Some(session_token);
                self.stream = Some(stream);
                Ok(membership)
            }
            GroupMessage::Rejected { reason } => Err(RuntimeError::group(format!(
                "group server rejected join: {reason}"
            ))),
            other => Err(RuntimeError::group(format!(
                "unexpected reply to join request: {other:?}"
            ))),
        }
    }

    fn membership(&self) -> Option<Membership> {
        self.membership
    }

    fn barrier(&mut self) -> Result<()> {
        let epoch = self.epoch + 1;
        let timeout = self.wait.timeout();
        let (membership, stream) = self.joined()?;

        write_message(stream, &GroupMessage::Barrier { epoch })?;

        stream
            .set_read_timeout(timeout)
            .map_err(|e| RuntimeError::group_with_source("failed to set barrier timeout", e))?;

        let started = Instant::now();
        let reply = read_message(stream).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                RuntimeError::barrier_timeout(membership.rank, started.elapsed())
            }
            io::ErrorKind::UnexpectedEof => {
                RuntimeError::group_with_source("group server closed the connection", e)
            }
            _ => RuntimeError::group_with_source("failed to wait at barrier", e),
        })?;

        match reply {
            GroupMessage::Release { epoch: released } if released == epoch => {
                self.epoch = epoch;
                Ok(())
            }
            other => Err(RuntimeError::group(format!(
                "expected release of barrier {epoch}, got {other:?}"
            ))),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        let (membership, stream) = self.joined()?;
        write_message(stream, &GroupMessage::Leave)?;
        // Already-closed sockets are fine here.
        let _ = stream.shutdown(Shutdown::Both);

        self.stream = None;
        tracing::debug!("Rank {} left the group", membership.rank);
        Ok(())
    }
}
