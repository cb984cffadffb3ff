//! RESP2 store clients.
//!
//! [`StoreClient`] is a point-to-point connection to one endpoint with
//! sequential request/response calls, every leg bounded by the configured
//! operation timeout. [`ClusterClient`] layers a minimal sharded-deployment
//! client on top: it follows one `MOVED` redirect per operation and caches
//! connections per node, which also tells the caller exactly which node
//! served each acknowledged write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;

use crate::error::ProbeError;
use crate::resolver::AddressResolver;
use crate::types::{NodeAddress, SlotOwner, SlotRange};

/// Point-to-point connection to one store endpoint.
pub struct StoreClient {
    addr: NodeAddress,
    conn: Framed<TcpStream, Resp2>,
    op_timeout: Duration,
}

impl StoreClient {
    /// Connect with the operation timeout also applied to the TCP dial.
    pub async fn connect(addr: NodeAddress, op_timeout: Duration) -> Result<Self, ProbeError> {
        let dial = TcpStream::connect((addr.host.as_str(), addr.port));
        let socket = match time::timeout(op_timeout, dial).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                return Err(ProbeError::Connection {
                    addr,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(ProbeError::Timeout {
                    addr,
                    timeout: op_timeout,
                })
            }
        };
        socket.set_nodelay(true).ok();
        Ok(Self {
            addr,
            conn: Framed::new(socket, Resp2::default()),
            op_timeout,
        })
    }

    pub fn addr(&self) -> &NodeAddress {
        &self.addr
    }

    /// One request/response round-trip. Send and receive are each bounded by
    /// the operation timeout; a timeout is surfaced like any other error.
    pub async fn command(&mut self, parts: &[&[u8]]) -> Result<BytesFrame, ProbeError> {
        let request = BytesFrame::Array(
            parts
                .iter()
                .map(|part| BytesFrame::BulkString(Bytes::copy_from_slice(part)))
                .collect(),
        );

        match time::timeout(self.op_timeout, self.conn.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(ProbeError::Connection {
                    addr: self.addr.clone(),
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(ProbeError::Timeout {
                    addr: self.addr.clone(),
                    timeout: self.op_timeout,
                })
            }
        }

        match time::timeout(self.op_timeout, self.conn.next()).await {
            Ok(Some(Ok(frame))) => Ok(frame),
            Ok(Some(Err(err))) => Err(ProbeError::Connection {
                addr: self.addr.clone(),
                reason: err.to_string(),
            }),
            Ok(None) => Err(ProbeError::Connection {
                addr: self.addr.clone(),
                reason: "connection closed".to_string(),
            }),
            Err(_) => Err(ProbeError::Timeout {
                addr: self.addr.clone(),
                timeout: self.op_timeout,
            }),
        }
    }

    pub async fn ping(&mut self) -> Result<(), ProbeError> {
        match self.command(&[b"PING"]).await? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"PONG" => Ok(()),
            other => Err(self.unexpected("PING", &other)),
        }
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Result<(), ProbeError> {
        match self
            .command(&[b"SET", key.as_bytes(), value.as_bytes()])
            .await?
        {
            BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
            BytesFrame::Error(err) => Err(ProbeError::Protocol {
                addr: self.addr.clone(),
                detail: err.to_string(),
            }),
            other => Err(self.unexpected("SET", &other)),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<String>, ProbeError> {
        match self.command(&[b"GET", key.as_bytes()]).await? {
            BytesFrame::Null => Ok(None),
            BytesFrame::BulkString(bytes) | BytesFrame::SimpleString(bytes) => {
                Ok(Some(String::from_utf8_lossy(&bytes).to_string()))
            }
            BytesFrame::Error(err) => Err(ProbeError::Protocol {
                addr: self.addr.clone(),
                detail: err.to_string(),
            }),
            other => Err(self.unexpected("GET", &other)),
        }
    }

    /// Drop every key on the endpoint. Callers use this to reset the probe
    /// key namespace before an exclusive-write run.
    pub async fn flush_all(&mut self) -> Result<(), ProbeError> {
        match self.command(&[b"FLUSHALL"]).await? {
            BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
            BytesFrame::Error(err) => Err(ProbeError::Protocol {
                addr: self.addr.clone(),
                detail: err.to_string(),
            }),
            other => Err(self.unexpected("FLUSHALL", &other)),
        }
    }

    fn unexpected(&self, op: &str, frame: &BytesFrame) -> ProbeError {
        ProbeError::Protocol {
            addr: self.addr.clone(),
            detail: format!("unexpected {op} response: {frame:?}"),
        }
    }
}

/// Minimal client for a sharded deployment.
///
/// Keys are issued against the most recently used node; a `MOVED` reply is
/// followed once, through the address resolver, and the target connection is
/// cached. This deliberately avoids a slot map: the serving node for each
/// operation is observed, not predicted, which is what the ownership
/// cross-check needs.
pub struct ClusterClient {
    seeds: Vec<NodeAddress>,
    resolver: Arc<dyn AddressResolver + Send + Sync>,
    op_timeout: Duration,
    conns: HashMap<NodeAddress, StoreClient>,
    current: Option<NodeAddress>,
}

impl ClusterClient {
    pub fn new(
        seeds: Vec<NodeAddress>,
        resolver: Arc<dyn AddressResolver + Send + Sync>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            seeds,
            resolver,
            op_timeout,
            conns: HashMap::new(),
            current: None,
        }
    }

    /// Write one key, following at most one `MOVED` redirect. Returns the
    /// node that acknowledged the write.
    pub async fn set(&mut self, key: &str, value: &str) -> Result<NodeAddress, ProbeError> {
        let addr = self.pick_node().await?;
        match self.conn(&addr).await?.set(key, value).await {
            Ok(()) => Ok(addr),
            Err(err) => self.follow_set_redirect(addr, err, key, value).await,
        }
    }

    /// Read one key, following at most one `MOVED` redirect.
    pub async fn get(&mut self, key: &str) -> Result<Option<String>, ProbeError> {
        let addr = self.pick_node().await?;
        match self.conn(&addr).await?.get(key).await {
            Ok(value) => Ok(value),
            Err(ProbeError::Protocol { detail, .. }) if detail.starts_with("MOVED") => {
                let target = self.redirect_target(&detail)?;
                let value = self.conn(&target).await?.get(key).await?;
                self.current = Some(target);
                Ok(value)
            }
            Err(err) => {
                self.discard(&addr, &err);
                Err(err)
            }
        }
    }

    /// Authoritative slot ownership from the deployment's own metadata
    /// (`CLUSTER SLOTS`), mapped through the address resolver.
    pub async fn slot_owners(&mut self) -> Result<Vec<SlotOwner>, ProbeError> {
        let addr = self.pick_node().await?;
        let frame = self.conn(&addr).await?.command(&[b"CLUSTER", b"SLOTS"]).await?;
        let entries = match frame {
            BytesFrame::Array(entries) => entries,
            BytesFrame::Error(err) => {
                return Err(ProbeError::Protocol {
                    addr,
                    detail: err.to_string(),
                })
            }
            other => {
                return Err(ProbeError::Protocol {
                    addr,
                    detail: format!("unexpected CLUSTER SLOTS response: {other:?}"),
                })
            }
        };

        let mut owners = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some((range, reported)) = parse_slot_entry(&entry) else {
                return Err(ProbeError::Protocol {
                    addr,
                    detail: format!("malformed CLUSTER SLOTS entry: {entry:?}"),
                });
            };
            let owner = self.resolver.resolve(&reported)?;
            owners.push(SlotOwner { range, owner });
        }
        owners.sort_by_key(|o| o.range.start);
        Ok(owners)
    }

    async fn follow_set_redirect(
        &mut self,
        from: NodeAddress,
        err: ProbeError,
        key: &str,
        value: &str,
    ) -> Result<NodeAddress, ProbeError> {
        match err {
            ProbeError::Protocol { detail, .. } if detail.starts_with("MOVED") => {
                let target = self.redirect_target(&detail)?;
                self.conn(&target).await?.set(key, value).await?;
                self.current = Some(target.clone());
                Ok(target)
            }
            err => {
                self.discard(&from, &err);
                Err(err)
            }
        }
    }

    fn redirect_target(&self, detail: &str) -> Result<NodeAddress, ProbeError> {
        let (_, reported) = parse_moved(detail).ok_or_else(|| ProbeError::Protocol {
            addr: self
                .current
                .clone()
                .or_else(|| self.seeds.first().cloned())
                .unwrap_or_else(|| NodeAddress::new("unknown", 0)),
            detail: format!("malformed MOVED reply: {detail}"),
        })?;
        self.resolver.resolve(&reported)
    }

    /// The sticky current node, or the first reachable seed.
    async fn pick_node(&mut self) -> Result<NodeAddress, ProbeError> {
        if let Some(addr) = self.current.clone() {
            if self.conns.contains_key(&addr) {
                return Ok(addr);
            }
        }
        for seed in self.seeds.clone() {
            if self.conns.contains_key(&seed) || self.try_connect(&seed).await {
                self.current = Some(seed.clone());
                return Ok(seed);
            }
        }
        Err(ProbeError::Unavailable {
            attempted: self.seeds.len(),
        })
    }

    async fn try_connect(&mut self, addr: &NodeAddress) -> bool {
        match StoreClient::connect(addr.clone(), self.op_timeout).await {
            Ok(client) => {
                self.conns.insert(addr.clone(), client);
                true
            }
            Err(err) => {
                tracing::debug!(node = %addr, error = %err, "seed unreachable");
                false
            }
        }
    }

    async fn conn(&mut self, addr: &NodeAddress) -> Result<&mut StoreClient, ProbeError> {
        if !self.conns.contains_key(addr) {
            let client = StoreClient::connect(addr.clone(), self.op_timeout).await?;
            self.conns.insert(addr.clone(), client);
        }
        Ok(self.conns.get_mut(addr).expect("connection just inserted"))
    }

    /// Drop a connection after a connectivity failure so the next operation
    /// re-dials instead of reusing a dead stream.
    fn discard(&mut self, addr: &NodeAddress, err: &ProbeError) {
        if err.is_connectivity() {
            self.conns.remove(addr);
            if self.current.as_ref() == Some(addr) {
                self.current = None;
            }
        }
    }
}

/// Parses `MOVED <slot> <host>:<port>` into the slot and reported address.
pub(crate) fn parse_moved(detail: &str) -> Option<(u16, NodeAddress)> {
    let mut parts = detail.split_whitespace();
    if parts.next() != Some("MOVED") {
        return None;
    }
    let slot = parts.next()?.parse::<u16>().ok()?;
    let addr = parts.next()?.parse::<NodeAddress>().ok()?;
    Some((slot, addr))
}

/// Parses one `CLUSTER SLOTS` entry: `[start, end, [ip, port, ...], ...]`.
/// Only the owning node (the first address entry) is of interest here.
fn parse_slot_entry(entry: &BytesFrame) -> Option<(SlotRange, NodeAddress)> {
    let BytesFrame::Array(fields) = entry else {
        return None;
    };
    let start = frame_integer(fields.first()?)?;
    let end = frame_integer(fields.get(1)?)?;
    let BytesFrame::Array(owner_fields) = fields.get(2)? else {
        return None;
    };
    let host = frame_text(owner_fields.first()?)?;
    let port = match owner_fields.get(1)? {
        BytesFrame::Integer(port) => u16::try_from(*port).ok()?,
        other => frame_text(other)?.parse::<u16>().ok()?,
    };
    Some((
        SlotRange {
            start: u16::try_from(start).ok()?,
            end: u16::try_from(end).ok()?,
        },
        NodeAddress::new(host, port),
    ))
}

fn frame_integer(frame: &BytesFrame) -> Option<i64> {
    match frame {
        BytesFrame::Integer(value) => Some(*value),
        _ => None,
    }
}

fn frame_text(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(bytes) | BytesFrame::SimpleString(bytes) => {
            Some(String::from_utf8_lossy(bytes).to_string())
        }
        _ => None,
    }
}
