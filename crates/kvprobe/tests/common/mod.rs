//! Shared helpers for integration tests: an in-process RESP store node with
//! optional sentinel-style discovery and sharded-deployment behavior.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use kvprobe::sharding::partition_of;
use kvprobe::types::NodeAddress;

/// Mutable state backing one mock node, shared with the test body.
#[derive(Default)]
pub struct MockState {
    pub data: HashMap<String, String>,
    /// Answer to `SENTINEL GET-MASTER-ADDR-BY-NAME`; `None` replies null.
    pub master: Option<NodeAddress>,
    /// Answer to `SENTINEL REPLICAS`.
    pub replicas: Vec<NodeAddress>,
    /// When set, the node only accepts keys hashing into this inclusive
    /// slot range and answers `MOVED` for everything else.
    pub owned_slots: Option<(u16, u16)>,
    /// Full slot table `(start, end, owner)` used for `MOVED` targets and
    /// `CLUSTER SLOTS` replies.
    pub slot_table: Vec<(u16, u16, NodeAddress)>,
    /// Keys for which `SET` answers an explicit error.
    pub refuse_keys: HashSet<String>,
}

pub struct MockNode {
    pub addr: NodeAddress,
    pub state: Arc<Mutex<MockState>>,
    handle: JoinHandle<()>,
}

impl MockNode {
    pub async fn spawn() -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock node");
        let port = listener.local_addr().expect("mock local addr").port();
        let state: Arc<Mutex<MockState>> = Arc::new(Mutex::new(MockState::default()));

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, conn_state).await;
                });
            }
        });

        MockNode {
            addr: NodeAddress::new("127.0.0.1", port),
            state,
            handle,
        }
    }

    pub fn set_master(&self, master: Option<NodeAddress>) {
        self.state.lock().unwrap().master = master;
    }

    pub fn set_replicas(&self, replicas: Vec<NodeAddress>) {
        self.state.lock().unwrap().replicas = replicas;
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .data
            .insert(key.to_string(), value.to_string());
    }

    pub fn refuse_key(&self, key: &str) {
        self.state.lock().unwrap().refuse_keys.insert(key.to_string());
    }

    pub fn data_snapshot(&self) -> HashMap<String, String> {
        self.state.lock().unwrap().data.clone()
    }

    /// Replicates another node's current data wholesale.
    pub fn copy_data_from(&self, other: &MockNode) {
        let snapshot = other.data_snapshot();
        self.state.lock().unwrap().data = snapshot;
    }

    /// Turns the node into one member of a sharded deployment.
    pub fn configure_shard(&self, owned: (u16, u16), slot_table: Vec<(u16, u16, NodeAddress)>) {
        let mut state = self.state.lock().unwrap();
        state.owned_slots = Some(owned);
        state.slot_table = slot_table;
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Binds and immediately releases a port, yielding an address nothing
/// listens on.
pub async fn dead_endpoint() -> NodeAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    NodeAddress::new("127.0.0.1", port)
}

async fn serve(socket: TcpStream, state: Arc<Mutex<MockState>>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    while let Some(frame) = framed.next().await {
        let reply = respond(frame?, &state);
        framed.send(reply).await?;
    }
    Ok(())
}

fn respond(frame: BytesFrame, state: &Arc<Mutex<MockState>>) -> BytesFrame {
    let Some(parts) = command_parts(&frame) else {
        return BytesFrame::Error("ERR protocol error".into());
    };
    let Some(command) = parts.first().map(|c| c.to_ascii_uppercase()) else {
        return BytesFrame::Error("ERR empty command".into());
    };

    match command.as_str() {
        "PING" => BytesFrame::SimpleString(Bytes::from_static(b"PONG")),
        "SET" if parts.len() >= 3 => {
            let key = &parts[1];
            let mut state = state.lock().unwrap();
            if state.refuse_keys.contains(key) {
                return BytesFrame::Error("ERR write refused".into());
            }
            if let Some(moved) = moved_reply(key, &state) {
                return moved;
            }
            state.data.insert(key.clone(), parts[2].clone());
            BytesFrame::SimpleString(Bytes::from_static(b"OK"))
        }
        "GET" if parts.len() >= 2 => {
            let key = &parts[1];
            let state = state.lock().unwrap();
            if let Some(moved) = moved_reply(key, &state) {
                return moved;
            }
            match state.data.get(key) {
                Some(value) => BytesFrame::BulkString(Bytes::from(value.clone().into_bytes())),
                None => BytesFrame::Null,
            }
        }
        "FLUSHALL" => {
            state.lock().unwrap().data.clear();
            BytesFrame::SimpleString(Bytes::from_static(b"OK"))
        }
        "SENTINEL" if parts.len() >= 2 => sentinel_reply(&parts, state),
        "CLUSTER" if parts.len() >= 2 && parts[1].eq_ignore_ascii_case("SLOTS") => {
            let state = state.lock().unwrap();
            BytesFrame::Array(
                state
                    .slot_table
                    .iter()
                    .map(|(start, end, owner)| {
                        BytesFrame::Array(vec![
                            BytesFrame::Integer(i64::from(*start)),
                            BytesFrame::Integer(i64::from(*end)),
                            BytesFrame::Array(vec![
                                bulk(&owner.host),
                                BytesFrame::Integer(i64::from(owner.port)),
                            ]),
                        ])
                    })
                    .collect(),
            )
        }
        _ => BytesFrame::Error(format!("ERR unknown command {command}").into()),
    }
}

fn sentinel_reply(parts: &[String], state: &Arc<Mutex<MockState>>) -> BytesFrame {
    let state = state.lock().unwrap();
    match parts[1].to_ascii_uppercase().as_str() {
        "GET-MASTER-ADDR-BY-NAME" => match &state.master {
            Some(master) => BytesFrame::Array(vec![
                bulk(&master.host),
                bulk(&master.port.to_string()),
            ]),
            None => BytesFrame::Null,
        },
        "REPLICAS" => BytesFrame::Array(
            state
                .replicas
                .iter()
                .map(|replica| {
                    BytesFrame::Array(vec![
                        bulk("name"),
                        bulk(&replica.to_string()),
                        bulk("ip"),
                        bulk(&replica.host),
                        bulk("port"),
                        bulk(&replica.port.to_string()),
                        bulk("flags"),
                        bulk("slave"),
                    ])
                })
                .collect(),
        ),
        other => BytesFrame::Error(format!("ERR unknown SENTINEL subcommand {other}").into()),
    }
}

/// `MOVED` for keys outside the node's owned range, per the slot table.
fn moved_reply(key: &str, state: &MockState) -> Option<BytesFrame> {
    let (start, end) = state.owned_slots?;
    let slot = partition_of(key, 16384);
    if slot >= start && slot <= end {
        return None;
    }
    let owner = state
        .slot_table
        .iter()
        .find(|(s, e, _)| slot >= *s && slot <= *e)
        .map(|(_, _, owner)| owner.clone())?;
    Some(BytesFrame::Error(format!("MOVED {slot} {owner}").into()))
}

fn command_parts(frame: &BytesFrame) -> Option<Vec<String>> {
    let BytesFrame::Array(items) = frame else {
        return None;
    };
    items
        .iter()
        .map(|item| match item {
            BytesFrame::BulkString(bytes) | BytesFrame::SimpleString(bytes) => {
                Some(String::from_utf8_lossy(bytes).to_string())
            }
            _ => None,
        })
        .collect()
}

fn bulk(text: &str) -> BytesFrame {
    BytesFrame::BulkString(Bytes::from(text.as_bytes().to_vec()))
}
