use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};

use crate::repl::{self, pubsub::PubSubManager};
use crate::store::KvStore;

use super::commands;
use super::handler::{ConnectionHandler, RespValue};

/// A command captured inside a MULTI, replayed verbatim by EXEC.
pub struct QueuedCommand {
    pub name: String,
    pub request: RespValue,
}

/// Process-wide state shared by every connection worker. Passed around as
/// an `Arc`, never through globals.
pub struct HostContext {
    pub store: KvStore,
    pub config_store: KvStore,
    /// Upstream leader address; `None` means this node is the leader.
    pub leader_addr: Option<String>,
    pub port: u16,
    /// Set at leader startup, absent on followers.
    pub leader_repl_id: Option<String>,
    pub pubsub: PubSubManager,
    processed_bytes: Mutex<u64>,
    tx_queues: Mutex<HashMap<u64, Vec<QueuedCommand>>>,
    next_conn_id: AtomicU64,
}

impl HostContext {
    pub fn new(leader_addr: Option<String>, port: u16, pubsub: PubSubManager) -> Self {
        let leader_repl_id = leader_addr.is_none().then(repl::generate_repl_id);

        Self {
            store: KvStore::new(),
            config_store: KvStore::new(),
            leader_addr,
            port,
            leader_repl_id,
            pubsub,
            processed_bytes: Mutex::new(0),
            tx_queues: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader_addr.is_none()
    }

    /// The role name existing tooling expects in INFO.
    pub fn role(&self) -> &'static str {
        if self.is_leader() {
            "master"
        } else {
            "slave"
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Replication bytes applied by this node while acting as a follower.
    pub fn processed_bytes(&self) -> u64 {
        *self.processed_bytes.lock().unwrap()
    }

    pub fn add_processed_bytes(&self, count: u64) {
        *self.processed_bytes.lock().unwrap() += count;
    }

    pub fn in_transaction(&self, conn_id: u64) -> bool {
        self.tx_queues.lock().unwrap().contains_key(&conn_id)
    }

    pub fn begin_transaction(&self, conn_id: u64) {
        self.tx_queues.lock().unwrap().insert(conn_id, Vec::new());
    }

    pub fn queue_command(&self, conn_id: u64, name: &str, request: RespValue) {
        if let Some(queue) = self.tx_queues.lock().unwrap().get_mut(&conn_id) {
            queue.push(QueuedCommand {
                name: name.to_string(),
                request,
            });
        }
    }

    pub fn consume_transaction(&self, conn_id: u64) -> Vec<QueuedCommand> {
        self.tx_queues
            .lock()
            .unwrap()
            .remove(&conn_id)
            .unwrap_or_default()
    }

    /// Connections drop their queue on every exit path, EXECed or not.
    pub fn drop_transaction(&self, conn_id: u64) {
        self.tx_queues.lock().unwrap().remove(&conn_id);
    }
}

/// Accepts connections forever, one worker task per connection.
pub async fn serve(host: Arc<HostContext>, listener: TcpListener) -> Result<()> {
    log::info!("connection loop is accepting requests");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let host = host.clone();
                let conn_id = host.next_conn_id();
                log::debug!("accepted connection {conn_id} from {peer}");

                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, &host, conn_id).await {
                        log::error!("connection {conn_id}: {err:#}");
                    }
                    host.drop_transaction(conn_id);
                });
            }
            Err(err) => log::error!("error accepting connection: {err}"),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    host: &Arc<HostContext>,
    conn_id: u64,
) -> Result<()> {
    let mut handler = ConnectionHandler::new(stream);

    loop {
        let Some(request) = handler.read_and_parse().await? else {
            log::debug!("connection {conn_id} closed");
            return Ok(());
        };

        let name = commands::parse_command(&request)?;

        // PSYNC owns the socket from here on: snapshot, then live stream
        if name == "psync" {
            return repl::master::serve_replica(&mut handler, host, conn_id).await;
        }

        let reply = commands::dispatch(host, conn_id, &name, &request).await;
        handler.write(&reply).await?;
    }
}
