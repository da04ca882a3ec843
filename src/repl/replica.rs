use core::str;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::rdb;
use crate::server::commands;
use crate::server::handler::{ConnectionHandler, RespValue};
use crate::server::server::HostContext;

/// Follower side of replication: the handshake, the PSYNC snapshot, and
/// the long-lived listener that applies the leader's write stream.
pub struct ReplicationClient<S> {
    handler: ConnectionHandler<S>,
    listening_port: u16,
}

impl ReplicationClient<TcpStream> {
    pub async fn connect(leader_addr: &str, listening_port: u16) -> Result<Self> {
        let stream = TcpStream::connect(leader_addr)
            .await
            .with_context(|| format!("connecting to leader at {leader_addr}"))?;
        Ok(Self::new(stream, listening_port))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReplicationClient<S> {
    pub fn new(stream: S, listening_port: u16) -> Self {
        Self {
            handler: ConnectionHandler::new(stream),
            listening_port,
        }
    }

    /// Runs the three-step handshake. Any unexpected reply aborts with a
    /// descriptive error.
    pub async fn send_handshake(&mut self) -> Result<()> {
        log::info!("pinging leader");
        self.expect_simple(RespValue::command(&["PING"]), "PONG")
            .await?;

        log::info!("announcing listening port");
        let port = self.listening_port.to_string();
        self.expect_simple(
            RespValue::command(&["REPLCONF", "listening-port", &port]),
            "OK",
        )
        .await?;

        log::info!("announcing capabilities");
        self.expect_simple(RespValue::command(&["REPLCONF", "capa", "psync2"]), "OK")
            .await?;

        log::info!("handshake complete");
        Ok(())
    }

    async fn expect_simple(&mut self, request: RespValue, expected: &str) -> Result<()> {
        self.handler.write(&request).await?;
        let reply = self.handler.read_and_parse().await?;
        ensure!(
            reply.as_ref() == Some(&RespValue::simple(expected)),
            "leader replied {reply:?} where '+{expected}' was expected"
        );
        Ok(())
    }

    /// Sends `PSYNC ? -1`, checks the FULLRESYNC reply, and seeds the
    /// store from the snapshot that follows it.
    pub async fn psync(&mut self, host: &HostContext) -> Result<()> {
        log::info!("psyncing with leader");
        self.handler
            .write(&RespValue::command(&["PSYNC", "?", "-1"]))
            .await?;

        let reply = self.handler.read_and_parse().await?;
        let Some(RespValue::SimpleString(raw)) = reply else {
            bail!("leader replied {reply:?} where '+FULLRESYNC' was expected");
        };
        let line = str::from_utf8(&raw).context("FULLRESYNC reply is not text")?;
        ensure!(
            line.starts_with("FULLRESYNC "),
            "leader replied '+{line}' where '+FULLRESYNC' was expected"
        );

        let blob = self.handler.read_rdb_payload().await?;
        log::info!("received rdb snapshot of {} bytes", blob.len());

        let contents = rdb::parse(&blob).context("parsing the rdb snapshot from the leader")?;
        if let Some(db) = contents.databases.into_iter().next() {
            host.store.load(db.keys, db.expiries).await;
        }

        Ok(())
    }

    /// Applies replicated commands for the rest of the process lifetime.
    /// Replies are suppressed except for `REPLCONF GETACK`, and every
    /// command's exact wire length feeds the processed-bytes counter.
    pub async fn run(mut self, host: Arc<HostContext>) {
        log::info!("replication listener running");
        let conn_id = host.next_conn_id();

        loop {
            let before = self.handler.consumed();
            let request = match self.handler.read_and_parse().await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    log::info!("leader closed the replication stream");
                    return;
                }
                Err(err) => {
                    log::error!("replication stream error: {err:#}");
                    return;
                }
            };

            let name = match commands::parse_command(&request) {
                Ok(name) => name,
                Err(err) => {
                    log::error!("bad replicated command: {err:#}");
                    return;
                }
            };

            // the GETACK reply must carry the offset from before this frame
            let reply = commands::dispatch(&host, conn_id, &name, &request).await;

            if is_getack(&name, &request) {
                if let Err(err) = self.handler.write(&reply).await {
                    log::error!("failed to write ACK to leader: {err:#}");
                    return;
                }
            }

            host.add_processed_bytes(self.handler.consumed() - before);
        }
    }
}

fn is_getack(name: &str, request: &RespValue) -> bool {
    if name != "replconf" {
        return false;
    }
    let RespValue::Array(elements) = request else {
        return false;
    };
    elements
        .get(1)
        .and_then(RespValue::as_str)
        .is_some_and(|sub| sub.eq_ignore_ascii_case("getack"))
}
