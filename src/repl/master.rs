use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::rdb;
use crate::server::handler::{ConnectionHandler, RespValue};
use crate::server::server::HostContext;

/// Leader-side PSYNC path. Replies FULLRESYNC, transfers a snapshot of the
/// live store, then forwards every published write until the replica's
/// connection fails. The caller's connection worker ends with us.
pub async fn serve_replica<S>(
    handler: &mut ConnectionHandler<S>,
    host: &HostContext,
    conn_id: u64,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let replid = host.leader_repl_id.as_deref().unwrap_or("?");
    handler
        .write(&RespValue::simple(format!("FULLRESYNC {replid} 0")))
        .await?;

    // snapshot transfer: length-prefixed, no trailing CRLF
    let (keys, expiries) = host.store.dump().await;
    let image = rdb::serialize(&keys, &expiries);
    handler
        .write_raw(format!("${}\r\n", image.len()).as_bytes())
        .await?;
    handler.write_raw(&image).await?;

    let mut events = host.pubsub.subscribe(conn_id).await;
    log::info!("replica {conn_id} is live, forwarding writes");

    while let Some(event) = events.recv().await {
        if let Err(err) = handler.write_raw(&event).await {
            log::warn!("dropping replica {conn_id}, write failed: {err:#}");
            break;
        }
    }

    host.pubsub.unsubscribe(conn_id).await;
    Ok(())
}
