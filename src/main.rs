use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use tokio::net::TcpListener;

use config::Config;
use repl::pubsub::PubSubManager;
use repl::replica::ReplicationClient;
use server::server::HostContext;
use store::{Value, ValueOptions};

mod config;
mod rdb;
mod repl;
mod server;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    let conf = Config::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if conf.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();
    log::debug!("parsed config: {conf:?}");

    let host = Arc::new(HostContext::new(
        conf.replicaof.clone(),
        conf.port,
        PubSubManager::start(),
    ));

    host.config_store
        .set("dir", Value::String(conf.dir.clone()), ValueOptions::default())
        .await;
    host.config_store
        .set(
            "dbfilename",
            Value::String(conf.dbfilename.clone()),
            ValueOptions::default(),
        )
        .await;

    host.store
        .initialise_from_rdb(&conf.dir, &conf.dbfilename)
        .await?;

    if let Some(leader_addr) = &host.leader_addr {
        log::info!("starting follower initiation steps");
        let mut client = ReplicationClient::connect(leader_addr, host.port).await?;
        client
            .send_handshake()
            .await
            .context("replication handshake")?;
        client.psync(&host).await.context("psync with leader")?;
        tokio::spawn(client.run(host.clone()));
    } else {
        log::info!("starting leader initiation steps");
    }

    let address = format!("0.0.0.0:{}", conf.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind to {address}"))?;
    log::info!("listening on {address}");

    server::server::serve(host, listener).await
}
