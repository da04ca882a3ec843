use clap::Parser;

/// A Redis-compatible in-memory key/value server.
#[derive(Parser, Debug)]
#[command(name = "redlite")]
pub struct Config {
    /// Port to listen on
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// Replicate from a leader, given as "<host> <port>"
    #[arg(long, value_name = "HOST PORT", value_parser = parse_replica_of)]
    pub replicaof: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Snapshot filename inside --dir
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,

    /// Directory holding the snapshot
    #[arg(long, default_value = "/tmp/redis-files/")]
    pub dir: String,
}

/// Turns the space-separated "<host> <port>" clap receives into the
/// "host:port" form the replication client dials.
fn parse_replica_of(raw: &str) -> Result<String, String> {
    let parts: Vec<&str> = raw.split_whitespace().collect();
    if parts.len() != 2 {
        return Err("expected '<host> <port>'".to_string());
    }

    let host = parts[0];
    let port: u16 = parts[1]
        .parse()
        .map_err(|_| format!("invalid port '{}'", parts[1]))?;

    Ok(format!("{host}:{port}"))
}
