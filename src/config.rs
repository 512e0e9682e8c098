use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "ferrite-server", about = "A small in-memory key-value server")]
pub struct Config {
    /// Directory the snapshot file is loaded from at startup.
    #[arg(long, default_value = "/tmp")]
    pub dir: String,

    /// Snapshot file name, relative to `dir`.
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// "HOST PORT" of a master to replicate from. Presence switches role to replica.
    #[arg(long)]
    pub replicaof: Option<String>,
}

impl Config {
    pub fn dbpath(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.dir).join(&self.dbfilename)
    }

    pub fn replica_target(&self) -> Option<(String, u16)> {
        let (host, port) = self.replicaof.as_ref()?.split_once(' ')?;
        let port: u16 = port.parse().ok()?;
        Some((host.to_string(), port))
    }
}
