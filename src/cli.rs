use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
pub struct CLIArgs {
    /// Shell command to launch the UCI engine
    /// i.e: 'stockfish' or '/usr/local/bin/stockfish'
    #[arg(short, long)]
    pub engine: String,

    /// Engine name to register on the site
    #[arg(long, default_value = "Alpha 2")]
    pub name: String,

    /// Site base URL
    #[arg(long, default_value = "https://lichess.org")]
    pub lichess: String,

    /// Broker base URL
    #[arg(long, default_value = "https://engine.lichess.ovh")]
    pub broker: String,

    /// API token with engine:read and engine:write scopes
    #[arg(long, env = "LICHESS_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Optional fixed provider secret
    #[arg(long, env = "PROVIDER_SECRET", hide_env_values = true)]
    pub provider_secret: Option<String>,

    /// Maximum number of threads a job may request
    #[arg(long, default_value_t = default_max_threads())]
    pub max_threads: u32,

    /// Maximum hash table size in MiB
    #[arg(long, default_value_t = 512)]
    pub max_hash: u32,

    /// Terminate the engine after this many seconds without work
    #[arg(long, default_value_t = 300)]
    pub keep_alive: u64,

    /// Additional UCI option applied after the handshake, repeatable
    #[arg(long = "setoption", num_args = 2, value_names = ["NAME", "VALUE"])]
    pub setoption: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: log::LevelFilter,
}

impl CLIArgs {
    /// The flattened --setoption arguments as name/value pairs
    pub fn setoption_pairs(&self) -> Vec<(String, String)> {
        self.setoption
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }
}

fn default_max_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}
