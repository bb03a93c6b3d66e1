use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Base URL of the agent backend. REST calls go here directly; the
    /// socket endpoint is derived from it (http -> ws, https -> wss).
    #[arg(long, env = "BACKEND_URL", default_value = "http://localhost:8745")]
    pub backend_url: String,

    /// Bearer token issued by the backend. Sent as a header on REST calls
    /// and as the first text frame of the socket handshake.
    #[arg(long, env = "API_TOKEN", default_value = "")]
    pub token: String,

    /// Agent to converse with. Defaults to the first agent the backend lists.
    #[arg(long, env = "AGENT", default_value = "")]
    pub agent: String,

    /// Also render synthetic seed messages (hidden by default).
    #[arg(long, env = "SHOW_INITIAL", default_value = "false")]
    pub show_initial: bool,

    /// Seconds to wait before retrying when the backend was never reachable.
    #[arg(long, env = "RELOAD_DELAY_SECS", default_value = "5")]
    pub reload_delay_secs: u64,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}
