//! Runtime configuration.
//!
//! Every option has a default so the server starts with no arguments; flags
//! exist for the knobs that matter in deployment: the listen port, trigger
//! modes, pool sizes, the actor model, and the log pipeline.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

/// Readiness trigger mode for a socket.
///
/// `Edge` drains the socket until `WouldBlock` on every readiness event.
/// `Level` consumes one buffer's worth and relies on the re-registration
/// performed after task completion to raise readiness again.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Level-triggered: one read/accept per event.
    Level,
    /// Edge-triggered: drain until `WouldBlock`.
    Edge,
}

/// Division of labor between the reactor and the workers.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorMode {
    /// Workers perform socket I/O and request processing.
    Proactor,
    /// The reactor performs socket I/O; workers only process requests.
    Simple,
}

/// Log persistence mode.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Lines pass through the buffer ring; a background thread persists.
    Async,
    /// Lines are written to the file on the calling thread.
    Sync,
}

/// Command-line options.
#[derive(Parser, Debug, Clone)]
#[command(name = "kvikk", about = "Concurrent HTTP/1.1 server", version)]
pub struct Config {
    /// TCP port to listen on.
    #[arg(short, long, default_value_t = 9006)]
    pub port: u16,

    /// Enable logging. `--log-enable false` silences the pipeline entirely.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub log_enable: bool,

    /// Most verbose level to record (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Directory for log files.
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,

    /// Whether log lines are persisted by a background thread or inline.
    #[arg(long, value_enum, default_value_t = LogMode::Async)]
    pub log_mode: LogMode,

    /// Trigger mode for the listening socket.
    #[arg(long, value_enum, default_value_t = TriggerMode::Edge)]
    pub listen_trigger: TriggerMode,

    /// Trigger mode for client sockets.
    #[arg(long, value_enum, default_value_t = TriggerMode::Edge)]
    pub conn_trigger: TriggerMode,

    /// Who performs client socket I/O.
    #[arg(long, value_enum, default_value_t = ActorMode::Proactor)]
    pub actor_model: ActorMode,

    /// Number of pre-authenticated database handles in the pool.
    #[arg(long, default_value_t = 8)]
    pub sql_pool_size: usize,

    /// Number of worker threads.
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// Task queue capacity; a full queue closes the offending connection.
    #[arg(long, default_value_t = 10_000)]
    pub queue_capacity: usize,

    /// Drain the task queue and join workers on shutdown.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub graceful_close: bool,

    /// Directory served as the site root.
    #[arg(long, default_value = "./root")]
    pub doc_root: PathBuf,

    /// Alarm period in seconds; idle connections close after three periods.
    #[arg(long, default_value_t = 5)]
    pub timeslot: u64,

    /// MySQL host.
    #[arg(long, default_value = "localhost")]
    pub sql_host: String,

    /// MySQL port.
    #[arg(long, default_value_t = 3306)]
    pub sql_port: u16,

    /// MySQL user.
    #[arg(long, default_value = "root")]
    pub sql_user: String,

    /// MySQL password.
    #[arg(long, default_value = "root")]
    pub sql_password: String,

    /// MySQL database holding the `user` table.
    #[arg(long, default_value = "webserver")]
    pub sql_database: String,
}

#[cfg(test)]
mod test {
    use clap::CommandFactory;
    use clap::Parser;

    use super::{ActorMode, Config, LogMode, TriggerMode};

    #[test]
    fn cli_is_well_formed() {
        Config::command().debug_assert();
    }

    #[test]
    fn defaults_match_deployment_profile() {
        let cfg = Config::parse_from(["kvikk"]);
        assert_eq!(9006, cfg.port);
        assert_eq!(8, cfg.workers);
        assert_eq!(8, cfg.sql_pool_size);
        assert_eq!(10_000, cfg.queue_capacity);
        assert_eq!(5, cfg.timeslot);
        assert_eq!(ActorMode::Proactor, cfg.actor_model);
        assert_eq!(TriggerMode::Edge, cfg.conn_trigger);
        assert_eq!(LogMode::Async, cfg.log_mode);
        assert!(cfg.log_enable);
        assert!(cfg.graceful_close);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::parse_from([
            "kvikk",
            "-p",
            "8080",
            "--actor-model",
            "simple",
            "--conn-trigger",
            "level",
            "--log-enable",
            "false",
        ]);
        assert_eq!(8080, cfg.port);
        assert_eq!(ActorMode::Simple, cfg.actor_model);
        assert_eq!(TriggerMode::Level, cfg.conn_trigger);
        assert!(!cfg.log_enable);
    }
}
