//! Command-line entry point: parse options, bring up the log pipeline and
//! the database pool, then run the reactor until `SIGTERM`.

use std::process;

use clap::Parser;
use log::info;

use kvikk::config::Config;
use kvikk::db::{self, DbPool};
use kvikk::error::ServerError;
use kvikk::logger;
use kvikk::reactor::Reactor;

fn main() {
    let cfg = Config::parse();
    if let Err(err) = run(cfg) {
        eprintln!("kvikk: fatal: {err}");
        process::exit(1);
    }
}

fn run(cfg: Config) -> Result<(), ServerError> {
    if cfg.log_enable {
        logger::init(
            &cfg.log_dir,
            env!("CARGO_PKG_NAME"),
            &cfg.log_level,
            cfg.log_mode,
        )?;
    }

    let pool = DbPool::connect(&cfg, cfg.sql_pool_size)?;
    let users = {
        let mut lease = pool.acquire();
        db::load_users(&mut *lease)?
    };
    info!("loaded {} users from the database", users.len());

    let mut reactor = Reactor::new(&cfg, pool, users)?;
    reactor.run()?;

    logger::shutdown();
    Ok(())
}
