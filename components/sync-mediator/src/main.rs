/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use clap::Parser;
use std::path::PathBuf;
use sync_mediator::{router, AppState, MediatorConfig};

#[derive(Debug, Parser)]
#[command(name = "sync-mediator", about = "The tunesync mediator endpoint")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8087")]
    listen: String,

    /// Path to the central SQLite database.
    #[arg(long)]
    db_path: PathBuf,

    /// Symmetric secret bearer tokens are verified against.
    #[arg(long, env = "TUNESYNC_AUTH_SECRET")]
    auth_secret: String,

    /// Hard ceiling on pull page sizes.
    #[arg(long, default_value_t = 500)]
    max_page_size: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().filter_or("RUST_LOG", "info"));
    let args = Args::parse();

    let conn = sync_mediator::schema::open(&args.db_path)?;
    let mut config = MediatorConfig::new(&args.auth_secret);
    config.max_page_size = args.max_page_size;

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    log::info!("sync mediator listening on {}", args.listen);
    axum::serve(listener, router(AppState::new(conn, config))).await?;
    Ok(())
}
