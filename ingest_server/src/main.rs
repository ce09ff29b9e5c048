use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::*;
use axum::Router;
use log::*;
use structopt::*;

mod handler;

use handler::AppState;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "ingest_server",
    about = "Fetches remote archives and streams their files back as multipart/form-data"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Address to listen on
    #[structopt(long, env = "INGEST_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Require HTTP Basic auth with these credentials (user:password)
    #[structopt(long, env = "CREDENTIALS", hide_env_values = true)]
    credentials: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    if args.credentials.is_none() {
        warn!("No credentials configured; anyone can use this service");
    }
    let state = Arc::new(AppState::new(args.credentials).context("Couldn't build HTTP client")?);
    let app = Router::new().fallback(handler::ingest).with_state(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Couldn't listen on {}", args.listen))?;
    info!("Listening on http://{}", args.listen);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}
