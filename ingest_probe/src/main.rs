use std::path::{Path, PathBuf};

use anyhow::*;
use log::*;
use structopt::*;
use tokio::io::BufWriter;

use ingest::source::ReaderSource;
use ingest::*;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "ingest_probe",
    about = "Runs a local archive through the ingest pipeline, writing the multipart stream to stdout"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Filter options, as they'd appear in the service's query string
    /// (e.g. "omitFirstSegment&pathPatterns=src&maxFileSize=100000")
    #[structopt(short, long, default_value = "")]
    query: String,

    /// Check ZIP entries' CRC-32s
    #[structopt(long)]
    verify_crc: bool,

    #[structopt(name("archive"))]
    archive_path: PathBuf,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Couldn't start async runtime")?;
    runtime.block_on(probe(&args.archive_path, &args.query, args.verify_crc))
}

async fn probe(archive_path: &Path, query: &str, verify_crc: bool) -> Result<()> {
    let config = FilterConfiguration::from_query(query.trim_start_matches('?'));
    debug!("{:#?}", config);

    let archive = tokio::fs::File::open(archive_path)
        .await
        .with_context(|| format!("Couldn't open {}", archive_path.display()))?;
    let encoder = MultipartEncoder::new(BufWriter::new(tokio::io::stdout()));
    info!("Boundary: {}", encoder.boundary());

    let stats = PipelineDriver::new(config)
        .verify_crc(verify_crc)
        .run(ReaderSource::new(archive), encoder)
        .await
        .with_context(|| format!("Couldn't ingest {}", archive_path.display()))?;
    info!("{}: {stats}", archive_path.display());
    Ok(())
}
