use std::path::PathBuf;

use clap::Parser;
use leechcrate::{conf::Conf, engine::Engine};

/// Downloads a single torrent, then keeps seeding it until interrupted.
#[derive(Parser)]
#[clap(about, version)]
struct Args {
    /// Path to the .torrent file to download.
    torrent: PathBuf,

    /// Directory the torrent's files are written to.
    #[clap(short, long, default_value = ".")]
    download_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.torrent.extension().and_then(|e| e.to_str()) != Some("torrent") {
        eprintln!("{}: not a .torrent file", args.torrent.display());
        std::process::exit(1);
    }
    if !args.torrent.is_file() {
        eprintln!("{}: no such file", args.torrent.display());
        std::process::exit(1);
    }

    let conf = Conf::new(args.download_dir);
    let engine = Engine::new(conf);
    match engine.run(&args.torrent).await {
        Ok(download) => {
            log::info!("Download complete, seeding");
            // Seed termination is an external signal (e.g. SIGINT), out of
            // scope for this crate; wait for it here and shut sessions down.
            if tokio::signal::ctrl_c().await.is_ok() {
                download.shutdown();
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}
