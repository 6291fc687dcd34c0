mod api;
mod cli;
mod conf;
mod storage;

use human_panic::setup_panic;

#[tokio::main]
async fn main() {
    setup_panic!();

    if let Err(e) = cli::init().await {
        eprintln!("brandforge exited with error; {:?}", e);
        std::process::exit(1);
    }
}
