//! Spanflood CLI entry point.

use spanflood_lib::cli::{self, Cli};
use spanflood_lib::core::Result;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    cli::execute(cli).await
}
