use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    novelpress::logging::init().context("init logging")?;

    let cli = novelpress::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        novelpress::cli::Command::Serve(args) => {
            novelpress::app::server::serve(args).await.context("serve")?;
        }
        novelpress::cli::Command::Merge(args) => {
            let dir = args.dir.clone();
            let written = tokio::task::spawn_blocking(move || {
                novelpress::merge::VolumeMerger.merge_tree(&dir)
            })
            .await
            .context("join merge task")?
            .with_context(|| format!("merge {}", args.dir.display()))?;
            for path in written {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}
