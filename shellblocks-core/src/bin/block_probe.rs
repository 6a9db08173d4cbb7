// shellblocks-core/src/bin/block_probe.rs
//
// Runs each command-line argument as a shell command through the block
// pipeline and prints the resulting blocks.
//
//   block_probe [--config FILE] [--db FILE] 'ls --color=always' 'false' 'cd /tmp'

use anyhow::{bail, Context, Result};
use shellblocks_core::session::ProcessSession;
use shellblocks_core::store::BlockStore;
use shellblocks_core::vault::Vault;
use shellblocks_core::{BlockId, BlockLifecycle, CommandBlock, PipelineConfig, Theme};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "shellblocks.json";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = Args::parse(std::env::args().skip(1))?;
    if args.commands.is_empty() {
        bail!("usage: block_probe [--config FILE] [--db FILE] <command>...");
    }

    let config = PipelineConfig::load(&args.config).context("loading config")?;
    let theme = config.theme;
    let wait_limit = config.quiet_period() + Duration::from_secs(30);

    let vault = match &args.db {
        Some(path) => Vault::open(path).context("opening vault")?,
        None => Vault::open_in_memory().context("opening in-memory vault")?,
    };
    let store: Arc<dyn BlockStore> = Arc::new(vault.clone());

    let cwd = std::env::current_dir().context("reading current directory")?;
    let cwd = cwd.to_string_lossy().to_string();

    let (session, events) = ProcessSession::spawn(&cwd, true).context("spawning shell")?;
    let lifecycle = BlockLifecycle::new(config, store, Some(Arc::new(session)));
    lifecycle.apply_directory_snapshot(&cwd);
    lifecycle.start();
    lifecycle.attach_session(events);

    for command in &args.commands {
        let block = lifecycle.run_command(command).context("starting command")?;

        let finished = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n[block_probe] Ctrl+C, cancelling…");
                lifecycle.cancel_block(block.id).context("cancelling block")?
            }
            done = wait_for_terminal(&lifecycle, block.id, wait_limit) => done?,
        };

        print_block(&finished, theme);
    }

    eprintln!(
        "[block_probe] {} block(s) recorded, cwd now {}",
        lifecycle.count().unwrap_or(0),
        lifecycle.current_dir()
    );
    vault.close_session().context("closing vault session")?;
    lifecycle.shutdown();
    Ok(())
}

struct Args {
    config: String,
    db: Option<String>,
    commands: Vec<String>,
}

impl Args {
    fn parse(mut it: impl Iterator<Item = String>) -> Result<Self> {
        let mut args = Args {
            config: DEFAULT_CONFIG.to_string(),
            db: None,
            commands: Vec::new(),
        };
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--config" => args.config = it.next().context("--config needs a value")?,
                "--db" => args.db = Some(it.next().context("--db needs a value")?),
                _ => args.commands.push(arg),
            }
        }
        Ok(args)
    }
}

async fn wait_for_terminal(
    lifecycle: &BlockLifecycle,
    id: BlockId,
    limit: Duration,
) -> Result<CommandBlock> {
    let mut rx = lifecycle.observe_blocks();
    let wait = async {
        loop {
            if let Some(block) = rx.borrow_and_update().iter().find(|b| b.id == id) {
                if block.is_terminal() {
                    return anyhow::Ok(CommandBlock::clone(block));
                }
            }
            rx.changed().await.context("block view closed")?;
        }
    };
    tokio::time::timeout(limit, wait)
        .await
        .context("timed out waiting for block")?
}

fn print_block(block: &CommandBlock, theme: Theme) {
    let exit = block
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "?".into());
    println!(
        "── [{} exit={} {}ms] {} $ {}",
        block.status,
        exit,
        block.duration_ms().unwrap_or(0),
        block.cwd,
        block.command
    );

    for (text, style) in block.output.segments() {
        let mut sgr = Vec::new();
        if style.bold {
            sgr.push("1".to_string());
        }
        if style.italic {
            sgr.push("3".to_string());
        }
        if style.underline {
            sgr.push("4".to_string());
        }
        if let Some(rgb) = style.foreground(theme) {
            sgr.push(format!("38;2;{};{};{}", rgb.0, rgb.1, rgb.2));
        }
        if sgr.is_empty() {
            print!("{text}");
        } else {
            print!("\x1b[{}m{text}\x1b[0m", sgr.join(";"));
        }
    }
    if !block.output.text.ends_with('\n') && !block.output.is_empty() {
        println!();
    }
}
