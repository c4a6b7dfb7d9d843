mod commands;

use arena::config::Config;
use clap::Parser;
use commands::*;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let command = match cli.command {
        None | Some(Commands::ShowConfig) => {
            Config::show();
            return Ok(());
        }
        Some(command) => command,
    };
    let config = Config::parse_from_file(&cli.opts.config)?;

    if let Commands::Serve = command {
        return actix_web::rt::System::new().block_on(async move {
            let ctx = Context::setup(config)?;
            serve(ctx).await
        });
    }

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(async move {
        let ctx = Context::setup(config)?;
        run(ctx, command).await
    })
}
