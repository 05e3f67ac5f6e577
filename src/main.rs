use clap::{Parser, Subcommand, ValueEnum};
use lm_serve::checkpoint::load_engine;
use lm_serve::config::RouteArgs;
use lm_serve::{server, ModelArgs, Result, ServeArgs};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lm-serve")]
#[command(about = "Text completions from a fine-tuned GPT-2 checkpoint over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Route {
    /// Beam sampling profile of POST /generate
    Generate,
    /// Greedy User:/Bot: profile of POST /chat/
    Chat,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Run one completion through a route profile and print it
    Complete {
        text: String,
        #[arg(long, value_enum, default_value_t = Route::Chat)]
        route: Route,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        routes: RouteArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => server::serve(args).await?,
        Commands::Complete {
            text,
            route,
            model,
            routes,
        } => {
            let table = routes.route_table()?;
            let profile = match route {
                Route::Generate => table.generate,
                Route::Chat => table.chat,
            };
            let engine = load_engine(&model).await?;
            let completion =
                tokio::task::spawn_blocking(move || engine.complete(&profile, &text)).await??;
            println!("{}", completion.text);
        }
    }

    Ok(())
}
