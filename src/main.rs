use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use waline_likes::dom::Document;
use waline_likes::{
    classify, CommentFeedReconciler, LikeConfig, LikeService, LikeStateController, LikedPaths,
    LocalStore, ReconcilerConfig, SessionStore, SessionUser, ToggleOutcome,
};

#[derive(Parser)]
#[command(name = "waline-likes")]
#[command(about = "Article likes stored as Waline comments")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show like counts for one or more article paths
    Stats {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// List who liked an article
    Users { path: String },

    /// Rank articles by like count
    Ranking {
        /// Order by most recent like instead of count
        #[arg(long)]
        recent: bool,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Like an article as the logged-in user
    Like { path: String },

    /// Remove the logged-in user's like
    Unlike { path: String },

    /// Store a Waline session locally
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        user_id: String,
    },

    /// Forget the stored session
    Logout,

    /// Run one reconciliation pass over saved widget markup
    Reconcile { file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("waline_likes=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Reconcile { file } = &cli.command {
        return reconcile_file(file);
    }

    let config = LikeConfig::from_env()?;
    let store = LocalStore::open(&config.data_dir()?)?;
    let session = SessionStore::new(store.clone());
    let liked_paths = LikedPaths::new(store);
    liked_paths.repair();
    let service = || -> Result<Arc<LikeService>> {
        Ok(Arc::new(LikeService::new(&config, session.clone())?))
    };

    match cli.command {
        Commands::Stats { paths } => {
            let counts = service()?.get_batch_article_stats(&paths).await;
            for path in &paths {
                match counts.get(path) {
                    Some(count) => println!("{count:>6}  {path}"),
                    None => println!("{:>6}  {path}", "?"),
                }
            }
        }
        Commands::Users { path } => {
            let users = service()?.get_like_users(&path).await;
            if users.is_empty() {
                println!("No likes on {path}");
            }
            for user in users {
                println!("{}  {}", user.time, user.name);
            }
        }
        Commands::Ranking { recent, limit } => {
            let service = service()?;
            let ranking = if recent {
                service.get_recent_liked_articles(limit).await
            } else {
                service.get_most_liked_articles(limit).await
            };
            for (rank, stats) in ranking.iter().enumerate() {
                let last = stats
                    .last_liked_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{:>3}. {:>5}  {}  {}", rank + 1, stats.count, stats.path, last);
            }
        }
        Commands::Like { path } => toggle_to(service()?, liked_paths, path, true).await?,
        Commands::Unlike { path } => toggle_to(service()?, liked_paths, path, false).await?,
        Commands::Login {
            token,
            name,
            email,
            user_id,
        } => {
            if !service()?.verify_token(&token).await {
                return Err(anyhow!("the comment server rejected this token"));
            }
            session.login(&SessionUser {
                token,
                display_name: name,
                email,
                object_id: Some(user_id),
                ..Default::default()
            })?;
            println!("Logged in as {}", session.user_name());
        }
        Commands::Logout => {
            session.logout();
            println!("Logged out");
        }
        Commands::Reconcile { file } => reconcile_file(&file)?,
    }
    Ok(())
}

async fn toggle_to(
    service: Arc<LikeService>,
    liked_paths: LikedPaths,
    path: String,
    want_liked: bool,
) -> Result<()> {
    let session = service.session().clone();
    let controller = LikeStateController::new(path.clone(), service, liked_paths);
    controller.hydrate().await;
    if controller.state().liked == want_liked {
        let verb = if want_liked { "liked" } else { "not liked" };
        println!("{path} is already {verb} ({} likes)", controller.state().count);
        return Ok(());
    }

    match controller.toggle().await {
        Ok(ToggleOutcome::Liked { count }) => println!("Liked {path} ({count} likes)"),
        Ok(ToggleOutcome::Unliked { count }) => println!("Unliked {path} ({count} likes)"),
        Ok(ToggleOutcome::Skipped) => println!("A request for {path} is already running"),
        Err(e) => {
            let classification = classify(&e);
            if classification.remedy.is_some_and(|r| r.clears_session()) {
                session.logout();
            }
            if classification.informational {
                println!("{}", classification.message);
            } else {
                let hint = if classification.remedy.is_some() {
                    " (run `waline-likes login`)"
                } else {
                    ""
                };
                let message = format!("{}{hint}", classification.message);
                return Err(anyhow::Error::new(e).context(message));
            }
        }
    }
    Ok(())
}

fn reconcile_file(file: &Path) -> Result<()> {
    let html = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let document = Document::parse_fragment(&html);
    let root = document.root();
    let container = document
        .children(root)
        .iter()
        .copied()
        .find(|&child| document.is_element(child))
        .unwrap_or(root);
    let document = Arc::new(Mutex::new(document));

    let reconciler = CommentFeedReconciler::new(
        document.clone(),
        container,
        ReconcilerConfig::default(),
    );
    reconciler.run_pass();
    let stats = reconciler.stats();

    let document = document
        .lock()
        .map_err(|_| anyhow!("document lock poisoned"))?;
    println!("{}", document.inner_html(document.root()));
    eprintln!(
        "hidden {} like entries, {} counter rewrites",
        stats.hidden_total, stats.counter_rewrites
    );
    Ok(())
}
