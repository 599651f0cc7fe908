use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::Level;

#[derive(Parser)]
#[command(name = "forum-view")]
#[command(about = "forum-view - Keep forum page regions in sync with the forum's JSON API.")]
#[command(version)]
struct Args {
    /// Page to render, e.g. / or /category/marketplace/Buyers?page=2
    #[arg(default_value = "/")]
    location: String,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Forum base URL (overrides config file)
    #[arg(long)]
    base_url: Option<String>,

    /// Signed-in username shown on local shouts
    #[arg(short, long)]
    user: Option<String>,

    /// Post type for detail pages (defaults to the route's)
    #[arg(long)]
    post_type: Option<String>,

    /// Post id for detail pages (defaults to the route's)
    #[arg(long)]
    post_id: Option<String>,

    /// Run one cycle of every region, print the page and exit
    #[arg(long)]
    once: bool,

    /// Stop watching after this long, e.g. 30s
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Post a shoutbox message after loading
    #[arg(long)]
    shout: Option<String>,

    /// Run a search after loading
    #[arg(long)]
    search: Option<String>,

    /// Post type filter for --search
    #[arg(long, default_value = "all")]
    search_type: String,

    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: Level,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(
        "Parsed command line arguments: location={:?}, config={:?}, once={}",
        args.location,
        args.config,
        args.once
    );

    let options = forum_view::app::Options {
        location: args.location,
        config_file: args.config,
        base_url: args.base_url,
        user: args.user,
        post_type: args.post_type,
        post_id: args.post_id,
        once: args.once,
        duration: args.duration,
        shout: args.shout,
        search: args.search.map(|query| (query, args.search_type)),
    };

    if let Err(err) = forum_view::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}
