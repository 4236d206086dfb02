//! girder server binary.

use clap::Parser;
use protocol_http::StatusCode;
use server::config::Config;
use server::web_frame::WebFrame;
use server::{logging, signal};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "girder-server")]
#[command(about = "Multi-reactor HTTP/1.1 server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::default_toml());
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Failed to load config: {}", err);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(err) = run(config) {
        eprintln!("Server error: {}", err);
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut frame = WebFrame::new(&config.server);
    register_routes(&mut frame)?;

    let bound = frame.bind()?;
    let handle = bound.handle();
    signal::install(move || handle.quit());

    info!(addr = %bound.local_addr(), "serving");
    bound.run();
    info!("server stopped");
    Ok(())
}

fn register_routes(frame: &mut WebFrame) -> Result<(), router::RouteError> {
    frame.get("/hello", |ctx| {
        ctx.text(StatusCode::Ok, "Hello, World!");
        Ok(())
    })?;

    frame.get("/user/:id", |ctx| {
        let id = ctx.path_variable("id").unwrap_or_default().to_string();
        ctx.json(StatusCode::Ok, format!("{{\"id\": {}}}", id));
        Ok(())
    })?;

    frame.get("/files/*path", |ctx| {
        let path = ctx.path_variable("path").unwrap_or_default().to_string();
        ctx.text(StatusCode::Ok, path);
        Ok(())
    })?;

    frame.post("/echo", |ctx| {
        let body = ctx.request().body().to_vec();
        ctx.text(StatusCode::Ok, body);
        Ok(())
    })?;

    Ok(())
}
