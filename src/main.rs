use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vaonis_link::{
    ChannelConfig, CommandChannel, KeyMaterial, RequestOptions, RouteCatalog, UnifiedHttpClient,
    channel::{CONNECT_EVENT, CONTROL_ERROR, DISCONNECT_EVENT, STATUS_UPDATED},
    config::{self, Config},
    image,
    keys::{self, KeyOptions},
    payload::format_value,
};

#[derive(Parser)]
#[command(name = "vaonis")]
#[command(about = "Talk to a Vaonis telescope over its local network")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Instrument host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// HTTP API port (overrides config)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Path prefix to try, in order; repeat for several
    #[arg(long = "prefix", global = true)]
    prefixes: Vec<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Base64 key file used for the Authorization header
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the instrument status snapshot
    Status {
        /// Print compact JSON
        #[arg(long)]
        json: bool,
    },

    /// List cataloged operations
    Routes {
        /// Load the catalog from this manifest instead of the built-in one
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Call an operation by its operation id
    Call {
        operation_id: String,

        #[command(flatten)]
        request: RequestArgs,

        /// Alternative route manifest
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Send a request to an explicit path
    Request {
        /// HTTP method (GET, POST, ...)
        method: String,

        /// Path relative to the detected base URL
        path: String,

        #[command(flatten)]
        request: RequestArgs,
    },

    /// Print the Authorization header for the current challenge
    AuthHeader,

    /// Download an image, tolerating error statuses with image bodies
    Download {
        /// Absolute URL or path relative to the base URL
        target: String,

        /// Output file (defaults to image.<detected extension>)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Send the Authorization header
        #[arg(long)]
        auth: bool,
    },

    /// Open the command channel and print pushed events until Ctrl-C
    Listen {
        #[command(flatten)]
        socket: SocketArgs,

        /// Additional event name to print; repeat for several
        #[arg(short, long = "event")]
        events: Vec<String>,
    },

    /// Send one command over the command channel
    Send {
        /// Command name, e.g. takeControl
        command: String,

        /// JSON payload
        #[arg(short, long)]
        payload: Option<String>,

        /// Wait for the acknowledgement and print it
        #[arg(long)]
        ack: bool,

        #[command(flatten)]
        socket: SocketArgs,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[derive(Args)]
struct RequestArgs {
    /// Query parameter as key=value; repeat a key to send an array
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// JSON request body
    #[arg(long)]
    body: Option<String>,

    /// Sign the current challenge and send the Authorization header
    #[arg(long)]
    auth: bool,
}

#[derive(Args)]
struct SocketArgs {
    /// Socket server URL, e.g. http://10.0.0.1:8083
    #[arg(long)]
    url: Option<String>,

    /// Client id announced to the instrument
    #[arg(long)]
    device_id: Option<String>,

    /// Client display name
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global.log_level);

    let cfg = effective_config(&cli.global)?;

    match cli.command {
        Commands::Status { json } => cmd_status(&cfg, json).await,
        Commands::Routes { manifest } => cmd_routes(manifest.as_deref()),
        Commands::Call {
            operation_id,
            request,
            manifest,
        } => cmd_call(&cfg, &operation_id, &request, manifest.as_deref()).await,
        Commands::Request {
            method,
            path,
            request,
        } => cmd_request(&cfg, &method, &path, &request).await,
        Commands::AuthHeader => cmd_auth_header(&cfg).await,
        Commands::Download {
            target,
            output,
            auth,
        } => cmd_download(&cfg, &target, output.as_deref(), auth).await,
        Commands::Listen { socket, events } => cmd_listen(&cfg, &socket, events).await,
        Commands::Send {
            command,
            payload,
            ack,
            socket,
        } => cmd_send(&cfg, &socket, &command, payload.as_deref(), ack).await,
        Commands::ShowConfig => cmd_show_config(&cfg),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();
}

/// Config file values with command-line overrides applied.
fn effective_config(args: &GlobalArgs) -> Result<Config> {
    let mut cfg = Config::load()?;

    if let Some(host) = &args.host {
        cfg.http.host = host.clone();
    }
    if let Some(port) = args.port {
        cfg.http.port = port;
    }
    if !args.prefixes.is_empty() {
        cfg.http.prefixes = args.prefixes.clone();
    }
    if let Some(timeout) = args.timeout {
        cfg.http.timeout_secs = timeout;
        cfg.socket.ack_timeout_secs = timeout;
    }
    if let Some(key_file) = &args.key_file {
        cfg.key_file = Some(key_file.clone());
    }

    Ok(cfg)
}

fn load_key(cfg: &Config) -> Result<KeyMaterial> {
    let options = KeyOptions {
        secret: None,
        key_file: cfg.key_file.clone(),
    };
    keys::resolve(&options).context("Failed to load key material")
}

fn http_client(cfg: &Config, manifest: Option<&Path>) -> Result<UnifiedHttpClient> {
    let catalog = load_catalog(manifest)?;
    Ok(UnifiedHttpClient::new(&cfg.http, catalog)?)
}

fn load_catalog(manifest: Option<&Path>) -> Result<RouteCatalog> {
    let catalog = match manifest {
        Some(path) => RouteCatalog::from_path(path)
            .with_context(|| format!("Failed to load route manifest: {}", path.display()))?,
        None => RouteCatalog::builtin()?,
    };
    Ok(catalog)
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", what))
}

async fn request_options(
    client: &UnifiedHttpClient,
    cfg: &Config,
    args: &RequestArgs,
) -> Result<RequestOptions> {
    let mut options = RequestOptions::default();

    for param in &args.params {
        let Some((key, value)) = param.split_once('=') else {
            bail!("Parameter '{}' must look like key=value", param);
        };
        options = options.param(key, value);
    }

    if let Some(body) = &args.body {
        options = options.json(parse_json(body, "--body")?);
    }

    if args.auth {
        let key = load_key(cfg)?;
        options = options.auth(client.authorize(&key).await?);
    }

    Ok(options)
}

async fn cmd_status(cfg: &Config, json: bool) -> Result<()> {
    let client = http_client(cfg, None)?;
    let status = client.get_status().await?;

    if json {
        println!("{}", status);
    } else {
        println!("Base URL: {}", client.base_url().await?);
        println!();
        println!("{}", format_value(&status, 0));
    }

    Ok(())
}

fn cmd_routes(manifest: Option<&Path>) -> Result<()> {
    let catalog = load_catalog(manifest)?;

    if catalog.is_empty() {
        println!("No routes in catalog.");
        return Ok(());
    }

    println!("{:<44} {:<8} {}", "OPERATION", "METHOD", "PATH");
    println!("{}", "-".repeat(90));

    for route in catalog.iter() {
        println!("{:<44} {:<8} {}", route.operation_id, route.method, route.path);
    }

    println!();
    println!("{} routes", catalog.len());

    Ok(())
}

async fn cmd_call(
    cfg: &Config,
    operation_id: &str,
    args: &RequestArgs,
    manifest: Option<&Path>,
) -> Result<()> {
    let client = http_client(cfg, manifest)?;

    // Fail on unknown ids before any key or network work.
    if client.catalog().lookup(operation_id).is_none() {
        bail!("Unknown operationId: {}", operation_id);
    }

    let options = request_options(&client, cfg, args).await?;
    let payload = client.call_operation(operation_id, options).await?;
    println!("{}", payload);

    Ok(())
}

async fn cmd_request(cfg: &Config, method: &str, path: &str, args: &RequestArgs) -> Result<()> {
    let client = http_client(cfg, None)?;
    let options = request_options(&client, cfg, args).await?;
    let payload = client.request(method, path, options).await?;
    println!("{}", payload);

    Ok(())
}

async fn cmd_auth_header(cfg: &Config) -> Result<()> {
    let key = load_key(cfg)?;
    let client = http_client(cfg, None)?;
    let header = client.authorize(&key).await?;
    println!("{}", header);

    Ok(())
}

async fn cmd_download(cfg: &Config, target: &str, output: Option<&Path>, auth: bool) -> Result<()> {
    let client = http_client(cfg, None)?;

    let mut options = RequestOptions::default();
    if auth {
        let key = load_key(cfg)?;
        options = options.auth(client.authorize(&key).await?);
    }

    println!("Downloading {} ...", target);
    let bytes = client.download_image(target, options).await?;

    let output = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let format = image::sniff(&bytes, None)?;
            PathBuf::from(format!("image.{}", format.extension()))
        }
    };

    std::fs::write(&output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Saved {} bytes to {}", bytes.len(), output.display());

    Ok(())
}

fn channel_config(cfg: &Config, args: &SocketArgs) -> ChannelConfig {
    let mut channel = ChannelConfig::from(&cfg.socket);

    if let Some(url) = &args.url {
        channel.url = url.clone();
    }
    if let Some(device_id) = &args.device_id {
        channel.device_id = device_id.clone();
    }
    if channel.device_id.is_empty() {
        channel.device_id = "vaonis-cli".to_string();
    }
    if let Some(name) = &args.name {
        channel.name = Some(name.clone());
    }

    channel
}

async fn cmd_listen(cfg: &Config, args: &SocketArgs, extra_events: Vec<String>) -> Result<()> {
    let mut builder = CommandChannel::builder(channel_config(cfg, args));

    let events = [STATUS_UPDATED, CONTROL_ERROR, CONNECT_EVENT, DISCONNECT_EVENT]
        .into_iter()
        .map(String::from)
        .chain(extra_events);
    for event in events {
        let label = event.clone();
        builder = builder.on(event, move |payload| {
            println!("[{}] {}", label, format_value(payload, 4000));
        });
    }

    let channel = builder.connect().await?;
    println!("Listening for events (Ctrl-C to stop)...");

    let closed_by_remote = tokio::select! {
        _ = tokio::signal::ctrl_c() => false,
        _ = channel.closed() => true,
    };

    if closed_by_remote {
        println!("Connection closed by instrument.");
    } else {
        channel.disconnect().await?;
    }

    Ok(())
}

async fn cmd_send(
    cfg: &Config,
    args: &SocketArgs,
    command: &str,
    payload: Option<&str>,
    ack: bool,
) -> Result<()> {
    let payload = payload.map(|raw| parse_json(raw, "--payload")).transpose()?;
    let channel = CommandChannel::builder(channel_config(cfg, args))
        .connect()
        .await?;

    if ack {
        let reply = channel.request(command, payload).await?;
        match reply.error() {
            Some(err) => println!("Command #{} failed: {}", reply.id, err),
            None => println!("{}", format_value(&Value::Array(reply.args.clone()), 0)),
        }
    } else {
        channel.send_command(command, payload)?;
        println!("Sent {}", command);
    }

    // Give the instrument a moment to react before hanging up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    channel.disconnect().await?;

    Ok(())
}

fn cmd_show_config(cfg: &Config) -> Result<()> {
    let path = config::config_path()?;
    println!("Config file: {}", path.display());
    println!();

    let http = &cfg.http;
    println!("[http]");
    println!("{:<20} {}", "host", http.host);
    println!("{:<20} {}", "port", http.port);
    println!("{:<20} {}", "api_base_path", http.api_base_path);
    println!("{:<20} {:?}", "prefixes", http.prefixes);
    println!("{:<20} {}", "timeout_secs", http.timeout_secs);
    println!();

    let socket = &cfg.socket;
    println!("[socket]");
    println!("{:<20} {}", "url", socket.url);
    println!("{:<20} {}", "path", socket.path);
    println!("{:<20} {}", "device_id", if socket.device_id.is_empty() { "-" } else { socket.device_id.as_str() });
    println!("{:<20} {}", "name", socket.name.as_deref().unwrap_or("-"));
    println!("{:<20} {}", "ack_timeout_secs", socket.ack_timeout_secs);
    println!();

    match &cfg.key_file {
        Some(path) => println!("{:<20} {}", "key_file", path.display()),
        None => println!("{:<20} {} (or default locations)", "key_file", keys::KEY_FILE_ENV),
    }

    Ok(())
}
