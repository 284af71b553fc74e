use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voip_demo::{ChannelSink, Settings, Softphone, UdpTransport, UserAgent};

#[derive(Parser, Debug)]
#[command(author, version, about = "Two-phone SIP calling demo", long_about = None)]
struct Args {
    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Registrar / proxy, host or host:port
    #[arg(short, long)]
    server: Option<String>,

    /// SIP username
    #[arg(short, long)]
    user: Option<String>,

    /// SIP domain of the address of record
    #[arg(short, long)]
    domain: Option<String>,

    /// SIP password
    #[arg(short, long)]
    password: Option<String>,

    /// Local UDP address to bind
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Answer incoming calls without asking
    #[arg(long)]
    auto_answer: bool,

    /// Authorization code required by `call`
    #[arg(long)]
    passcode: Option<String>,

    /// Write the merged settings back to the settings file
    #[arg(long)]
    save: bool,

    /// Log to a file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(server) = &self.server {
            settings.server = server.clone();
        }
        if let Some(user) = &self.user {
            settings.username = user.clone();
        }
        if let Some(domain) = &self.domain {
            settings.domain = domain.clone();
        }
        if let Some(password) = &self.password {
            settings.set_password(password);
        }
        if let Some(bind) = self.bind {
            settings.bind_addr = bind;
        }
        if let Some(passcode) = &self.passcode {
            settings.call_passcode = passcode.clone();
        }
        if self.auto_answer {
            settings.auto_answer = true;
        }
    }
}

const HELP: &str = "commands: call <address> [code] | answer | decline | hangup | register | unregister | status | quit";

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env().add_directive(format!("voip_demo={}", log_level).parse()?);
    let _guard = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::never(dir, "voip-demo.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_env_filter(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
            None
        }
    };

    let path = match &args.config {
        Some(path) => path.clone(),
        None => Settings::default_path()?,
    };
    let mut settings = Settings::load(&path).with_context(|| format!("loading {}", path.display()))?;
    args.apply(&mut settings);
    if args.save {
        settings.save(&path)?;
    }

    let config = settings.agent_config().await?;
    let transport = Arc::new(UdpTransport::bind(settings.bind_addr).await?);
    let (sink, mut events) = ChannelSink::new(settings.auto_answer);
    info!(aor = %config.identity.aor(), registrar = %config.registrar, "starting user agent");

    let incoming = transport.incoming();
    let agent = UserAgent::new(config, transport, Arc::new(sink));
    let phone = Softphone::spawn(agent, incoming);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to serialize event"),
            }
        }
    });

    phone.register().await;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        let result = match words.as_slice() {
            [] => continue,
            ["call", address, rest @ ..] => match settings.authorize_call(rest.first().copied()) {
                Ok(()) => phone.originate(address).await,
                Err(e) => Err(e),
            },
            ["call"] => {
                println!("usage: call <address> [code]");
                continue;
            }
            ["answer", ..] => phone.accept_incoming().await,
            ["decline", ..] => phone.decline_incoming().await,
            ["hangup", ..] => phone.end_call().await,
            ["register", ..] => {
                phone.register().await;
                Ok(())
            }
            ["unregister", ..] => {
                phone.unregister().await;
                Ok(())
            }
            ["status", ..] => {
                println!(
                    "registration: {:?}, call: {:?}",
                    phone.registration_state().await,
                    phone.call_state().await
                );
                Ok(())
            }
            ["quit" | "exit", ..] => break,
            [other, ..] => {
                println!("unknown command {:?}; {}", other, HELP);
                continue;
            }
        };
        if let Err(e) = result {
            println!("error: {}", e);
        }
    }

    phone.shutdown().await;
    // the sink goes away with the agent, which ends the printer
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("event printer did not finish");
    }
    Ok(())
}
