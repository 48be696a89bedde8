use clap::Parser;
use rsipua::{
    config::TransportConfig, dialog::DialogState, transport::TransportKind, CallHandle, Result,
    UserAgent, UserAgentConfig, UserAgentEvent,
};
use std::{net::IpAddr, path::PathBuf, time::Duration};
use tokio::{
    select,
    sync::mpsc::{unbounded_channel, UnboundedSender},
    time::sleep,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// A small SIP user agent: registers, answers or places one call.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address of record when no config file is given
    #[arg(long, default_value = "sip:sipua@127.0.0.1")]
    identity: String,

    /// UDP port when no config file is given
    #[arg(long, default_value = "5060")]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Call this URI once started
    #[arg(long)]
    call: Option<String>,

    /// Answer incoming calls instead of declining them
    #[arg(long)]
    auto_answer: bool,

    /// Hang up answered calls after this many seconds
    #[arg(long)]
    hangup_after: Option<u64>,
}

enum Command {
    Answer(CallHandle),
    HangUpLater(CallHandle),
}

fn load_config(args: &Args) -> Result<UserAgentConfig> {
    match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            UserAgentConfig::from_toml_str(&content)
        }
        None => Ok(UserAgentConfig::new(
            &args.identity,
            vec![TransportConfig::new(
                TransportKind::Udp,
                args.address,
                args.port,
            )],
        )),
    }
}

fn on_event(event: UserAgentEvent, auto_answer: bool, commands: &UnboundedSender<Command>) {
    match event {
        UserAgentEvent::IncomingCall(call) => {
            info!(id = %call.id(), from = %call.remote_uri(), "incoming call");
            if auto_answer {
                commands.send(Command::Answer(call)).ok();
            } else if let Err(e) = call.reject() {
                warn!("reject failed: {}", e);
            }
        }
        UserAgentEvent::CallState(id, state) => info!(%id, "call state {}", state),
        UserAgentEvent::MediaUpdated(id, session) => info!(%id, "media {}", session),
        UserAgentEvent::Info { id, content_type, body } => {
            info!(%id, ?content_type, len = body.len(), "INFO received")
        }
        UserAgentEvent::TransferRequested(id, target) => {
            info!(%id, %target, "transfer requested")
        }
        UserAgentEvent::Registered { server, expires } => {
            info!(%server, expires, "registered")
        }
        UserAgentEvent::RegistrationLost { server, attempts } => {
            warn!(%server, attempts, "registration lost")
        }
    }
}

async fn hang_up_later(call: CallHandle, after: Option<u64>) {
    let Some(after) = after else {
        return;
    };
    sleep(Duration::from_secs(after)).await;
    if call.state() == DialogState::Confirmed {
        if let Err(e) = call.hang_up().await {
            warn!(id = %call.id(), "hangup failed: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    let args = Args::parse();
    let config = load_config(&args)?;
    let ua = UserAgent::builder().config(config).build().await?;
    info!(contact = %ua.contact(), "user agent ready");

    let (commands, mut command_receiver) = unbounded_channel();
    let auto_answer = args.auto_answer;
    let event_commands = commands.clone();
    ua.on_event(move |event| on_event(event, auto_answer, &event_commands));

    if let Some(target) = &args.call {
        let call = ua.place_call(target)?;
        commands.send(Command::HangUpLater(call)).ok();
    }

    let hangup_after = args.hangup_after;
    let serving = ua.clone();
    let mut server = tokio::spawn(async move { serving.serve().await });
    select! {
        r = &mut server => {
            info!("user agent finished {:?}", r);
            return Ok(());
        }
        _ = async {
            while let Some(command) = command_receiver.recv().await {
                match command {
                    Command::Answer(call) => {
                        if let Err(e) = call.answer() {
                            warn!(id = %call.id(), "answer failed: {}", e);
                            continue;
                        }
                        tokio::spawn(hang_up_later(call, hangup_after));
                    }
                    Command::HangUpLater(call) => {
                        tokio::spawn(hang_up_later(call, hangup_after));
                    }
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }
    ua.shutdown().await;
    server.await.ok();
    Ok(())
}
