//! Command execution.

use crate::Commands;
use colored::Colorize;
use flapwire_client::tls::PinnedCertificates;
use flapwire_client::{Client, Config, TrustProvider};
use flapwire_protocol::DirectoryListing;
use flapwire_rendezvous::{build_listing, RendezvousBridge, SessionEvent, SessionHandle, State};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) {
        if self.json {
            match serde_json::to_string(value) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("{}: {}", "Error".red(), e),
            }
        } else {
            println!("{}", text());
        }
    }
}

pub struct Login {
    pub screen_name: String,
    pub password: String,
    pub pin_cert: Option<PathBuf>,
}

pub fn print_config(config: &Config) -> CliResult {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

pub fn encode_listing(dir: &Path, out: &Path, output: Output) -> CliResult {
    let listing = build_listing(dir)?;
    let bytes = listing.encode()?;
    std::fs::write(out, &bytes)?;
    output.emit(&listing, || {
        format!(
            "{} {} entries ({} bytes) to {}",
            "Wrote".green(),
            listing.entries.len(),
            bytes.len(),
            out.display()
        )
    });
    Ok(())
}

pub fn decode_listing(file: &Path, output: Output) -> CliResult {
    let data = std::fs::read(file)?;
    let listing = DirectoryListing::parse(&data)?;
    output.emit(&listing, || {
        let mut lines = Vec::with_capacity(listing.entries.len() + 1);
        for entry in &listing.entries {
            let modified = entry
                .modified_at()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());
            let name = if entry.is_directory() {
                format!("{}/", entry.name).blue().to_string()
            } else {
                entry.name.clone()
            };
            lines.push(format!("{:>10}  {}  {}", entry.size, modified.dimmed(), name));
        }
        lines.push(format!("{} bytes total", listing.total_size()).bold().to_string());
        lines.join("\n")
    });
    Ok(())
}

pub async fn execute(config: Config, login: Login, command: Commands, output: Output) -> CliResult {
    let trust = match &login.pin_cert {
        Some(path) => Some(Arc::new(PinnedCertificates::from_pem(path)?) as Arc<dyn TrustProvider>),
        None => None,
    };
    let client = Arc::new(Client::sign_on(config, &login.screen_name, &login.password, trust).await?);
    tracing::info!("Signed on as {}", client.screen_name());

    let result = match command {
        Commands::SignOn => {
            let negotiated = client.bos().negotiated();
            output.emit(negotiated, || {
                let families: Vec<String> = negotiated
                    .versions
                    .iter()
                    .map(|v| format!("{:#06x} v{}", v.family, v.version))
                    .collect();
                let mut lines = vec![
                    format!("{} as {}", "Signed on".green(), client.screen_name().cyan()),
                    format!("Families: {}", families.join(", ")),
                ];
                for class in &negotiated.rate_info.classes {
                    lines.push(format!(
                        "Rate class {}: window {} clear {}ms alert {}ms limited {}ms",
                        class.class_id, class.window_size, class.clear_avg, class.alert_avg, class.limited_avg
                    ));
                }
                lines.join("\n")
            });
            Ok(())
        }
        Commands::SendFile {
            buddy,
            path,
            folder_name,
        } => {
            let (bridge, _offers) = RendezvousBridge::attach(client.clone());
            let session = bridge.send_files(&buddy, &path, folder_name.as_deref()).await?;
            follow(session, output).await
        }
        Commands::Receive { dest, from } => {
            let (bridge, mut offers) = RendezvousBridge::attach(client.clone());
            eprintln!("Waiting for file offers (Ctrl+C to stop)");
            loop {
                let offer = tokio::select! {
                    offer = offers.recv() => match offer {
                        Some(offer) => offer,
                        None => break Ok(()),
                    },
                    _ = client.closed() => break Err("connection closed".into()),
                    _ = tokio::signal::ctrl_c() => break Ok(()),
                };
                if from.as_deref().is_some_and(|f| !f.eq_ignore_ascii_case(&offer.sender)) {
                    bridge.decline(&offer)?;
                    continue;
                }
                let name = offer.file_info().map(|f| f.filename).unwrap_or_default();
                eprintln!("{} {} from {}", "Accepting".green(), name, offer.sender.cyan());
                let session = bridge.accept(offer, dest.clone()).await?;
                if let Err(e) = follow(session, output).await {
                    eprintln!("{}: {}", "Transfer failed".red(), e);
                }
            }
        }
        Commands::Listing { .. } | Commands::Config => Ok(()),
    };

    client.sign_off();
    result
}

/// Prints session events until the session ends. Ctrl+C cancels it.
async fn follow(mut session: SessionHandle, output: Output) -> CliResult {
    loop {
        tokio::select! {
            event = session.next_event() => match event {
                Some(event) => print_event(&event, output),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => session.cancel(),
        }
    }
    match session.wait().await {
        State::Completed => Ok(()),
        State::Cancelled => Err("transfer cancelled".into()),
        State::Failed(reason) => Err(reason.to_string().into()),
        other => Err(format!("session ended in state {}", other.name()).into()),
    }
}

fn print_event(event: &SessionEvent, output: Output) {
    output.emit(event, || match event {
        SessionEvent::Progress(p) => {
            let percent = if p.total == 0 { 100 } else { p.bytes * 100 / p.total };
            format!("{:>3}% {} ({}/{})", percent, p.file, p.file_bytes, p.file_size)
        }
        SessionEvent::Rendezvous(event) => format!("{}", format!("{:?}", event).yellow()),
    });
}
