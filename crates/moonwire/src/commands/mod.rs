//! Command dispatch: bridges CLI args -> client calls -> output formatting.

pub mod config_cmd;
pub mod console;
pub mod gcode;
pub mod history;
pub mod info;
pub mod watch;

use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use url::Url;

use moonwire_api::{ClientConfig, ConnectionState, MoonrakerClient, MoonrakerEventKind};

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;
use crate::output;

/// Open a session and wait until it is usable.
pub async fn connect(url: &Url, config: ClientConfig) -> Result<MoonrakerClient, CliError> {
    let client = MoonrakerClient::new(config);
    client.connect(url.as_str(), || {}, || {})?;

    // `connect` enters Connecting synchronously; wait for it to resolve.
    let mut state = client.subscribe_state();
    let reached = state
        .wait_for(|s| *s != ConnectionState::Connecting)
        .await
        .map(|s| *s);

    match reached {
        Ok(ConnectionState::Connected) => Ok(client),
        _ => Err(CliError::ConnectionFailed {
            url: url.to_string(),
        }),
    }
}

/// Dispatch a printer-bound command to the appropriate handler.
pub async fn dispatch(
    cmd: Command,
    client: &MoonrakerClient,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match cmd {
        Command::Info => info::handle(client, global).await,
        Command::Gcode(args) => gcode::handle(client, args, global).await,
        Command::Console => console::handle(client, global).await,
        Command::Watch => watch::handle(client, global).await,
        Command::History(args) => history::handle(client, args, global).await,
        // Handled before a connection is opened
        Command::Config(_) => Ok(()),
    }
}

/// Report client events on stderr until Ctrl-C or the client gives up.
pub async fn run_until_interrupted(
    client: &MoonrakerClient,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let color = output::should_color(global.color);
    let mut events = client.subscribe_events();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            result = &mut interrupted => {
                result?;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if !global.quiet {
                        let line = format!("[{}] {}", event.kind, event.message);
                        eprintln!("{}", output::severity(&line, event.is_error, color));
                    }
                    if event.kind == MoonrakerEventKind::ConnectionFailed {
                        return Err(CliError::ConnectionFailed {
                            url: client.last_url().map(|u| u.to_string()).unwrap_or_default(),
                        });
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
