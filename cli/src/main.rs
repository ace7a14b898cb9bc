use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use ykpcsc::pcsc::PcscSession;
use ykpcsc::{CardId, Config, ContextId, Layer, PcscLayer, ResourceManager, Status, READER_NAME};

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Error occurred on opening the reader: {0}")]
    Pcsc(#[from] ykpcsc::pcsc::Error),

    #[error("The layer returned an error: {0}")]
    Status(Status),

    #[error("The command is not a valid hex string: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Failed to serialise the output: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Status(status)
    }
}

type Result<T> = std::result::Result<T, Error>;

type Manager = ResourceManager<PcscLayer<PcscSession>>;

#[derive(Parser)]
#[command(name = "ykpcsc")]
#[command(about = "Inspect a YubiKey through the PC/SC layer")]
#[command(version)]
struct Args {
    /// Name of the PC/SC reader to use. Defaults to the first one.
    #[arg(short, long)]
    reader: Option<String>,

    /// Print the output as JSON.
    #[arg(long)]
    json: bool,

    /// Seconds to wait for the key to answer a command; 0 waits forever.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the readers exposed by the layer.
    Readers,

    /// Connect to the key and print its status.
    Status,

    /// Print the serial number of the key.
    Serial,

    /// Print the ATR reported by the layer.
    Atr,

    /// Send command APDUs, given as hex strings, and print the responses.
    Transmit {
        #[arg(required = true)]
        apdus: Vec<String>,
    },
}

fn output<T, F>(json: bool, value: &T, text: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match json {
        true => println!("{}", serde_json::to_string_pretty(value)?),
        _ => println!("{}", text(value)),
    }

    Ok(())
}

/// Connects a card in the context, runs `f`, then disconnects whatever `f` returned.
fn with_card<T, F>(manager: &Manager, context: ContextId, f: F) -> Result<T>
where
    F: FnOnce(CardId) -> Result<T>,
{
    let (card, _) = manager.connect(context, READER_NAME)?;
    debug!("Connected card {}", card);

    let result = f(card);

    match manager.disconnect(card) {
        Status::Success => result,
        status => result.and(Err(status.into())),
    }
}

fn run(manager: &Manager, context: ContextId, args: &Args) -> Result<()> {
    match &args.command {
        Commands::Readers => {
            let readers = manager.list_readers(context)?;
            output(args.json, &readers, |r| r.join("\n"))
        }
        Commands::Status => {
            let status = with_card(manager, context, |card| Ok(manager.status(card)?))?;
            output(args.json, &status, |s| {
                format!(
                    "Reader: {}\nState: {:?}\nProtocol: {:?}\nATR: {}\nSerial: {}",
                    s.reader_name,
                    s.state,
                    s.protocol,
                    hex::encode_upper(&s.atr),
                    s.serial.as_deref().unwrap_or("unknown"),
                )
            })
        }
        Commands::Serial => {
            let serial = manager.layer().get_card_serial();
            output(args.json, &serial, |s| {
                s.clone().unwrap_or_else(|| "unknown".to_string())
            })
        }
        Commands::Atr => {
            let atr = hex::encode_upper(manager.layer().get_card_atr());
            output(args.json, &atr, |a| a.clone())
        }
        Commands::Transmit { apdus } => {
            let responses = with_card(manager, context, |card| {
                apdus
                    .iter()
                    .map(|apdu| -> Result<String> {
                        let command = hex::decode(apdu.replace(' ', ""))?;
                        let response = manager.transmit(card, &command)?;
                        Ok(hex::encode_upper(response))
                    })
                    .collect::<Result<Vec<_>>>()
            })?;
            output(args.json, &responses, |r| r.join("\n"))
        }
    }
}

fn main() -> Result<()> {
    // Set RUST_LOG=debug to see the APDUs exchanged with the key.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    let session = match &args.reader {
        Some(name) => PcscSession::with_reader(name)?,
        None => PcscSession::try_new()?,
    };
    info!("Using reader: {}", session.reader().to_string_lossy());

    let config = Config {
        transmit_timeout: match args.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
    };

    let manager = ResourceManager::new(PcscLayer::with_config(session, config));
    let context = manager.establish_context()?;

    let result = run(&manager, context, &args);
    manager.release_context(context);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transmit() {
        let args = Args::parse_from(["ykpcsc", "--json", "transmit", "00A4040007A0000005272001"]);

        assert!(args.json);
        assert_eq!(30, args.timeout);
        match args.command {
            Commands::Transmit { apdus } => assert_eq!(vec!["00A4040007A0000005272001"], apdus),
            _ => panic!("expected the transmit command"),
        }
    }

    #[test]
    fn test_transmit_requires_apdus() {
        assert!(Args::try_parse_from(["ykpcsc", "transmit"]).is_err());
    }
}
