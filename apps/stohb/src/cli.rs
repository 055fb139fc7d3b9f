use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DEFAULT_SIGNALING_URL;
use crate::protocol::CellRef;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "stohb",
    about = "📷 Pair a phone with a photo sheet and send pictures straight into its cells",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "STOHB_SIGNALING_URL",
        default_value = DEFAULT_SIGNALING_URL,
        help = "Base URL for the stohb-road pairing broker"
    )]
    pub signaling_url: String,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "STOHB_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Least severe level that gets logged"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "STOHB_LOG_FILE",
        help = "Append logs to this file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig::new(self.level, self.file.clone()).with_env_overrides()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the sheet: print a pairing code and collect photos from devices
    Provide(ProvideArgs),
    /// Pair with a sheet by its code and send photos into the assigned cell
    Receive(ReceiveArgs),
}

#[derive(Args, Debug, Default)]
pub struct ProvideArgs {
    #[arg(
        long,
        value_name = "ROW,COL",
        value_parser = parse_cell,
        help = "Cell handed to devices that greet us (column 0 holds photos)"
    )]
    pub select: Option<CellRef>,

    #[arg(
        long,
        value_name = "CODE",
        help = "Register under this code instead of a generated one"
    )]
    pub code: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct ReceiveArgs {
    #[arg(long, value_name = "CODE", help = "Pairing code shown by the provider")]
    pub code: String,

    #[arg(
        long = "image",
        value_name = "PATH",
        help = "Image to send; repeat for several (a cell holds at most four)"
    )]
    pub images: Vec<PathBuf>,

    #[arg(
        long = "wait-secs",
        value_name = "SECS",
        default_value_t = 30,
        help = "How long to wait for the provider to assign a cell"
    )]
    pub wait_secs: u64,
}

fn parse_cell(raw: &str) -> Result<CellRef, String> {
    let (row, col) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected ROW,COL, got {raw:?}"))?;
    let row = row
        .trim()
        .parse()
        .map_err(|err| format!("invalid row {row:?}: {err}"))?;
    let col = col
        .trim()
        .parse()
        .map_err(|err| format!("invalid column {col:?}: {err}"))?;
    Ok(CellRef::new(row, col))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provide_with_selection() {
        let cli = Cli::try_parse_from(["stohb", "--log-level", "debug", "provide", "--select", "3, 0"])
            .unwrap();
        assert_eq!(cli.logging.level, LogLevel::Debug);
        match cli.command {
            Command::Provide(args) => assert_eq!(args.select, Some(CellRef::new(3, 0))),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_receive_with_images() {
        let cli = Cli::try_parse_from([
            "stohb",
            "receive",
            "--code",
            "7F3K2Q",
            "--image",
            "a.jpg",
            "--image",
            "b.png",
            "--signaling-url",
            "ws://127.0.0.1:9100",
        ])
        .unwrap();
        assert_eq!(cli.signaling_url, "ws://127.0.0.1:9100");
        match cli.command {
            Command::Receive(args) => {
                assert_eq!(args.code, "7F3K2Q");
                assert_eq!(args.images.len(), 2);
                assert_eq!(args.wait_secs, 30);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_cells() {
        assert!(parse_cell("3").is_err());
        assert!(parse_cell("a,0").is_err());
        assert_eq!(parse_cell("0,1"), Ok(CellRef::new(0, 1)));
    }
}
