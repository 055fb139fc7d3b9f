use clap::Parser;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "stohb-road")]
#[command(about = "Stohb Road pairing broker")]
pub struct Cli {
    /// Port to listen on (overrides STOHB_ROAD_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
}

impl Cli {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_flag_overrides_config() {
        let cli = Cli::try_parse_from(["stohb-road", "--port", "9100"]).unwrap();
        assert_eq!(cli.host, "0.0.0.0");
        assert_eq!(cli.apply(Config::default()).port, 9100);

        let cli = Cli::try_parse_from(["stohb-road"]).unwrap();
        assert_eq!(cli.apply(Config::default()).port, 9000);
    }
}
