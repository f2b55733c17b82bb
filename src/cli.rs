use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "vesta", version, about = "Onboarding and referral reward daemon")]
pub struct Cli {
  #[command(subcommand)]
  pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Write a default config file
  Init {
    #[arg(long, default_value = "/etc/vesta/config.json")]
    config: String,
  },
  /// Run the daemon
  Run {
    #[arg(long, default_value = "/etc/vesta/config.json")]
    config: String,
  },
}
