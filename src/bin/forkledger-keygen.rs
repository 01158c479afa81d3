#![forbid(unsafe_code)]
//! Generates a node key pair and the matching participant entry.

use clap::Parser;
use forkledger::config::ParticipantConfig;
use forkledger::crypto::KeyPair;
use serde::Serialize;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Participant name the key belongs to
    name: String,
    /// Address other nodes use to reach this one
    #[arg(long, default_value = "127.0.0.1")]
    address: String,
    #[arg(long, default_value_t = 9000)]
    port: u16,
}

#[derive(Serialize)]
struct ParticipantsSection {
    participants: Vec<ParticipantConfig>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let keypair = KeyPair::generate();

    println!("# Keep this in the [node] section of {}'s configuration only", cli.name);
    println!("secret_key = \"{}\"", keypair.secret_hex());
    println!();

    let section = ParticipantsSection {
        participants: vec![ParticipantConfig::from_keypair(cli.name, &keypair, cli.address, cli.port)],
    };
    print!("{}", toml::to_string(&section)?);
    Ok(())
}
