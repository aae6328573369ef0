//! Arkwallet CLI
//!
//! Key tools work without a wallet:
//!   arkwallet mnemonic                     → {"mnemonic": "..."}
//!   arkwallet derive --index 3             → {"index", "public_key", "secret_key"}
//!   arkwallet sign <message> --index 0     → {"signature", "public_key", "index"}
//!   arkwallet verify <message> <sig> <pk>  → {"valid": true}
//!
//! The demo runs a full regtest wallet against an in-process Ark server:
//!   arkwallet demo --data-dir /tmp/ark    → board, arkoor, Lightning, exit
//!
//! Output format:
//!   --json     Output raw JSON (default for non-tty)
//!   --pretty   Pretty-print JSON (default for tty)

use std::env;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use arkwallet::logging::init_logging;
use arkwallet::{
    derive_keypair_from_mnemonic, sign_message_with_mnemonic, Amount, Backends, LocalArkServer, MockChain, Network,
    Wallet, WalletConfig,
};
use serde_json::{json, Value};
use tracing::info;

fn main() {
    init_logging();

    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }

    if opts.version {
        println!("arkwallet {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let result = match opts.command.as_deref() {
        Some("mnemonic") => cmd_mnemonic(),
        Some("derive") => cmd_derive(&opts),
        Some("sign") => cmd_sign(&opts),
        Some("verify") => cmd_verify(&opts),
        Some("demo") => cmd_demo(&opts),
        Some(cmd) => Err(format!("Unknown command: {}", cmd)),
        None => {
            print_usage();
            return;
        }
    };

    let pretty = !opts.json && (opts.pretty || std::io::stdout().is_terminal());
    let render = |value: &Value| {
        let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
        rendered.unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    };
    match result {
        Ok(output) => println!("{}", render(&output)),
        Err(e) => {
            eprintln!("{}", render(&json!({ "error": e })));
            std::process::exit(1);
        }
    }
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    positional: Vec<String>,
    mnemonic: Option<String>,
    network: Option<String>,
    data_dir: Option<String>,
    index: Option<u32>,
    // Output options
    json: bool,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        // Load .env file if present
        if let Ok(contents) = std::fs::read_to_string(".env") {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let value = value.trim().trim_matches('"');
                    if !value.is_empty() && env::var(key.trim()).is_err() {
                        env::set_var(key.trim(), value);
                    }
                }
            }
        }

        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            let value = args.get(i + 1).cloned();
            match arg.as_str() {
                "--help" | "-h" => opts.help = true,
                "--version" | "-V" => opts.version = true,
                "--json" => opts.json = true,
                "--pretty" => opts.pretty = true,
                "--mnemonic" | "-m" if value.is_some() => {
                    opts.mnemonic = value;
                    i += 1;
                }
                "--network" | "-n" if value.is_some() => {
                    opts.network = value;
                    i += 1;
                }
                "--data-dir" | "-d" if value.is_some() => {
                    opts.data_dir = value;
                    i += 1;
                }
                "--index" | "-i" if value.is_some() => {
                    opts.index = value.and_then(|v| v.parse().ok());
                    i += 1;
                }
                _ if !arg.starts_with('-') => positional.push(arg.clone()),
                _ => {} // Ignore unknown flags
            }
            i += 1;
        }

        if !positional.is_empty() {
            opts.command = Some(positional.remove(0));
        }
        opts.positional = positional;

        // Environment variables (lower priority than CLI args)
        if opts.mnemonic.is_none() {
            opts.mnemonic = env::var("ARKWALLET_MNEMONIC").ok().filter(|s| !s.is_empty());
        }
        if opts.network.is_none() {
            opts.network = env::var("ARKWALLET_NETWORK").ok().filter(|s| !s.is_empty());
        }
        if opts.data_dir.is_none() {
            opts.data_dir = env::var("ARKWALLET_DATA_DIR").ok().filter(|s| !s.is_empty());
        }

        opts
    }

    fn network(&self) -> Result<Network, String> {
        let raw = self.network.as_deref().unwrap_or("signet");
        Network::from_str(raw).ok_or_else(|| format!("Invalid network: {}", raw))
    }

    fn mnemonic(&self) -> Result<&str, String> {
        self.mnemonic.as_deref().ok_or_else(|| "--mnemonic or ARKWALLET_MNEMONIC required".to_string())
    }

    fn arg(&self, pos: usize, name: &str) -> Result<&str, String> {
        self.positional.get(pos).map(String::as_str).ok_or_else(|| format!("Missing <{}>", name))
    }

    fn data_dir(&self) -> Result<PathBuf, String> {
        if let Some(dir) = &self.data_dir {
            return Ok(PathBuf::from(dir));
        }
        dirs::data_dir()
            .map(|d| d.join("arkwallet"))
            .ok_or_else(|| "No data directory, pass --data-dir".to_string())
    }
}

fn print_usage() {
    println!(
        r#"arkwallet - Ark wallet engine

USAGE:
    arkwallet <command> [args] [options]

COMMANDS:
    mnemonic                        Generate a 12-word mnemonic
    derive                          Derive the Ark keypair at --index
    sign <message>                  Sign a message with the key at --index
    verify <message> <sig> <pubkey> Verify a message signature
    demo                            Run a regtest wallet against an in-process server

OPTIONS:
    --mnemonic, -m <words>  BIP39 mnemonic (env: ARKWALLET_MNEMONIC)
    --network, -n <net>     Network: bitcoin|testnet|signet|regtest (env: ARKWALLET_NETWORK)
    --data-dir, -d <path>   Data directory (env: ARKWALLET_DATA_DIR)
    --index, -i <n>         Key index (default: 0)

OUTPUT OPTIONS:
    --json                  Raw JSON output
    --pretty                Pretty-print JSON
    --version, -V           Print version

EXAMPLES:
    arkwallet derive -m "abandon ... about" -n regtest --index 2
    arkwallet sign "hello" -m "abandon ... about" --json | jq .signature
    arkwallet demo --data-dir /tmp/arkwallet-demo
"#
    );
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn cmd_mnemonic() -> Result<Value, String> {
    let mnemonic = arkwallet::create_mnemonic().map_err(|e| e.to_string())?;
    Ok(json!({ "mnemonic": mnemonic }))
}

fn cmd_derive(opts: &ParsedArgs) -> Result<Value, String> {
    let keypair = derive_keypair_from_mnemonic(opts.mnemonic()?, opts.network()?, opts.index.unwrap_or(0))
        .map_err(|e| e.to_string())?;
    to_json(&keypair.peek())
}

fn cmd_sign(opts: &ParsedArgs) -> Result<Value, String> {
    let message = opts.arg(0, "message")?;
    let signature = sign_message_with_mnemonic(message, opts.mnemonic()?, opts.network()?, opts.index.unwrap_or(0))
        .map_err(|e| e.to_string())?;
    to_json(&signature)
}

fn cmd_verify(opts: &ParsedArgs) -> Result<Value, String> {
    let message = opts.arg(0, "message")?;
    let signature = opts.arg(1, "signature")?;
    let pubkey = arkwallet::keys::parse_pubkey(opts.arg(2, "pubkey")?).map_err(|e| e.to_string())?;
    Ok(json!({ "valid": arkwallet::keys::verify_message(message, signature, &pubkey) }))
}

/// Board, pay, receive and exit on a fresh regtest chain.
fn cmd_demo(opts: &ParsedArgs) -> Result<Value, String> {
    let err = |e: arkwallet::WalletError| e.to_string();
    let datadir = opts.data_dir()?.join(format!("demo-{}", chrono::Utc::now().timestamp()));

    let chain = Arc::new(MockChain::new());
    let server = Arc::new(LocalArkServer::regtest(chain.clone()).map_err(|e| e.to_string())?);
    let backends = Backends::new(server.clone(), chain.clone());
    let config = WalletConfig::regtest().with_server("local").with_fallback_fee_rate(2);
    let wallet = match opts.mnemonic.as_deref() {
        Some(words) => Wallet::create(&datadir, words, config, backends).map_err(err)?,
        None => Wallet::create_new(&datadir, config, backends).map_err(err)?.0,
    };
    info!(datadir = %datadir.display(), "Demo wallet created");

    let address = wallet.onchain_address().map_err(err)?;
    chain.fund(address.script_pubkey(), Amount::from_sat(1_000_000)).map_err(|e| e.to_string())?;
    chain.mine(1).map_err(|e| e.to_string())?;
    wallet.onchain_sync().map_err(err)?;

    let board = wallet.board_amount(Amount::from_sat(300_000)).map_err(err)?;
    chain.mine(1).map_err(|e| e.to_string())?;
    wallet.sync().map_err(err)?;

    let remote = server.create_remote_invoice(50_000_000, "demo").map_err(|e| e.to_string())?;
    let sent = wallet.pay_lightning_invoice(&remote, None).map_err(err)?;

    let receive = wallet.bolt11_invoice(20_000_000).map_err(err)?;
    server.simulate_payment(&receive.invoice).map_err(|e| e.to_string())?;
    let received = wallet.check_and_claim_ln_receive(receive.payment_hash, true).map_err(err)?;

    let refreshed = wallet.refresh_vtxos(arkwallet::RefreshMode::All).map_err(err)?;
    chain.mine(1).map_err(|e| e.to_string())?;
    wallet.sync().map_err(err)?;

    Ok(json!({
        "datadir": datadir.display().to_string(),
        "board": to_json(&board)?,
        "lightning_send": to_json(&sent)?,
        "lightning_receive": to_json(&received)?,
        "refresh": to_json(&refreshed)?,
        "balance": to_json(&wallet.balance().map_err(err)?)?,
        "movements": wallet.movements().map_err(err)?.len(),
    }))
}
