//! DLC BTC CLI: inspect vaults and talk to the chain and attestors.
//!
//! # Usage
//!
//! ```bash
//! dlc-btc --config dlc-btc.toml fee-rate
//! dlc-btc --config dlc-btc.toml address <uuid> <taproot-pubkey>
//! dlc-btc --config dlc-btc.toml proof-of-reserve vaults.json
//! dlc-btc --config dlc-btc.toml --validate
//! ```

mod config;

use anyhow::{Context, Result};
use bitcoin::psbt::Psbt;
use dlc_btc_attestor::{AttestorClient, WithdrawPsbtEvent};
use dlc_btc_esplora::EsploraClient;
use dlc_btc_vault::keys::parse_x_only_key;
use dlc_btc_vault::payment::multisig_payment_for_vault;
use dlc_btc_vault::signer::PrivateKeySigner;
use dlc_btc_vault::utxo::{get_balance, resolve_fee_rate};
use dlc_btc_vault::{total_verified_reserve, RawVault, VaultSigner, VaultUuid};
use std::path::PathBuf;
use std::str::FromStr;

fn main() -> Result<()> {
    // Parse CLI args (minimal, no clap dependency needed)
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("dlc-btc.toml");
    let mut validate_only = false;
    let mut command: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("dlc-btc {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other if other.starts_with('-') => {
                anyhow::bail!("Unknown argument: {}", other);
            }
            other => command.push(other.to_string()),
        }
        i += 1;
    }

    // Load config
    let mut cli_config = config::CliConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply env overrides
    cli_config.apply_env_overrides();

    // Validate
    cli_config
        .validate()
        .context("Configuration validation failed")?;

    // Init logger
    std::env::set_var("RUST_LOG", &cli_config.cli.log_level);
    env_logger::init();

    if validate_only {
        let esplora = cli_config.esplora_config();
        println!("✅ Configuration is valid.");
        println!("  Network:        {}", cli_config.network());
        println!("  Esplora:        {}", esplora.api_url);
        println!("  Fee API:        {}", esplora.fee_api_url);
        println!("  Fee multiplier: {}", cli_config.bitcoin.fee_rate_multiplier);
        println!("  Attestor key:   {}", cli_config.vault.attestor_group_key);
        println!("  Funding type:   {}", cli_config.vault.funding_type);
        println!("  Attestors:      {}", cli_config.attestors.urls.len());
        return Ok(());
    }

    let Some((name, rest)) = command.split_first() else {
        print_help();
        anyhow::bail!("No command given");
    };

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(run_command(&cli_config, name, rest))
}

fn expect_args<'a>(name: &str, rest: &'a [String], usage: &str, count: usize) -> Result<&'a [String]> {
    anyhow::ensure!(rest.len() == count, "usage: dlc-btc {} {}", name, usage);
    Ok(rest)
}

fn esplora_client(cli_config: &config::CliConfig) -> Result<EsploraClient> {
    EsploraClient::new(cli_config.esplora_config(), cli_config.network())
        .context("Failed to create Esplora client")
}

async fn run_command(cli_config: &config::CliConfig, name: &str, rest: &[String]) -> Result<()> {
    let network = cli_config.network();

    match name {
        "fee-rate" => {
            expect_args(name, rest, "", 0)?;
            let client = esplora_client(cli_config)?;
            let rate = resolve_fee_rate(&client, Some(cli_config.bitcoin.fee_rate_multiplier))
                .await
                .context("Failed to resolve fee rate")?;
            println!("{} sat/vB", rate);
        }
        "address" => {
            let args = expect_args(name, rest, "<uuid> <taproot-pubkey>", 2)?;
            let uuid = VaultUuid::from_str(&args[0]).context("Invalid vault uuid")?;
            let user_key = parse_x_only_key(&args[1]).context("Invalid taproot public key")?;
            let multisig =
                multisig_payment_for_vault(&uuid, &cli_config.attestor_group_key()?, &user_key, network)
                    .context("Failed to build multisig payment")?;
            println!("{}", multisig.address);
        }
        "session" => {
            let args = expect_args(name, rest, "<uuid>", 1)?;
            let uuid = VaultUuid::from_str(&args[0]).context("Invalid vault uuid")?;
            let mnemonic = std::env::var("DLC_BTC_MNEMONIC")
                .context("DLC_BTC_MNEMONIC must hold the wallet mnemonic")?;
            let passphrase = std::env::var("DLC_BTC_PASSPHRASE").unwrap_or_default();

            let signer = VaultSigner::PrivateKey(
                PrivateKeySigner::from_mnemonic(
                    &mnemonic,
                    &passphrase,
                    network,
                    cli_config.funding_type()?,
                    cli_config.vault.account_index,
                    cli_config.vault.address_index,
                )
                .context("Failed to load wallet")?,
            );
            let session = signer
                .create_payment_information(&uuid, &cli_config.attestor_group_key()?)
                .await
                .context("Failed to derive vault payments")?;

            let client = esplora_client(cli_config)?;
            let balance = get_balance(&client, &session.payment.funding_payment.address)
                .await
                .context("Failed to fetch funding balance")?;

            println!("Vault:            {}", session.uuid);
            println!("Taproot key:      {}", session.user_multisig_key());
            println!(
                "Funding address:  {} ({})",
                session.payment.funding_payment.address, session.keys.funding_type
            );
            println!("Funding balance:  {} sat", balance.to_sat());
            println!("Multisig address: {}", session.payment.multisig_payment.address);
        }
        "proof-of-reserve" => {
            let args = expect_args(name, rest, "<vaults.json>", 1)?;
            let contents = std::fs::read_to_string(&args[0])
                .with_context(|| format!("Failed to read {}", args[0]))?;
            let vaults: Vec<RawVault> =
                serde_json::from_str(&contents).context("Failed to parse vault snapshots")?;

            let client = esplora_client(cli_config)?;
            let total = total_verified_reserve(&client, &vaults, &cli_config.attestor_group_key()?)
                .await
                .context("Proof of reserve failed")?;
            println!("{} sat verified across {} vaults", total.to_sat(), vaults.len());
        }
        "submit-withdraw" => {
            let args = expect_args(name, rest, "<uuid> <psbt-hex>", 2)?;
            let uuid = VaultUuid::from_str(&args[0]).context("Invalid vault uuid")?;
            let bytes = hex::decode(args[1].trim()).context("PSBT is not hex")?;
            Psbt::deserialize(&bytes).context("Not a valid PSBT")?;

            let client = AttestorClient::new(cli_config.attestor_config())
                .context("Failed to create attestor client")?;
            let report = client
                .submit_withdraw_psbt(&WithdrawPsbtEvent::new(uuid.to_string(), &bytes))
                .await
                .context("Withdrawal submission failed")?;
            println!(
                "Accepted by {} of {} attestors",
                report.accepted.len(),
                report.accepted.len() + report.rejected.len()
            );
        }
        other => {
            print_help();
            anyhow::bail!("Unknown command: {}", other);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"dlc-btc: DLC BTC vault tools

USAGE:
    dlc-btc [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    fee-rate                           Resolve the current fee rate
    address <uuid> <taproot-pubkey>    Multisig address of a vault
    session <uuid>                     Wallet addresses and balance for a vault
    proof-of-reserve <vaults.json>     Verify vault snapshots against the chain
    submit-withdraw <uuid> <psbt-hex>  Forward a signed withdrawal PSBT to the attestors

OPTIONS:
    -c, --config <PATH>   Config file path (default: dlc-btc.toml)
    --validate            Validate config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    DLC_BTC_NETWORK               Bitcoin network (bitcoin/testnet/signet/regtest)
    DLC_BTC_ESPLORA_URL           Esplora API root
    DLC_BTC_FEE_API_URL           mempool.space host for fee endpoints
    DLC_BTC_FEE_RATE_MULTIPLIER   Fee-rate multiplier
    DLC_BTC_ATTESTOR_GROUP_KEY    Attestor group public key
    DLC_BTC_ATTESTOR_URLS         Comma-separated attestor URLs
    DLC_BTC_LOG_LEVEL             Log level (error/warn/info/debug/trace)
    DLC_BTC_MNEMONIC              Wallet mnemonic for `session`
    DLC_BTC_PASSPHRASE            Optional BIP-39 passphrase
"#
    );
}
