//! pcrm-sync: run the CRM's background sync passes from the command line.
//!
//! Usage:
//!   pcrm-sync init --user-id U --device-id D --auth-token T --refresh-token R
//!   pcrm-sync sync            # one vault push/pull cycle
//!   pcrm-sync import [--initial]
//!   pcrm-sync status
//!
//! Logging goes to stderr; set `RUST_LOG` to adjust (default `info`).

use clap::{Parser, Subcommand};

use pcrm_lib::db::VaultState;
use pcrm_lib::importers::run_google_imports;
use pcrm_lib::state::{load_config, open_db};
use pcrm_lib::vault::{generate_seed_hex, CancelFlag, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "pcrm-sync")]
#[command(about = "Encrypted vault sync and provider imports for the personal CRM")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register this device with the vault
    Init {
        #[arg(long, env = "PCRM_USER_ID")]
        user_id: String,
        #[arg(long, env = "PCRM_DEVICE_ID")]
        device_id: String,
        #[arg(long, env = "PCRM_AUTH_TOKEN")]
        auth_token: String,
        #[arg(long, env = "PCRM_REFRESH_TOKEN")]
        refresh_token: String,
        /// RFC 3339 expiry of the auth token
        #[arg(long)]
        expires_at: Option<String>,
        /// Hex key seed shared by all of the user's devices. Generated when
        /// omitted.
        #[arg(long, env = "PCRM_KEY_SEED")]
        key_seed: Option<String>,
    },
    /// Run one vault sync cycle (default)
    Sync,
    /// Pull calendar, contacts and mail from the connected Google account
    Import {
        /// Ignore saved sync tokens and fetch the full window
        #[arg(long)]
        initial: bool,
    },
    /// Print vault and provider sync state as JSON
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;
    let db = open_db(&config).map_err(|e| anyhow::anyhow!(e))?;

    match args.command.unwrap_or(Command::Sync) {
        Command::Init {
            user_id,
            device_id,
            auth_token,
            refresh_token,
            expires_at,
            key_seed,
        } => {
            let generated = key_seed.is_none();
            let key_seed = key_seed.unwrap_or_else(generate_seed_hex);
            // Validates the seed before anything is stored.
            pcrm_lib::vault::VaultKey::from_hex_seed(&key_seed, &user_id)?;
            db.lock().init_vault_state(&VaultState {
                user_id,
                device_id,
                auth_token,
                auth_expires_at: expires_at,
                refresh_token,
                key_seed: key_seed.clone(),
                last_synced_seq: 0,
                last_push_at: None,
                last_pull_at: None,
                last_error: None,
            })?;
            if generated {
                println!("Generated key seed (enter it on your other devices): {key_seed}");
            }
            log::info!("Vault state initialized");
        }
        Command::Sync => {
            let engine = SyncEngine::from_config(db.clone(), &config.vault)?;
            let report = engine.run_cycle(&CancelFlag::new()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Import { initial } => {
            let results = run_google_imports(&db, &config, initial, &CancelFlag::new()).await?;
            let mut failed = 0;
            for (service, result) in results {
                match result {
                    Ok(report) => println!("{}", serde_json::to_string(&report)?),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{service}: {e} ({})", e.recovery_suggestion());
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} provider import(s) failed");
            }
        }
        Command::Status => {
            let vault = if config.vault.enabled {
                Some(SyncEngine::from_config(db.clone(), &config.vault)?.status()?)
            } else {
                None
            };
            let providers = db.lock().list_provider_sync_states()?;
            let status = serde_json::json!({
                "vault": vault,
                "providers": providers,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
