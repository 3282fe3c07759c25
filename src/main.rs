// Bank Sync - CLI
//
// One-shot commands: register tenants, log in (with OTP), run syncs.
// Session state is kept in the database so separate invocations share it.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use uuid::Uuid;

use bank_sync::config::Settings;
use bank_sync::logging::init_tracing;
use bank_sync::{
    db, AuthOutcome, Authenticator, BankClient, Orchestrator, SharedConnection, SqliteSessionStore,
    SyncKind, TaskStatus, Tenant, TenantId,
};

/// Bank Sync - pull accounts and payment orders from the bank into SQLite
#[derive(Parser)]
#[command(name = "bank-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "BANK_SYNC_CONFIG", global = true)]
    config: Option<String>,

    /// Override the database path from the configuration
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a tenant (company)
    AddTenant {
        #[arg(long)]
        name: String,
    },

    /// List registered tenants
    Tenants,

    /// Log in to the bank for a tenant, confirming the OTP if asked
    Login {
        #[arg(long)]
        tenant: String,
        #[arg(long, env = "BANK_SYNC_LOGIN")]
        login: String,
        #[arg(long, env = "BANK_SYNC_PASSWORD", hide_env_values = true)]
        password: String,
        /// Print the confirmation session instead of prompting for the code
        #[arg(long)]
        no_prompt: bool,
    },

    /// Confirm a pending login with the OTP code
    Confirm {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        code: String,
    },

    /// Clear a tenant's bank session
    Logout {
        #[arg(long)]
        tenant: String,
        /// Also forget the stored credentials
        #[arg(long)]
        forget: bool,
    },

    /// Sync bank accounts (all tenants unless --tenant is given)
    SyncAccounts {
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Sync new transactions (all tenants unless --tenant is given)
    SyncTransactions {
        #[arg(long)]
        tenant: Option<String>,
        /// Page the whole history instead of stopping at known transactions
        #[arg(long)]
        exhaustive: bool,
    },
}

struct App {
    settings: Settings,
    db: SharedConnection,
}

impl App {
    fn open(cli: &Cli) -> Result<Self> {
        let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
        if let Some(path) = &cli.database {
            settings.storage.database_path = path.clone();
        }
        init_tracing(&settings.logging);

        let db = db::open_shared(&settings.storage.database_path)?;
        Ok(App { settings, db })
    }

    fn authenticator(&self) -> Result<Authenticator> {
        self.settings.validate().map_err(|e| anyhow!(e))?;
        let client = BankClient::new(self.settings.bank.clone())?;
        let store = Arc::new(SqliteSessionStore::new(self.db.clone()));
        Ok(Authenticator::new(store, client))
    }

    fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::new(self.authenticator()?, self.db.clone(), &self.settings))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut app = App::open(&cli)?;

    match cli.command {
        Commands::AddTenant { name } => add_tenant(&app, &name),
        Commands::Tenants => list_tenants(&app),
        Commands::Login {
            tenant,
            login,
            password,
            no_prompt,
        } => run_login(&app, &tenant, &login, &password, no_prompt).await,
        Commands::Confirm {
            tenant,
            session_id,
            code,
        } => run_confirm(&app, &tenant, &session_id, &code).await,
        Commands::Logout { tenant, forget } => run_logout(&app, &tenant, forget).await,
        Commands::SyncAccounts { tenant } => run_sync(&app, SyncKind::Accounts, tenant.as_deref()).await,
        Commands::SyncTransactions { tenant, exhaustive } => {
            if exhaustive {
                app.settings.sync.exhaustive_discovery = true;
            }
            run_sync(&app, SyncKind::Transactions, tenant.as_deref()).await
        }
    }
}

fn parse_tenant(raw: &str) -> Result<TenantId> {
    raw.parse::<TenantId>().map_err(|e| anyhow!(e))
}

fn add_tenant(app: &App, name: &str) -> Result<()> {
    let tenant = Tenant::new(name.trim());
    db::with_connection(&app.db, |conn| db::insert_tenant(conn, &tenant))?;
    println!("✓ Registered tenant {} ({})", tenant.name, tenant.id);
    Ok(())
}

fn list_tenants(app: &App) -> Result<()> {
    let tenants = db::with_connection(&app.db, db::list_tenants)?;
    if tenants.is_empty() {
        println!("No tenants registered. Run: bank-sync add-tenant --name <NAME>");
        return Ok(());
    }
    for tenant in tenants {
        let accounts = db::with_connection(&app.db, |conn| db::get_bank_accounts_by_tenant(conn, &tenant.id))?;
        println!("{}  {}  ({} accounts)", tenant.id, tenant.name, accounts.len());
        for account in accounts {
            println!("    {}  {} {}", account.masked_number(), account.balance, account.currency);
        }
    }
    Ok(())
}

async fn run_login(app: &App, tenant: &str, login: &str, password: &str, no_prompt: bool) -> Result<()> {
    let tenant = parse_tenant(tenant)?;
    let auth = app.authenticator()?;

    println!("🔐 Logging in to the bank...");
    match auth.login(&tenant, login, password).await? {
        AuthOutcome::Authenticated(_) => {
            println!("✓ Authenticated (no confirmation needed)");
            Ok(())
        }
        AuthOutcome::Rejected { reason } => bail!("login rejected: {}", reason),
        AuthOutcome::NeedsConfirmation {
            session_id,
            confirm_phone,
        } => {
            let phone = confirm_phone.unwrap_or_else(|| "your phone".to_string());
            if no_prompt {
                println!("📱 Code sent to {}. Confirm within 65 seconds:", phone);
                println!("   bank-sync confirm --tenant {} --session-id {} --code <CODE>", tenant, session_id);
                return Ok(());
            }

            print!("📱 Code sent to {}. Enter code: ", phone);
            io::stdout().flush()?;
            let mut code = String::new();
            io::stdin().lock().read_line(&mut code)?;

            auth.confirm_otp(&tenant, &session_id, &code).await?;
            println!("✓ Confirmed");
            Ok(())
        }
    }
}

async fn run_confirm(app: &App, tenant: &str, session_id: &str, code: &str) -> Result<()> {
    let tenant = parse_tenant(tenant)?;
    let session_id = Uuid::parse_str(session_id.trim()).context("Invalid session id")?;
    let auth = app.authenticator()?;

    auth.confirm_otp(&tenant, &session_id, code).await?;
    println!("✓ Confirmed");
    Ok(())
}

async fn run_logout(app: &App, tenant: &str, forget: bool) -> Result<()> {
    let tenant = parse_tenant(tenant)?;
    let auth = app.authenticator()?;
    if forget {
        auth.forget(&tenant).await?;
        println!("✓ Session and credentials removed");
    } else {
        auth.logout(&tenant).await?;
        println!("✓ Session removed (credentials kept for silent refresh)");
    }
    Ok(())
}

async fn run_sync(app: &App, kind: SyncKind, tenant: Option<&str>) -> Result<()> {
    let orchestrator = app.orchestrator()?;

    println!("🔄 Syncing {}", kind);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let handles = match tenant {
        Some(raw) => {
            let tenant = parse_tenant(raw)?;
            vec![match kind {
                SyncKind::Accounts => orchestrator.dispatch_sync_tenant_accounts(tenant),
                SyncKind::Transactions => orchestrator.dispatch_sync_tenant_transactions(tenant),
            }]
        }
        None => {
            let (summary, handles) = orchestrator.fan_out_with_handles(kind)?;
            println!("✓ Dispatched {} of {} tenants", summary.tasks_dispatched, summary.total_tenants);
            handles
        }
    };

    let mut failures = 0;
    for handle in handles {
        match handle.wait().await {
            TaskStatus::Succeeded { result } => println!("✅ {}", result),
            TaskStatus::Failed { error } => {
                failures += 1;
                println!("❌ {}", error);
            }
            other => println!("⚠️  unfinished task: {:?}", other),
        }
    }

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if failures > 0 {
        bail!("{} tenant sync(s) failed", failures);
    }
    println!("🎉 Done");
    Ok(())
}
