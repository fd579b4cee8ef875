use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod auth;
mod cli;
mod error;
mod http;
mod monitor;
mod notify;
mod provider;
mod storage;

use storage::AccountMode;

#[derive(Parser)]
#[command(
    name = "throttlewatch",
    version,
    about = "Watches SCP VPS instances for traffic throttling"
)]
struct Cli {
    /// Directory holding config.toml and credentials.json
    #[arg(long, global = true, env = "THROTTLEWATCH_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one check over all enabled accounts and send the summary
    Check,

    /// Run checks periodically until interrupted
    Watch {
        /// Minutes between checks
        #[arg(long, default_value = "30")]
        interval_minutes: u64,
    },

    /// List configured accounts
    Accounts,

    /// Add an account
    Add {
        /// Display name, unique among accounts
        #[arg(short, long)]
        name: String,
        /// API used for this account
        #[arg(long, value_enum, default_value = "rest")]
        mode: ModeArg,
        /// SCP customer number (SOAP accounts)
        #[arg(long)]
        username: Option<String>,
        /// SCP API password (SOAP accounts)
        #[arg(long)]
        secret: Option<String>,
        /// Add the account without checking it
        #[arg(long)]
        disabled: bool,
    },

    /// Delete an account and its credentials
    Remove {
        /// Account id or name
        account: String,
    },

    /// Include an account in checks
    Enable {
        /// Account id or name
        account: String,
    },

    /// Exclude an account from checks
    Disable {
        /// Account id or name
        account: String,
    },

    /// Credentials: OAuth device authorization (REST) and SOAP logins
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },

    /// Token and login overview per account
    Status,

    /// Send a test message through the configured notifier
    NotifyTest,
}

#[derive(Subcommand)]
enum AuthAction {
    /// Request a device code and print the verification link
    Start(TargetArgs),
    /// Poll the pending authorization once
    Poll(TargetArgs),
    /// Start an authorization and poll until it completes
    Login(TargetArgs),
    /// Revoke stored tokens and clear them locally
    Revoke(TargetArgs),
    /// Store the SOAP login used by legacy_soap accounts
    SetLogin {
        #[command(flatten)]
        target: TargetArgs,
        /// SCP customer number
        #[arg(long)]
        username: String,
        /// SCP API password
        #[arg(long)]
        secret: String,
    },
}

/// Which credential slot the command acts on.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Use the top-level slot shared by the implicit default account
    #[arg(long)]
    global: bool,
    /// Use the slot of this account (id or name)
    #[arg(long)]
    account: Option<String>,
}

impl TargetArgs {
    /// `None` selects the global slot.
    fn account(&self) -> Option<&str> {
        if self.global {
            None
        } else {
            self.account.as_deref()
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Rest,
    Soap,
}

impl From<ModeArg> for AccountMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Rest => AccountMode::Rest,
            ModeArg::Soap => AccountMode::LegacySoap,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let dir = cli.config_dir;

    let result = match cli.command {
        Commands::Check => cli::commands::cmd_check(dir),
        Commands::Watch { interval_minutes } => cli::commands::cmd_watch(dir, interval_minutes),
        Commands::Accounts => cli::commands::cmd_accounts(dir),
        Commands::Add {
            name,
            mode,
            username,
            secret,
            disabled,
        } => cli::commands::cmd_add(
            dir,
            storage::AccountDraft {
                name,
                mode: Some(mode.into()),
                enabled: Some(!disabled),
                username,
                secret,
            },
        ),
        Commands::Remove { account } => cli::commands::cmd_remove(dir, &account),
        Commands::Enable { account } => cli::commands::cmd_set_enabled(dir, &account, true),
        Commands::Disable { account } => cli::commands::cmd_set_enabled(dir, &account, false),
        Commands::Auth { action } => match action {
            AuthAction::Start(t) => cli::commands::cmd_auth_start(dir, t.account()),
            AuthAction::Poll(t) => cli::commands::cmd_auth_poll(dir, t.account()),
            AuthAction::Login(t) => cli::commands::cmd_auth_login(dir, t.account()),
            AuthAction::Revoke(t) => cli::commands::cmd_auth_revoke(dir, t.account()),
            AuthAction::SetLogin {
                target,
                username,
                secret,
            } => cli::commands::cmd_auth_set_login(dir, target.account(), username, secret),
        },
        Commands::Status => cli::commands::cmd_status(dir),
        Commands::NotifyTest => cli::commands::cmd_notify_test(dir),
    };

    if let Err(e) = result {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
