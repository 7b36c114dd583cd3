use clap::{Parser, Subcommand};
use fedirelay::{
    activity::Message,
    cache::EVICT_AFTER_HOURS,
    config::RelayConfig,
    logger,
    routes::build_routes,
    Context, Result,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info, warn, Level};

#[derive(Debug, Parser)]
#[command(name = "fedirelay", version, about = "A small ActivityPub relay")]
struct Cli {
    /// Path to the relay's config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay (the default)
    Run,
    /// Write a config file with the given domain
    Setup {
        /// Public domain the relay will be hosted on
        domain: String,
    },
    /// Manage runtime configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage subscribed instances
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },
    /// Manage banned domains
    Ban {
        #[command(subcommand)]
        command: BanCommand,
    },
    /// Manage banned software
    SoftwareBan {
        #[command(subcommand)]
        command: BanCommand,
    },
    /// Manage the domain whitelist
    Whitelist {
        #[command(subcommand)]
        command: WhitelistCommand,
    },
    /// Manage pending follow requests
    Request {
        #[command(subcommand)]
        command: RequestCommand,
    },
    /// Manage admin users
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// List all configuration values
    List,
    /// Set a configuration value
    Set { key: String, value: String },
}

#[derive(Debug, Subcommand)]
enum InstanceCommand {
    /// List subscribed instances
    List,
    /// Remove an instance by domain, actor or inbox URL
    Remove { value: String },
}

#[derive(Debug, Subcommand)]
enum BanCommand {
    List,
    Add {
        name: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        note: Option<String>,
    },
    Remove {
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum WhitelistCommand {
    List,
    Add { domain: String },
    Remove { domain: String },
}

#[derive(Debug, Subcommand)]
enum RequestCommand {
    /// List pending follow requests
    List,
    /// Accept a pending follow request
    Accept { domain: String },
    /// Deny a pending follow request
    Deny { domain: String },
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    List,
    Create {
        username: String,
        password: String,
        #[arg(long)]
        handle: Option<String>,
    },
    Delete {
        username: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log = match logger::init(Level::INFO) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("unable to initialise logging: {e}");
            std::process::exit(1);
        }
    };

    let path = RelayConfig::resolve_path(cli.config.clone());

    if let Err(e) = run(cli, path, log).await {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, path: PathBuf, log: logger::LogHandle) -> Result<()> {
    if let Some(Command::Setup { domain }) = &cli.command {
        let mut config = RelayConfig::load_or_write_default(&path)?;
        config.domain = domain.clone();
        std::fs::write(&path, serde_yaml::to_string(&config)?)?;
        println!("config written to {}", path.display());

        return Ok(());
    }

    let config = RelayConfig::load_or_write_default(&path)?;
    let ctx = Context::boot(config, log)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => serve(ctx).await,
        Command::Setup { .. } => unreachable!("handled above"),
        Command::Config { command } => config_command(&ctx, command),
        Command::Instance { command } => instance_command(&ctx, command),
        Command::Ban { command } => ban_command(&ctx, command),
        Command::SoftwareBan { command } => software_ban_command(&ctx, command),
        Command::Whitelist { command } => whitelist_command(&ctx, command),
        Command::Request { command } => request_command(&ctx, command).await,
        Command::User { command } => user_command(&ctx, command),
    }
}

async fn serve(ctx: Arc<Context>) -> Result<()> {
    if ctx.config.is_placeholder() {
        warn!("the relay is not set up; run `fedirelay setup <domain>` first");
        return Ok(());
    }

    // periodic cache eviction
    let cache = Arc::clone(&ctx.cache);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));

        loop {
            interval.tick().await;

            match cache.delete_old(EVICT_AFTER_HOURS) {
                Ok(0) => (),
                Ok(n) => info!(removed = n, "evicted stale cache entries"),
                Err(e) => warn!(error = %e, "cache eviction failed"),
            }
        }
    });

    let addr = SocketAddr::from((ctx.config.listen, ctx.config.port));
    info!(domain = %ctx.config.domain, %addr, "starting relay");

    let app = build_routes(Arc::clone(&ctx));

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .map_err(|e| fedirelay::Error::key(format!("server error: {e}")))?;

    // drain in-flight deliveries before exiting
    ctx.shutdown().await;

    Ok(())
}

fn config_command(ctx: &Context, command: ConfigCommand) -> Result<()> {
    let mut session = ctx.store.session();

    match command {
        ConfigCommand::List => {
            for (key, _, _) in fedirelay::store::config::CONFIG_DEFAULTS.iter().copied() {
                if key == "private-key" {
                    continue;
                }

                println!("{key}: {}", session.get_config(key)?);
            }
        }

        ConfigCommand::Set { key, value } => {
            let stored = session.put_config(&key, &value)?;
            println!("{key}: {stored}");
        }
    }

    Ok(())
}

fn instance_command(ctx: &Context, command: InstanceCommand) -> Result<()> {
    let mut session = ctx.store.session();

    match command {
        InstanceCommand::List => {
            for instance in session.get_inboxes()? {
                println!(
                    "{}\t{}\t{}",
                    instance.domain,
                    instance.software.as_deref().unwrap_or("-"),
                    instance.inbox
                );
            }
        }

        InstanceCommand::Remove { value } => {
            if session.del_inbox(&value)? {
                println!("removed {value}");
            } else {
                println!("no instance matched {value}");
            }
        }
    }

    Ok(())
}

fn ban_command(ctx: &Context, command: BanCommand) -> Result<()> {
    let mut session = ctx.store.session();

    match command {
        BanCommand::List => {
            for ban in session.get_domain_bans()? {
                println!("{}\t{}", ban.domain, ban.reason.as_deref().unwrap_or("-"));
            }
        }

        BanCommand::Add { name, reason, note } => {
            session.ban_domain(&name, reason.as_deref(), note.as_deref())?;
            println!("banned {name}");
        }

        BanCommand::Remove { name } => {
            if session.del_domain_ban(&name)? {
                println!("unbanned {name}");
            } else {
                println!("no ban for {name}");
            }
        }
    }

    Ok(())
}

fn software_ban_command(ctx: &Context, command: BanCommand) -> Result<()> {
    let mut session = ctx.store.session();

    match command {
        BanCommand::List => {
            for ban in session.get_software_bans()? {
                println!("{}\t{}", ban.name, ban.reason.as_deref().unwrap_or("-"));
            }
        }

        BanCommand::Add { name, reason, note } => {
            session.put_software_ban(&name, reason.as_deref(), note.as_deref())?;
            println!("banned software {name}");
        }

        BanCommand::Remove { name } => {
            if session.del_software_ban(&name)? {
                println!("unbanned software {name}");
            } else {
                println!("no ban for software {name}");
            }
        }
    }

    Ok(())
}

fn whitelist_command(ctx: &Context, command: WhitelistCommand) -> Result<()> {
    let mut session = ctx.store.session();

    match command {
        WhitelistCommand::List => {
            for entry in session.get_domain_whitelists()? {
                println!("{}", entry.domain);
            }
        }

        WhitelistCommand::Add { domain } => {
            let entry = session.put_domain_whitelist(&domain)?;
            println!("whitelisted {}", entry.domain);
        }

        WhitelistCommand::Remove { domain } => {
            if session.del_domain_whitelist(&domain)? {
                println!("removed {domain} from the whitelist");
            } else {
                println!("{domain} is not whitelisted");
            }
        }
    }

    Ok(())
}

async fn request_command(ctx: &Context, command: RequestCommand) -> Result<()> {
    match command {
        RequestCommand::List => {
            let mut session = ctx.store.session();
            for request in session.get_requests()? {
                println!("{}\t{}", request.domain, request.created);
            }
        }

        RequestCommand::Accept { domain } => {
            let instance = {
                let mut session = ctx.store.session();
                session
                    .put_request_response(&domain, true)?
                    .ok_or_else(|| fedirelay::Error::not_found(format!("request for {domain}")))?
            };

            if let (Some(actor), Some(followid)) = (&instance.actor, &instance.followid) {
                ctx.push_message(
                    instance.inbox.clone(),
                    Message::new_response(&ctx.config.domain, actor, followid, true),
                    Some(instance.clone()),
                );

                if instance.software.as_deref() != Some("mastodon") {
                    ctx.push_message(
                        instance.inbox.clone(),
                        Message::new_follow(&ctx.config.domain, actor),
                        Some(instance.clone()),
                    );
                }
            }

            // wait for the responses to go out before exiting
            ctx.shutdown().await;
            println!("accepted {domain}");
        }

        RequestCommand::Deny { domain } => {
            let instance = {
                let mut session = ctx.store.session();
                session.get_inbox(&domain)?.filter(|i| !i.accepted)
            };

            let Some(instance) = instance else {
                println!("no pending request for {domain}");
                return Ok(());
            };

            {
                let mut session = ctx.store.session();
                session.put_request_response(&domain, false)?;
            }

            if let (Some(actor), Some(followid)) = (&instance.actor, &instance.followid) {
                ctx.push_message(
                    instance.inbox.clone(),
                    Message::new_response(&ctx.config.domain, actor, followid, false),
                    Some(instance.clone()),
                );
            }

            ctx.shutdown().await;
            println!("denied {domain}");
        }
    }

    Ok(())
}

fn user_command(ctx: &Context, command: UserCommand) -> Result<()> {
    let mut session = ctx.store.session();

    match command {
        UserCommand::List => {
            for user in session.get_users()? {
                println!("{}\t{}", user.username, user.handle.as_deref().unwrap_or("-"));
            }
        }

        UserCommand::Create {
            username,
            password,
            handle,
        } => {
            let user = session.put_user(&username, &password, handle.as_deref())?;
            println!("created user {}", user.username);
        }

        UserCommand::Delete { username } => {
            session.del_user(&username)?;
            println!("deleted user {username}");
        }
    }

    Ok(())
}
