//! Operator tool for inspecting and clearing shared sessions and locks.
//!
//! ```text
//! guardctl resolve <token>
//! guardctl invalidate <caller-type> <binding-key>
//! guardctl logout <token>
//! guardctl unlock <key>
//! ```

use log::info;
use redis::Client as RedisClient;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use shared_guard::identity::IdentityRepository;
use shared_guard::lock::{LockClient, RedisLockClient};
use shared_guard::settings::Settings;
use shared_guard::store::RedisSessionStore;

const USAGE: &str = "usage: guardctl <resolve TOKEN | invalidate TYPE KEY | logout TOKEN | unlock KEY>";

enum Command {
    Resolve(String),
    Invalidate { caller_type: String, binding_key: String },
    Logout(String),
    Unlock(String),
}

fn parse_command(args: &[String]) -> Option<Command> {
    match args {
        [cmd, token] if cmd == "resolve" => Some(Command::Resolve(token.clone())),
        [cmd, caller_type, binding_key] if cmd == "invalidate" => Some(Command::Invalidate {
            caller_type: caller_type.clone(),
            binding_key: binding_key.clone(),
        }),
        [cmd, token] if cmd == "logout" => Some(Command::Logout(token.clone())),
        [cmd, key] if cmd == "unlock" => Some(Command::Unlock(key.clone())),
        _ => None,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = parse_command(&args) else {
        eprintln!("{}", USAGE);
        return Ok(ExitCode::from(2));
    };

    let settings = Settings::from_env()?;
    let redis_client = Arc::new(RedisClient::open(settings.redis_url.as_str())?);
    info!("Using Redis at {}", settings.redis_url);

    match command {
        Command::Resolve(token) => {
            let repository = repository(&settings, redis_client)?;
            match repository.authenticate(&token).await {
                Ok(context) => println!("{}", serde_json::to_string_pretty(&context)?),
                Err(e) if e.is_unauthenticated() => {
                    println!("not authenticated: {}", e);
                    return Ok(ExitCode::from(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Invalidate {
            caller_type,
            binding_key,
        } => {
            let repository = repository(&settings, redis_client)?;
            let removed = repository.invalidate(&caller_type, &binding_key).await?;
            println!("{}", if removed { "invalidated" } else { "no session" });
        }
        Command::Logout(token) => {
            let repository = repository(&settings, redis_client)?;
            let removed = repository.logout(&token).await?;
            println!("{}", if removed { "logged out" } else { "token not current" });
        }
        Command::Unlock(key) => {
            let locks = RedisLockClient::new(redis_client, &settings.lock.key_prefix);
            let removed = locks.force_release(&key).await?;
            println!("{}", if removed { "unlocked" } else { "not locked" });
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn repository(
    settings: &Settings,
    redis_client: Arc<RedisClient>,
) -> Result<IdentityRepository, Box<dyn std::error::Error>> {
    let cipher = settings.build_cipher()?;
    Ok(IdentityRepository::new(
        Arc::new(RedisSessionStore::new(redis_client)),
        Arc::new(cipher),
        settings.caller_types.clone(),
    ))
}
