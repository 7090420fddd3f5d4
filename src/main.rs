use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use tracing::{info, warn};

use lichess_orchestrator::commands::HELP;
use lichess_orchestrator::logger::init_logger;
use lichess_orchestrator::prelude::*;

fn main() -> anyhow::Result<()> {
    let config = Configuration::from_env();
    if config.log() {
        init_logger("lichess-bot")?;
    }
    config.validate()?;

    let client = LichessClient::new(config.url(), config.token()?)?;
    let account = client
        .account()
        .context("could not read the account, check the token")?;
    if account.title.as_deref() != Some("BOT") {
        warn!("{} is not a bot account", account.username);
    }
    info!(user = %account.username, "logged in");

    let manager =
        SessionManager::from_configuration(&config, Arc::new(client), &account.id, UciEngineFactory)?;

    let commands = manager.sender();
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => {
                        if commands.send(Event::Command(command)).is_err() {
                            return;
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            info!("console closed, commands disabled");
        })
        .context("could not start the console thread")?;

    if config.verbose() {
        println!("Logged in as {}. Commands:\n{HELP}", account.username);
    }
    manager.run()
}
