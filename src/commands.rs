//! Operator commands typed on the console.

use std::str::FromStr;

use anyhow::bail;

/// Printed by `help`.
pub const HELP: &str = "\
matchmaking (m)                      challenge other bots, inbound challenges are paused
stop (s)                             stop matchmaking, accept challenges again
tournament (t) ID [TEAM] [PASSWORD]  join a tournament and reserve a slot for it
leave ID                             leave a tournament
quit (q, exit)                       finish running games and exit
help (h)                             this text";

/// One operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Challenges bots from the matchmaking list.
    Matchmaking,
    /// Back to accepting challenges.
    Stop,
    /// Joins a tournament.
    Tournament {
        id: String,
        team: Option<String>,
        password: Option<String>,
    },
    /// Withdraws from a tournament.
    Leave(String),
    /// Graceful exit.
    Quit,
    /// Lists the commands.
    Help,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let Some(name) = words.next() else {
            bail!("empty command");
        };
        let args: Vec<&str> = words.collect();
        let command = match (name.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("matchmaking" | "m", []) => Command::Matchmaking,
            ("stop" | "s", []) => Command::Stop,
            ("tournament" | "t", [id, rest @ ..]) if rest.len() <= 2 => Command::Tournament {
                id: id.to_string(),
                team: rest.first().map(|t| t.to_string()),
                password: rest.get(1).map(|p| p.to_string()),
            },
            ("leave" | "l", [id]) => Command::Leave(id.to_string()),
            ("quit" | "q" | "exit", []) => Command::Quit,
            ("help" | "h", _) => Command::Help,
            _ => bail!("unknown command '{}', try 'help'", s.trim()),
        };
        Ok(command)
    }
}
