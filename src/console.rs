use std::{
    io::{self, BufRead},
    thread,
};

use async_std::{
    channel::{self, Receiver},
    task,
};
use clap::{Parser, Subcommand};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(multicall = true)]
struct Line {
    #[command(subcommand)]
    command: Command,
}

/// A single console command.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    /// Starts (1) or stops (0) accepting remote connections.
    Listen {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        state: Option<u8>,
    },
    /// Shows or changes the maximum number of remote clients.
    Maxplayers { max_clients: Option<u8> },
    /// Shows or changes the port on which remote connections are accepted.
    Port {
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        port: Option<u16>,
    },
    /// Looks for hosts on the local network.
    Slist,
    /// Connects to a host. Without a name, connects to the only host found.
    Connect { host: Option<String> },
    /// Closes the connection to the host.
    Close,
    /// Sends a chat message.
    Say {
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        words: Vec<String>,
    },
    /// Prints network statistics.
    #[command(name = "net_stats")]
    NetStats,
    Quit,
}

/// Parses a single console line. None is returned for blank lines.
pub(crate) fn parse_line(line: &str) -> Result<Option<Command>, clap::Error> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(None);
    }
    Line::try_parse_from(words).map(|line| Some(line.command))
}

/// Spawns a thread forwarding lines of the standard input to the returned
/// channel. The channel is closed once the input ends.
pub(crate) fn spawn_stdin_reader() -> Receiver<String> {
    let (sender, receiver) = channel::unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(error) => {
                    error!("Failed to read the console input: {error}");
                    break;
                }
            };
            if task::block_on(sender.send(line)).is_err() {
                break;
            }
        }
        debug!("Console input closed");
    });
    receiver
}
