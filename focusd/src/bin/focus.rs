use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};

/// Command-line client for focusd.
#[derive(Parser)]
#[command(name = "focus")]
struct Args {
    /// Address of the daemon
    #[arg(long, default_value = "127.0.0.1:9870")]
    daemon: SocketAddr,
    #[command(subcommand)]
    command: ClientCommand,
}

#[derive(Subcommand)]
enum ClientCommand {
    /// Connect the daemon to the focuser
    Init,
    /// Disconnect from the focuser
    Shutdown,
    /// Move to an absolute step position and wait for the move to finish
    Set { steps: i32 },
    /// Move by a step offset and wait for the move to finish
    Offset { delta: i32 },
    /// Halt the focuser wherever it is
    Stop,
    /// Declare the current position to be step 0
    Zero,
    /// Switch the tube fans
    Fans { state: Switch },
    /// Print the daemon's status report
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl ClientCommand {
    fn request(&self) -> Value {
        match self {
            ClientCommand::Init => json!({"method": "initialize"}),
            ClientCommand::Shutdown => json!({"method": "shutdown"}),
            ClientCommand::Set { steps } => json!({"method": "set_focus", "steps": steps}),
            ClientCommand::Offset { delta } => {
                json!({"method": "set_focus", "steps": delta, "offset": true})
            }
            ClientCommand::Stop => json!({"method": "stop"}),
            ClientCommand::Zero => json!({"method": "reset_home_position"}),
            ClientCommand::Fans { state } => {
                json!({"method": "enable_fans", "enabled": matches!(state, Switch::On)})
            }
            ClientCommand::Status => json!({"method": "report_status"}),
        }
    }
}

fn exchange(daemon: SocketAddr, request: &Value) -> Result<Value> {
    let stream = TcpStream::connect(daemon)
        .with_context(|| format!("failed to connect to focusd at {daemon}"))?;
    let mut writer = stream.try_clone().context("failed to clone the connection")?;
    writeln!(writer, "{request}").context("failed to send the request")?;
    let mut reply = String::new();
    BufReader::new(stream)
        .read_line(&mut reply)
        .context("failed to read the reply")?;
    serde_json::from_str(&reply).context("the daemon sent an unparseable reply")
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let reply = exchange(args.daemon, &args.command.request())?;

    if matches!(args.command, ClientCommand::Status) {
        println!("{}", serde_json::to_string_pretty(&reply)?);
        return Ok(ExitCode::SUCCESS);
    }

    match reply.get("status").and_then(Value::as_str) {
        Some("succeeded") => {
            println!("succeeded");
            Ok(ExitCode::SUCCESS)
        }
        Some(status) => {
            println!("{status}");
            Ok(ExitCode::FAILURE)
        }
        None => {
            println!("{reply}");
            Ok(ExitCode::FAILURE)
        }
    }
}
