mod config;
mod console;
mod logging;

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use clap::{ArgGroup, Parser};

use watch_repl::link::{ProcessLink, SimulatedWatch};
use watch_repl::repl::sync::RandomTokens;
use watch_repl::session::Session;
use watch_repl::{OpResponse, ReplClient, ReplError};

use config::Settings;

#[derive(Debug, Parser)]
#[command(name = "watch_repl", about = "Drive a watch's Python prompt over its console bridge")]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["console", "exec", "eval", "upload", "rtc", "reset"])
))]
struct Cli {
    /// Attach an interactive console (Ctrl-X to exit)
    #[arg(long)]
    console: bool,
    /// Run a program file on the watch
    #[arg(long, value_name = "FILE")]
    exec: Option<PathBuf>,
    /// Evaluate a single expression or statement
    #[arg(long, value_name = "EXPR")]
    eval: Option<String>,
    /// Store a file on the watch under its base name
    #[arg(long, value_name = "FILE")]
    upload: Option<PathBuf>,
    /// Set the watch clock from local time
    #[arg(long)]
    rtc: bool,
    /// Reboot the watch
    #[arg(long)]
    reset: bool,
    /// Device address, forwarded to the transport
    #[arg(long)]
    device: Option<String>,
    /// Echo the raw console traffic
    #[arg(long)]
    verbose: bool,
    /// Print the result as a JSON object
    #[arg(long)]
    json: bool,
    /// Seconds to wait for each reply
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Talk to a simulated watch instead of spawning the transport
    #[arg(long)]
    simulate: bool,
}

#[derive(Debug)]
enum Action<'a> {
    Console,
    Exec(&'a Path),
    Eval(&'a str),
    Upload(&'a Path),
    Rtc,
    Reset,
}

impl Cli {
    fn action(&self) -> Action<'_> {
        if let Some(path) = &self.exec {
            Action::Exec(path)
        } else if let Some(expr) = &self.eval {
            Action::Eval(expr)
        } else if let Some(path) = &self.upload {
            Action::Upload(path)
        } else if self.rtc {
            Action::Rtc
        } else if self.reset {
            Action::Reset
        } else {
            Action::Console
        }
    }

    /// Whether `--exec` should stream program output to stdout itself.
    ///
    /// Under `--verbose` the raw session mirror already prints it.
    fn streams_program_output(&self) -> bool {
        !self.json && !self.verbose
    }
}

fn open_session(cli: &Cli, settings: &Settings) -> Result<Session, ReplError> {
    let session = if cli.simulate {
        Session::new(Box::new(SimulatedWatch::new().link()))
    } else {
        let (program, args) = settings.transport_command(cli.device.as_deref());
        Session::new(Box::new(ProcessLink::spawn(&program, &args)?))
    };
    if !cli.verbose {
        return Ok(session);
    }
    // Keep stdout parseable in JSON mode.
    Ok(if cli.json {
        session.with_mirror(Box::new(io::stderr()))
    } else {
        session.with_mirror(Box::new(io::stdout()))
    })
}

/// Report an operation's outcome and pass its error on.
fn finish(cli: &Cli, result: Result<String, ReplError>, print_output: bool) -> Result<(), ReplError> {
    if cli.json {
        let resp = OpResponse::from_result(&result);
        let out = serde_json::to_string(&resp).unwrap_or_else(|_| {
            "{\"ok\":false,\"output\":\"\",\"error\":\"encode error\"}".to_string()
        });
        println!("{out}");
    } else if let Ok(output) = &result {
        if print_output && !output.is_empty() {
            println!("{output}");
        }
    }
    result.map(|_| ())
}

fn run(cli: &Cli, settings: &Settings) -> Result<(), ReplError> {
    let timeout = cli.timeout.map(Duration::from_secs);
    let cfg = settings.repl_config(timeout, cli.verbose);
    let session = open_session(cli, settings)?;
    let mut client = ReplClient::new(session, Box::new(RandomTokens), cfg);
    client.connect()?;

    match cli.action() {
        Action::Console => {
            client.sync()?;
            return console::run(client.into_session());
        }
        Action::Eval(expr) => {
            let result = client.evaluate(expr);
            finish(cli, result, true)?;
        }
        Action::Exec(path) => {
            if !cli.json {
                println!("Running {}:", path.display());
            }
            if cli.streams_program_output() {
                client.set_output_mirror(Some(Box::new(io::stdout())));
            }
            let result = client.execute_file(path);
            finish(cli, result, false)?;
        }
        Action::Upload(path) => {
            if !cli.json {
                println!("Uploading {}:", path.display());
            }
            let result = client
                .upload_file(path)
                .map(|r| format!("{} lines stored", r.lines_sent));
            finish(cli, result, true)?;
        }
        Action::Rtc => {
            let result = set_and_check_clock(&mut client);
            finish(cli, result, true)?;
        }
        Action::Reset => {
            // The device reboots; there is nothing left to release.
            let result = client.reset().map(|()| String::new());
            return finish(cli, result, false);
        }
    }

    client.release()
}

fn set_and_check_clock(client: &mut ReplClient) -> Result<String, ReplError> {
    client.set_clock()?;
    let reported = client.read_clock()?;
    let delta = (reported - Local::now().naive_local()).num_seconds();
    Ok(format!("Watch reports time as: {reported} (delta {delta}s)"))
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = run(&cli, &settings) {
        let _ = io::stdout().flush();
        eprintln!("error: {e}");
        if let ReplError::Timeout { buffered, .. } = &e {
            if cli.verbose && !buffered.is_empty() {
                eprintln!("last output:\n{buffered}");
            }
        }
        std::process::exit(e.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_action_is_required() {
        assert!(Cli::try_parse_from(["watch_repl"]).is_err());
        assert!(Cli::try_parse_from(["watch_repl", "--rtc", "--reset"]).is_err());
        let cli = Cli::try_parse_from(["watch_repl", "--eval", "1+1", "--device", "AA"]).unwrap();
        assert!(matches!(cli.action(), Action::Eval("1+1")));
        assert_eq!(cli.device.as_deref(), Some("AA"));
    }

    #[test]
    fn exec_output_is_printed_once() {
        let plain = Cli::try_parse_from(["watch_repl", "--exec", "app.py"]).unwrap();
        assert!(plain.streams_program_output());
        let verbose = Cli::try_parse_from(["watch_repl", "--exec", "app.py", "--verbose"]).unwrap();
        assert!(!verbose.streams_program_output());
        let json = Cli::try_parse_from(["watch_repl", "--exec", "app.py", "--json"]).unwrap();
        assert!(!json.streams_program_output());
    }

    #[test]
    fn simulated_eval_round_trip() {
        let cli = Cli::try_parse_from(["watch_repl", "--simulate", "--eval", "1+1"]).unwrap();
        run(&cli, &Settings::default()).unwrap();
    }

    #[test]
    fn simulated_reset_skips_release() {
        let cli = Cli::try_parse_from(["watch_repl", "--simulate", "--reset"]).unwrap();
        run(&cli, &Settings::default()).unwrap();
    }
}
