use crate::control::{BulkReport, Supervisor, Target};
use crate::parse::split_env_entry;
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{error::ReadlineError, Config, Context, Editor, Helper};
use std::path::Path;
use std::time::Duration;
use tokio::runtime::Handle;

const COMMANDS: &[&str] = &[
    "register", "timeout", "start", "stop", "status", "logs", "follow", "help", "exit",
];

const HELP: &str = "\
register <name> <path> [KEY=VALUE..]  register or replace a service
timeout <ms>                          grace period for every start
start [name|all] [KEY=VALUE..]        start one service or all of them
stop [name|all]                       kill one service or all of them
status [name|all]                     show running state
logs <name>                           print the buffered log
follow <name>                         stream new log lines
exit                                  leave the shell";



/*
    @@@
    @CmdCompleter;
    . Prefix-based tab completion of the first word against the command list.
*/
struct CmdCompleter {
    commands: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>), ReadlineError> {
        let typed = &line[..pos];
        if typed.contains(' ') {
            return Ok((pos, Vec::new()));
        }
        let matches = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(typed))
            .map(|cmd| Pair {
                display: cmd.clone(),
                replacement: cmd.clone(),
            })
            .collect();
        Ok((0, matches))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Register {
        name: String,
        executable: String,
        env: Vec<String>,
    },
    Timeout(Duration),
    Start { target: Target, env: Vec<String> },
    Stop(Target),
    Status(Target),
    Logs(String),
    Follow(String),
    Help,
    Exit,
}

fn env_args(args: &[&str]) -> Result<Vec<String>, String> {
    args.iter()
        .map(|entry| {
            split_env_entry(entry)
                .map(|_| entry.to_string())
                .map_err(|e| e.to_string())
        })
        .collect()
}

/// Parse one shell line. Blank lines parse to `None`.
pub fn parse_command(line: &str) -> Result<Option<ShellCommand>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = words.split_first() else {
        return Ok(None);
    };

    let command = match (cmd, args) {
        ("register", [name, executable, env @ ..]) => ShellCommand::Register {
            name: name.to_string(),
            executable: executable.to_string(),
            env: env_args(env)?,
        },
        ("register", _) => return Err("usage: register <name> <path> [KEY=VALUE..]".into()),
        ("timeout", [ms]) => {
            let ms: u64 = ms.parse().map_err(|_| format!("invalid timeout `{}`", ms))?;
            ShellCommand::Timeout(Duration::from_millis(ms))
        }
        ("timeout", _) => return Err("usage: timeout <ms>".into()),
        ("start", []) => ShellCommand::Start { target: Target::All, env: Vec::new() },
        ("start", [target, env @ ..]) => ShellCommand::Start {
            target: Target::parse(target),
            env: env_args(env)?,
        },
        ("stop", []) => ShellCommand::Stop(Target::All),
        ("stop", [target]) => ShellCommand::Stop(Target::parse(target)),
        ("status", []) => ShellCommand::Status(Target::All),
        ("status", [target]) => ShellCommand::Status(Target::parse(target)),
        ("logs", [name]) => ShellCommand::Logs(name.to_string()),
        ("follow", [name]) => ShellCommand::Follow(name.to_string()),
        ("help", _) => ShellCommand::Help,
        ("exit", _) | ("quit", _) => ShellCommand::Exit,
        _ => return Err(format!("Unknown command: {}", line.trim())),
    };
    Ok(Some(command))
}

/// Run one command against the supervisor. Returns false when the shell should exit.
pub async fn execute(sup: &Supervisor, command: ShellCommand) -> bool {
    match command {
        ShellCommand::Register { name, executable, env } => {
            sup.register_service(&name, &executable, env).await;
            println!("Registered `{}`", name);
        }
        ShellCommand::Timeout(timeout) => {
            sup.set_spawn_timeout(timeout).await;
            println!("Spawn timeout set to {:?}", timeout);
        }
        ShellCommand::Start { target: Target::All, env } => print_report("started", &sup.start_all(env).await),
        ShellCommand::Start { target, env } => match sup.start(&target, env).await {
            Ok(()) => println!("Started {}", describe(&target)),
            Err(e) => eprintln!("Error: {}", e),
        },
        ShellCommand::Stop(Target::All) => print_report("stopped", &sup.stop_all().await),
        ShellCommand::Stop(target) => match sup.stop(&target).await {
            Ok(()) => println!("Stopped {}", describe(&target)),
            Err(e) => eprintln!("Error: {}", e),
        },
        ShellCommand::Status(target) => {
            let status = sup.get_status(&target).await;
            match serde_yaml::to_string(&status) {
                Ok(text) => print!("{}", text),
                Err(e) => eprintln!("Error: {}", e),
            }
        }
        ShellCommand::Logs(name) => {
            for line in sup.log_snapshot(&name).await {
                println!("{}", line);
            }
        }
        ShellCommand::Follow(name) => {
            let (id, mut rx) = sup.subscribe(&name).await;
            println!("Following `{}` (subscriber {})", name, id);
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    println!("[{}] {}", name, line);
                }
            });
        }
        ShellCommand::Help => println!("{}", HELP),
        ShellCommand::Exit => return false,
    }
    true
}

fn print_report(verb: &str, report: &BulkReport) {
    if report.is_empty() {
        println!("No services registered");
    }
    for (name, outcome) in report.outcomes() {
        match outcome {
            Ok(()) => println!("{}: {}", name, verb),
            Err(e) => println!("{}: {}", name, e),
        }
    }
}

fn describe(target: &Target) -> String {
    match target {
        Target::All => String::from("all services"),
        Target::Service(name) => format!("`{}`", name),
    }
}



/*
    @@@
    @run_shell();
    . Blocking line editor with completion and history kept at <log_dir>/history.txt.
    . Meant for a blocking thread: commands are driven to completion on `rt`.
    . History is appended after every line, so nothing is lost if the process
      is torn down while the prompt is waiting.
    . Ctrl-C, Ctrl-D and `exit` leave the loop.
*/
pub fn run_shell(sup: Supervisor, log_dir: &str, rt: Handle) -> rustyline::Result<()> {
    let config = Config::builder().build();
    let mut rl = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter {
        commands: COMMANDS.iter().map(|c| c.to_string()).collect(),
    }));
    let history = Path::new(log_dir).join("history.txt");
    if let Some(dir) = history.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let _ = rl.load_history(&history);

    loop {
        let line = rl.readline("warden> ");
        match line {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                rl.add_history_entry(input)?;
                rl.append_history(&history)?;
                match parse_command(input) {
                    Ok(Some(command)) => {
                        if !rt.block_on(execute(&sup, command)) {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => println!("{}", msg),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    rl.save_history(&history)?;
    Ok(())
}
