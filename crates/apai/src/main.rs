//! The `apai` command-line chat client.

#[macro_use]
extern crate tracing;

use std::fs;
use std::io::{self as std_io, Write as _};
use std::path::{Path, PathBuf};
use std::process::{self, Stdio};
use std::time::Duration;

use anyhow::Context as _;
use apai::command::{self, Command, DEFAULT_INPUT_FILE, HELP};
use apai::core::{AgentError, ContextUsage, StreamFragment};
use apai::environment::{EnvError, Environment};
use apai::render;
use apai::{Session, SessionError};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tokio::io::{self, AsyncBufReadExt, BufReader, Lines, Stdin};

/// A terminal chat client for OpenAI-compatible models.
#[derive(Debug, Parser)]
#[command(name = "apai", version)]
struct Args {
    /// Directory holding `api_bin.toml`, `instr_bin.toml` and
    /// `config.toml`. Logs and saves are written under it too.
    #[arg(long, default_value = ".")]
    dir: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std_io::stderr)
        .init();

    let args = Args::parse();
    println!(
        "{}",
        format!("This is APaI v{}", env!("CARGO_PKG_VERSION"))
            .bold()
            .green()
    );
    println!("{}", "Type 'help' for help.".dimmed().green());

    let env = Environment::load(&args.dir).with_context(|| {
        format!("cannot load configuration from {}", args.dir.display())
    })?;
    let mut repl = Repl {
        session: None,
        env,
        input: BufReader::new(io::stdin()).lines(),
    };
    repl.run().await
}

enum Ask {
    Chat { question: String, file: Option<String> },
    Retry,
}

struct Repl {
    env: Environment,
    // Empty only until a model has been chosen.
    session: Option<Session>,
    input: Lines<BufReader<Stdin>>,
}

impl Repl {
    async fn run(&mut self) -> anyhow::Result<()> {
        while self.env.needs_model() {
            println!(
                "{}",
                render::warning("Please select a model from the following list:")
            );
            println!("{:?}", self.env.model_ids());
            let Some(query) = self.prompt("Model ID: ").await? else {
                return Ok(());
            };
            if let Err(err) = self.env.change_model(query.trim()) {
                println!("{}", render::error(&err.to_string()));
            }
        }
        let session = Session::reinitialize(&self.env)?;
        println!("{}", render::info_table(&session.agent().info()));
        self.session = Some(session);

        loop {
            let Some(line) = self.prompt("> ").await? else {
                break;
            };
            let command = match Command::parse(&line) {
                Ok(Command::Exit) => break,
                Ok(command) => command,
                Err(err) => {
                    println!("{}", render::error(&err.to_string()));
                    match err.command() {
                        "model" => self.print_models(),
                        "instr" => self.print_instructions(),
                        _ => {}
                    }
                    continue;
                }
            };
            if let Err(err) = self.execute(command).await {
                println!("{}", render::error(&format!("{err:#}")));
            }
        }

        println!("{}", "Bye!".bold().green());
        Ok(())
    }

    async fn execute(&mut self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Exit => {}
            Command::Help => print_help(),
            Command::Reset => {
                self.session()?.agent_mut().reset()?;
                println!("{}", render::status("Conversation has been reset."));
            }
            Command::Retry => self.reply(Ask::Retry).await?,
            Command::Undo => {
                self.session()?.agent_mut().undo()?;
                println!("{}", render::status("Last dialog undone."));
            }
            Command::OpenLog => {
                let path = self.session()?.agent().log_path().to_owned();
                if path.exists() {
                    open_path(&path)?;
                    println!("{}", render::status("Log file opened."));
                } else {
                    println!("{}", render::error("Log file not found."));
                }
            }
            Command::CleanLog => {
                self.session()?.agent_mut().clean_log()?;
                println!("{}", render::status("Log file cleaned."));
            }
            Command::Save(name) => {
                let env = &self.env;
                let session = self.session.as_mut().context("no session")?;
                let path = session.save(env, &name)?;
                let msg = format!("Conversation saved to {}.", path.display());
                println!("{}", render::status(&msg));
            }
            Command::Load(name) => self.load(&name)?,
            Command::Model(query) => match self.env.change_model(&query) {
                Ok(model_id) => {
                    self.rebuild(&format!("Model changed to {model_id}."))?;
                }
                Err(EnvError::ModelNotFound(_)) => {
                    let msg = "Model not found, please try again.";
                    println!("{}", render::error(msg));
                    self.print_models();
                }
                Err(err) => return Err(err.into()),
            },
            Command::Instr(query) => match self.env.change_instr_key(&query) {
                Ok(instr_key) => {
                    let msg = format!("Instruction changed to {instr_key}.");
                    self.rebuild(&msg)?;
                }
                Err(EnvError::InstructionNotFound(_)) => {
                    let msg = "Instruction not found, please try again.";
                    println!("{}", render::error(msg));
                    self.print_instructions();
                }
                Err(err) => return Err(err.into()),
            },
            Command::Length(context_len) => {
                self.env.change_context_len(context_len)?;
                self.rebuild(&format!(
                    "Context length changed to {context_len}."
                ))?;
            }
            Command::Markdown => {
                let answer = self.session()?.agent().last_answer();
                if answer.is_empty() {
                    println!("{}", render::error("No answer to render yet."));
                } else {
                    println!("{}", render::markdown(answer));
                }
            }
            Command::File(path) => {
                let Some((file, question)) = self.read_file_input(&path).await?
                else {
                    return Ok(());
                };
                self.reply(Ask::Chat {
                    question,
                    file: Some(file),
                })
                .await?;
            }
            Command::Info => {
                let agent = self.session()?.agent();
                println!("{}", render::info_table(&agent.info()));
                println!("{}", render::context_banner(&agent.context_usage()));
            }
            Command::MultiLine => {
                let text = self.read_multi_line().await?;
                self.send_message(text).await?;
            }
            Command::Chat(text) => self.send_message(text).await?,
        }
        Ok(())
    }

    async fn send_message(&mut self, text: String) -> anyhow::Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let question = match command::check_short_message(&text) {
            Some(question) => question.to_owned(),
            None => {
                let confirm = self
                    .prompt(&render::warning(
                        "Are you sure you want to send this short message? (y/n): ",
                    ))
                    .await?
                    .unwrap_or_default();
                if !confirm.trim().eq_ignore_ascii_case("y") {
                    return Ok(());
                }
                text
            }
        };
        self.reply(Ask::Chat {
            question,
            file: None,
        })
        .await
    }

    async fn reply(&mut self, ask: Ask) -> anyhow::Result<()> {
        let agent = self.session()?.agent_mut();
        let model_id = agent.info().model_id;

        let usage = match &ask {
            Ask::Chat { .. } => {
                let pending = usize::from(agent.conversation().has_pending());
                ContextUsage::new(
                    agent.dialog_count() - pending + 1,
                    agent.info().context_len,
                )
            }
            Ask::Retry => agent.context_usage(),
        };
        if let Ask::Chat { question, file } = &ask {
            println!("{}", render::context_banner(&usage));
            println!("{}", render::question(question, file.is_some()));
        } else if agent.dialog_count() > 0 {
            println!("{}", render::context_banner(&usage));
        }
        println!("{}", render::speaker(&model_id));

        let spinner = thinking_spinner();
        let on_fragment = fragment_printer(spinner.clone());
        let result = match &ask {
            Ask::Chat { question, file } => {
                agent.chat(question, file.as_deref(), on_fragment).await
            }
            Ask::Retry => agent.retry(on_fragment).await,
        }
        .map(|_| ());
        spinner.finish_and_clear();
        println!();

        match result {
            Err(AgentError::ProviderStream { kind, message }) => {
                let msg = format!("Request failed ({kind}): {message}");
                println!("{}", render::error(&msg));
                println!(
                    "{}",
                    "The question is kept, use 'retry' to send it again."
                        .dimmed()
                        .green()
                );
                Ok(())
            }
            result => Ok(result?),
        }
    }

    fn load(&mut self, name: &str) -> anyhow::Result<()> {
        let session = self.session.as_mut().context("no session")?;
        match session.load(&mut self.env, name) {
            Ok(()) => {}
            Err(SessionError::SaveNotFound(path)) => {
                let msg = format!("Save file {} does not exist.", path.display());
                println!("{}", render::error(&msg));
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let path = self.env.save_path(name);
        let msg = format!("Conversation loaded from {}.", path.display());
        println!("{}", render::status(&msg));
        let agent = session.agent();
        println!("{}", render::info_table(&agent.info()));
        if let Some((user, assistant)) = agent.last_exchange() {
            println!("{}", "last dialog:".dimmed().green());
            print!("{}", render::exchange(user, assistant));
        }
        Ok(())
    }

    fn rebuild(&mut self, msg: &str) -> anyhow::Result<()> {
        let session = Session::reinitialize(&self.env)?;
        println!("{}", render::status(msg));
        println!("{}", render::info_table(&session.agent().info()));
        self.session = Some(session);
        Ok(())
    }

    async fn read_file_input(
        &mut self,
        path: &Path,
    ) -> anyhow::Result<Option<(String, String)>> {
        let path = self.env.resolve(path);
        if !path.exists() {
            if path.ends_with(DEFAULT_INPUT_FILE) {
                fs::write(&path, "")
                    .with_context(|| format!("cannot create {}", path.display()))?;
            } else {
                let msg = format!("File {} does not exist.", path.display());
                println!("{}", render::error(&msg));
                return Ok(None);
            }
        }
        open_path(&path)?;
        let msg = format!(
            "{} opened, input your content here and save it\n",
            path.display()
        );
        println!("{}", render::status(&msg));

        let hint = "You can add some content in terminal and press Enter to \
                    continue\n";
        let Some(question) =
            self.prompt(&hint.dimmed().green().to_string()).await?
        else {
            return Ok(None);
        };
        let file = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Ok(Some((file, question)))
    }

    async fn read_multi_line(&mut self) -> anyhow::Result<String> {
        println!("{}", "[Multi-line mode]".magenta());
        let mut lines = Vec::new();
        while let Some(line) = self.input.next_line().await? {
            if line.trim().is_empty() {
                break;
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    async fn prompt(&mut self, prompt: &str) -> anyhow::Result<Option<String>> {
        print!("{prompt}");
        std_io::stdout().flush()?;
        match self.input.next_line().await {
            Ok(line) => Ok(line),
            Err(err) => {
                error!("error reading input: {err}");
                Err(err.into())
            }
        }
    }

    fn session(&mut self) -> anyhow::Result<&mut Session> {
        self.session.as_mut().context("no session")
    }

    fn print_models(&self) {
        println!("{}", "Available models:".yellow());
        println!("{:?}", self.env.model_ids());
    }

    fn print_instructions(&self) {
        println!("{}", "Available instructions:".yellow());
        println!("{:?}", self.env.instr_keys());
    }
}

fn print_help() {
    println!("{}", "Help message:".bold().green());
    let width = HELP.iter().map(|(cmd, _)| cmd.len()).max().unwrap_or(0);
    for (cmd, desc) in HELP {
        println!("{}", format!("{cmd:<width$}  {desc}").green());
    }
    println!(
        "{}",
        "Note: If your first line is empty, multi-line mode will be enabled.\n      \
         In this mode, end your input with a blank line."
            .dimmed()
            .green()
    );
}

fn thinking_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {wide_msg}") {
        spinner.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
    }
    spinner.set_message("🤔 Thinking...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Prints fragments as they arrive, reasoning dimmed, with a blank line
/// where the reasoning ends and the answer begins.
fn fragment_printer(
    spinner: ProgressBar,
) -> impl FnMut(StreamFragment) + Send + 'static {
    let mut in_reasoning = false;
    move |fragment| {
        if !spinner.is_finished() {
            spinner.finish_and_clear();
        }
        let mut stdout = std_io::stdout().lock();
        let written = match fragment {
            StreamFragment::Reasoning(text) => {
                in_reasoning = true;
                write!(stdout, "{}", render::reasoning(&text))
            }
            StreamFragment::Content(text) => {
                let sep = if in_reasoning { "\n\n" } else { "" };
                in_reasoning = false;
                write!(stdout, "{sep}{text}")
            }
        };
        if let Err(err) = written.and_then(|()| stdout.flush()) {
            warn!("cannot write to stdout: {err}");
        }
    }
}

fn open_path(path: &Path) -> anyhow::Result<()> {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut cmd = process::Command::new("cmd");
        cmd.args(["/C", "start", ""]);
        cmd
    } else if cfg!(target_os = "macos") {
        process::Command::new("open")
    } else {
        process::Command::new("xdg-open")
    };
    cmd.arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("cannot open {}", path.display()))?;
    debug!("opened {}", path.display());
    Ok(())
}
