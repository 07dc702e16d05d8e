//! A small command set served by the `pier` binary.
//!
//! Real deployments plug their own [`CommandExecutor`]; these commands exist so the
//! binary is useful on its own and so every output path (plain text, structured output,
//! prompts, failures) can be exercised end to end.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::command::{CommandExecutor, CommandRequest, HelpContext, HelpRenderer, InvocationIo};

pub const PROGRAM: &str = "pier";
pub const UNKNOWN_COMMAND_CODE: i32 = 127;
pub const USAGE_CODE: i32 = 2;

const COMMANDS: &[(&str, &str, &str)] = &[
    ("echo", "echo [words...]", "print the arguments"),
    ("help", "help [command]", "show this help"),
    ("json", "json [key=value...]", "print the arguments as a JSON object"),
    ("prompt", "prompt [question]", "ask for a line without echoing it"),
    ("sleep", "sleep <ms>", "wait, honouring cancellation"),
    ("fail", "fail [code]", "exit with a non-zero code"),
];

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinHelp;

impl HelpRenderer for BuiltinHelp {
    fn render_help(&self, context: &HelpContext<'_>) -> String {
        if let Some(topic) = context.topic {
            if let Some((_, usage, about)) = COMMANDS.iter().find(|(name, _, _)| *name == topic) {
                return format!("usage: {} {usage}\n\n{about}\n", context.program);
            }
        }
        let width = COMMANDS.iter().map(|(_, usage, _)| usage.len()).max().unwrap_or(0);
        let mut text = format!("usage: {} <command> [args...]\n\ncommands:\n", context.program);
        for (_, usage, about) in COMMANDS {
            text.push_str(&format!("  {usage:<width$}  {about}\n"));
        }
        text
    }
}

pub struct BuiltinCommands<H = BuiltinHelp> {
    help: H,
}

impl BuiltinCommands {
    pub fn new() -> Self {
        Self { help: BuiltinHelp }
    }
}

impl Default for BuiltinCommands {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HelpRenderer> BuiltinCommands<H> {
    pub fn with_help(help: H) -> Self {
        Self { help }
    }

    fn help_text(&self, topic: Option<&str>) -> String {
        self.help.render_help(&HelpContext {
            program: PROGRAM,
            topic,
        })
    }
}

#[async_trait]
impl<H: HelpRenderer + 'static> CommandExecutor for BuiltinCommands<H> {
    async fn execute(&self, request: CommandRequest, io: &mut InvocationIo) -> anyhow::Result<i32> {
        let Some((command, args)) = request.args.split_first() else {
            return Ok(0);
        };

        match command.as_str() {
            "echo" => {
                io.stdout(format!("{}\n", args.join(" "))).await?;
                Ok(0)
            }
            "help" => {
                io.stdout(self.help_text(args.first().map(String::as_str))).await?;
                Ok(0)
            }
            "json" => {
                let mut object = serde_json::Map::new();
                for arg in args {
                    let (key, value) = arg.split_once('=').unwrap_or((arg.as_str(), ""));
                    object.insert(key.to_owned(), json!(value));
                }
                let rendered = serde_json::to_string_pretty(&serde_json::Value::Object(object))?;
                io.stdout(format!("{rendered}\n")).await?;
                Ok(0)
            }
            "prompt" => {
                let question = if args.is_empty() {
                    "secret".to_owned()
                } else {
                    args.join(" ")
                };
                io.stdout(format!("{question}: ")).await?;
                io.set_echo(false).await?;
                let answer = io.read_line().await;
                io.set_echo(true).await?;
                match answer {
                    Some(answer) => {
                        io.stdout(format!("\nreceived {} characters\n", answer.chars().count()))
                            .await?;
                        Ok(0)
                    }
                    None => {
                        io.stderr("\nprompt: input closed\n").await?;
                        Ok(1)
                    }
                }
            }
            "sleep" => {
                let Some(millis) = args.first().and_then(|arg| arg.parse::<u64>().ok()) else {
                    io.stderr(self.help_text(Some("sleep"))).await?;
                    return Ok(USAGE_CODE);
                };
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(0),
                    _ = io.cancelled() => Ok(130),
                }
            }
            "fail" => match args.first() {
                None => Ok(1),
                Some(code) => match code.parse::<i32>() {
                    Ok(code) => Ok(code),
                    Err(_) => anyhow::bail!("fail: invalid exit code '{code}'"),
                },
            },
            other => {
                io.stderr(format!(
                    "{PROGRAM}: unknown command '{other}'\n\n{}",
                    self.help_text(None)
                ))
                .await?;
                Ok(UNKNOWN_COMMAND_CODE)
            }
        }
    }
}
