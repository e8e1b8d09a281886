use std::io::Write;
use std::ops::ControlFlow;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use palaver_chat::{ChatRequest, Controller, ConversationId, DispatchContext};
use palaver_llm::{BackendKind, SharedBackend, create_backend};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{
    BuildBackendSnafu, CliResult, ReadInputSnafu, ReadSystemPromptSnafu, SettingsSnafu,
    WriteOutputSnafu,
};
use crate::settings::AppConfig;

pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const SYSTEM_PROMPT_FILE: &str = "system-prompt.txt";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. You are knowledgeable, concise, and always try to provide accurate information.";

const PREVIEW_CHARS: usize = 50;

const HELP: &str = "\
Commands:
  /new             start a new conversation
  /list            list all conversations
  /clear           clear the current conversation
  /delete <id>     delete a conversation
  /summary         summarize the current conversation
  /stats           show statistics
  /switch <name>   switch backend (openai, mock)
  /help            show this help
  quit, exit       leave the chat";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Quit,
    Message(String),
    Command(Command),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New,
    List,
    Clear,
    Delete(Option<String>),
    Summary,
    Stats,
    Switch(Option<String>),
    Help,
    Unknown(String),
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        if line == "quit" || line == "exit" {
            return Self::Quit;
        }
        if !line.starts_with('/') {
            return Self::Message(line.to_string());
        }

        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let argument = parts.next().map(str::to_string);
        let command = match name {
            "/new" => Command::New,
            "/list" => Command::List,
            "/clear" => Command::Clear,
            "/delete" => Command::Delete(argument),
            "/summary" => Command::Summary,
            "/stats" => Command::Stats,
            "/switch" => Command::Switch(argument),
            "/help" => Command::Help,
            other => Command::Unknown(other.to_string()),
        };
        Self::Command(command)
    }
}

/// Reads the system prompt from `explicit`, else `system-prompt.txt`, else the built-in default.
pub fn load_system_prompt(explicit: Option<&Path>) -> CliResult<String> {
    if let Some(path) = explicit {
        let content = std::fs::read_to_string(path).context(ReadSystemPromptSnafu {
            stage: "read-system-prompt-flag",
            path: path.to_path_buf(),
        })?;
        return Ok(content.trim().to_string());
    }

    let fallback = Path::new(SYSTEM_PROMPT_FILE);
    if fallback.exists() {
        match std::fs::read_to_string(fallback) {
            Ok(content) => return Ok(content.trim().to_string()),
            Err(error) => {
                tracing::warn!(error = %error, "failed to read {SYSTEM_PROMPT_FILE}, using default prompt");
            }
        }
    }

    Ok(DEFAULT_SYSTEM_PROMPT.to_string())
}

pub fn build_backend(config: &AppConfig, kind: BackendKind) -> CliResult<SharedBackend> {
    let settings = config.backend_settings_for(kind).context(SettingsSnafu {
        stage: "resolve-backend-settings",
    })?;
    create_backend(settings).context(BuildBackendSnafu {
        stage: "create-backend",
    })
}

/// Interactive state: the controller plus the conversation currently in focus.
pub struct Session {
    controller: Controller,
    config: AppConfig,
    system_prompt: String,
    current: ConversationId,
}

impl Session {
    pub async fn start(controller: Controller, config: AppConfig, system_prompt: String) -> Self {
        let current = controller.create_conversation(Some(&system_prompt)).await.id;
        Self {
            controller,
            config,
            system_prompt,
            current,
        }
    }

    pub fn banner(&self) -> String {
        format!(
            "Backend: {}\nModel: {}\n\nType a message and press Enter. Type 'quit' to exit, /help for commands.\nStarted new conversation: {}\n",
            self.controller.backend().name(),
            self.config.default.model,
            self.current
        )
    }

    /// Handles one line; `Break` ends the session.
    pub async fn handle(&mut self, input: Input) -> ControlFlow<String, String> {
        match input {
            Input::Empty => ControlFlow::Continue(String::new()),
            Input::Quit => ControlFlow::Break("Goodbye!".to_string()),
            Input::Message(text) => ControlFlow::Continue(self.send(text).await),
            Input::Command(command) => ControlFlow::Continue(self.command(command).await),
        }
    }

    async fn send(&mut self, text: String) -> String {
        let request = ChatRequest::new(text)
            .in_conversation(self.current)
            .with_model(self.config.default.model.clone());
        let context = DispatchContext::with_timeout(MESSAGE_TIMEOUT);

        match self.controller.send_message(&context, request).await {
            Ok(response) => {
                let mut output = format!(
                    "{}: {}\n",
                    self.controller.backend().name(),
                    response.message.content
                );
                if let Some(completion) = &response.completion {
                    let usage = completion.usage;
                    output.push_str(&format!(
                        "Tokens: {} prompt + {} completion = {} total\n",
                        usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
                    ));
                }
                output
            }
            Err(error) => format!("Error: {error}\n"),
        }
    }

    async fn command(&mut self, command: Command) -> String {
        match command {
            Command::New => {
                self.current = self
                    .controller
                    .create_conversation(Some(&self.system_prompt))
                    .await
                    .id;
                format!("Started new conversation: {}\n", self.current)
            }
            Command::List => self.list().await,
            Command::Clear => match self.controller.clear_conversation(self.current).await {
                Ok(()) => format!("Cleared conversation {}\n", self.current),
                Err(error) => format!("Error clearing conversation: {error}\n"),
            },
            Command::Delete(None) => "Usage: /delete <id>\n".to_string(),
            Command::Delete(Some(raw)) => self.delete(&raw).await,
            Command::Summary => self.summary().await,
            Command::Stats => self.stats().await,
            Command::Switch(None) => "Usage: /switch <backend>\nAvailable: openai, mock\n".to_string(),
            Command::Switch(Some(name)) => self.switch(&name).await,
            Command::Help => format!("{HELP}\n"),
            Command::Unknown(name) => {
                format!("Unknown command: {name}\nType /help for available commands\n")
            }
        }
    }

    async fn list(&self) -> String {
        let mut conversations = self.controller.list_conversations().await;
        conversations.sort_by_key(|conversation| conversation.created_at);

        let mut output = format!("Conversations ({} total):\n", conversations.len());
        for conversation in conversations {
            let marker = if conversation.id == self.current {
                " [current]"
            } else {
                ""
            };
            output.push_str(&format!(
                "  {}{} - {} messages, updated {}\n",
                conversation.id,
                marker,
                conversation.messages.len(),
                conversation.updated_at.format("%H:%M:%S")
            ));
            if let Some(last) = conversation.last_message_by_role(palaver_llm::Role::User) {
                output.push_str(&format!("    Last: {}\n", preview(&last.content)));
            }
        }
        output
    }

    async fn delete(&mut self, raw: &str) -> String {
        let id = match ConversationId::parse(raw) {
            Ok(id) => id,
            Err(error) => return format!("Error: {error}\n"),
        };
        if let Err(error) = self.controller.delete_conversation(id).await {
            return format!("Error: {error}\n");
        }

        let mut output = format!("Deleted conversation {id}\n");
        if id == self.current {
            self.current = self
                .controller
                .create_conversation(Some(&self.system_prompt))
                .await
                .id;
            output.push_str(&format!("Started new conversation: {}\n", self.current));
        }
        output
    }

    async fn summary(&self) -> String {
        let summary = match self.controller.summary(self.current).await {
            Ok(summary) => summary,
            Err(error) => return format!("Error: {error}\n"),
        };

        let mut output = format!(
            "Conversation {}\n  Messages: {} ({} system, {} user, {} assistant)\n  Estimated tokens: {}\n  Created: {}\n  Updated: {}\n",
            summary.id,
            summary.message_count,
            summary.system_messages,
            summary.user_messages,
            summary.assistant_messages,
            summary.estimated_tokens,
            summary.created_at.format("%Y-%m-%d %H:%M:%S"),
            summary.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
        if let Some(last) = &summary.last_user_message {
            output.push_str(&format!("  Last user: {}\n", preview(last)));
        }
        if let Some(last) = &summary.last_assistant_message {
            output.push_str(&format!("  Last assistant: {}\n", preview(last)));
        }
        output
    }

    async fn stats(&self) -> String {
        let stats = self.controller.stats().await;
        let mut output = format!(
            "Backend: {}\n  Total conversations: {}\n  Total messages: {}\n",
            stats.backend_name, stats.total_conversations, stats.total_messages
        );
        if let (Some(oldest), Some(newest)) = (stats.oldest_conversation, stats.newest_conversation)
        {
            output.push_str(&format!(
                "  Oldest: {}\n  Newest: {}\n",
                oldest.format("%Y-%m-%d %H:%M:%S"),
                newest.format("%Y-%m-%d %H:%M:%S")
            ));
        }

        let available = self
            .controller
            .is_backend_available(&DispatchContext::with_timeout(PROBE_TIMEOUT))
            .await;
        let status = if available { "available" } else { "unavailable" };
        output.push_str(&format!("  Backend status: {status}\n"));
        output
    }

    async fn switch(&mut self, name: &str) -> String {
        let kind = match BackendKind::from_str(name) {
            Ok(kind) => kind,
            Err(_) => return format!("Unknown backend: {name}\n"),
        };
        let backend = match build_backend(&self.config, kind) {
            Ok(backend) => backend,
            Err(error) => return format!("Error: {error}\n"),
        };

        let probe = DispatchContext::with_timeout(PROBE_TIMEOUT);
        let available = tokio::select! {
            biased;
            _ = probe.done() => false,
            available = backend.is_available() => available,
        };
        if !available {
            tracing::warn!(backend = %backend.name(), "backend unavailable, keeping current backend");
            return format!("Backend '{name}' is not available\n");
        }

        let switched = backend.name();
        self.controller.set_backend(backend);
        format!("Switched to {switched} backend\n")
    }
}

/// Drives the session from stdin until EOF or `quit`.
pub async fn run(mut session: Session) -> CliResult<()> {
    println!("{}", session.banner());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        write_prompt(&mut std::io::stdout().lock())?;

        let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-stdin-line",
        })?
        else {
            break;
        };

        match session.handle(Input::parse(&line)).await {
            ControlFlow::Continue(output) => {
                if !output.is_empty() {
                    println!("{output}");
                }
            }
            ControlFlow::Break(output) => {
                println!("{output}");
                break;
            }
        }
    }

    Ok(())
}

fn write_prompt(out: &mut impl Write) -> CliResult<()> {
    out.write_all(b"You: ")
        .and_then(|()| out.flush())
        .context(WriteOutputSnafu {
            stage: "write-input-prompt",
        })
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{head}...")
}
